use log::warn;

use crate::{
    config::TelemetryConfig,
    error::DriverError,
    platform::SensorSource,
    topics::{TOPIC_HALL, TOPIC_TEMPERATURE},
    types::{Reading, TelemetrySample},
};

/// Raw sensor units to degrees Celsius.
pub type TemperatureConversion = fn(u8) -> f32;

/// The rough Fahrenheit-to-Celsius mapping commonly applied to the ESP32's
/// internal sensor. Uncalibrated.
pub fn approximate_celsius(raw: u8) -> f32 {
    (f32::from(raw) - 32.0) / 1.8
}

pub struct TemperatureSource<F> {
    read_raw: F,
    convert: TemperatureConversion,
}

impl<F> TemperatureSource<F>
where
    F: FnMut() -> Result<u8, DriverError>,
{
    pub fn new(read_raw: F, convert: TemperatureConversion) -> Self {
        Self { read_raw, convert }
    }
}

impl<F> SensorSource for TemperatureSource<F>
where
    F: FnMut() -> Result<u8, DriverError>,
{
    fn topic(&self) -> &'static str {
        TOPIC_TEMPERATURE
    }

    fn read(&mut self) -> Result<Reading, DriverError> {
        let raw = (self.read_raw)()?;
        Ok(Reading::Decimal((self.convert)(raw)))
    }
}

pub struct HallSource<F> {
    read: F,
}

impl<F> HallSource<F>
where
    F: FnMut() -> Result<i32, DriverError>,
{
    pub fn new(read: F) -> Self {
        Self { read }
    }
}

impl<F> SensorSource for HallSource<F>
where
    F: FnMut() -> Result<i32, DriverError>,
{
    fn topic(&self) -> &'static str {
        TOPIC_HALL
    }

    fn read(&mut self) -> Result<Reading, DriverError> {
        (self.read)().map(Reading::Integer)
    }
}

/// Fixed-cadence sampler. Samples live for one tick only.
pub struct TelemetryScheduler {
    interval_ms: u64,
    last_fire_ms: u64,
    sources: Vec<Box<dyn SensorSource>>,
}

impl TelemetryScheduler {
    pub fn new(config: &TelemetryConfig, sources: Vec<Box<dyn SensorSource>>) -> Self {
        Self {
            interval_ms: config.interval_ms,
            last_fire_ms: 0,
            sources,
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<Vec<TelemetrySample>> {
        if now_ms.saturating_sub(self.last_fire_ms) < self.interval_ms {
            return None;
        }
        self.last_fire_ms = now_ms;

        let samples = self
            .sources
            .iter_mut()
            .filter_map(|source| match source.read() {
                Ok(value) => Some(TelemetrySample {
                    topic: source.topic(),
                    value,
                    timestamp_ms: now_ms,
                }),
                Err(err) => {
                    warn!("failed to read sensor for `{}`: {err}", source.topic());
                    None
                }
            })
            .collect();

        Some(samples)
    }
}
