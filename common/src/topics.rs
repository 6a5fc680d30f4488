pub const TOPIC_TEMPERATURE: &str = "esp32/temperature";
pub const TOPIC_HALL: &str = "esp32/hall";

pub const TOPIC_LED: &str = "esp32/led";

/// Topics that must be (re-)subscribed every time a session is established.
pub const REQUIRED_SUBSCRIPTIONS: &[&str] = &[TOPIC_LED];
