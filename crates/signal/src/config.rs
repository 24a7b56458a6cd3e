use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u64,
    pub clean_session: bool,
    /// Call room shared by both participants; maps to `call/<room>/signal`.
    pub room: String,
    /// Pause between reconnection attempts after the broker link drops.
    pub reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            room: "lobby".to_string(),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}
