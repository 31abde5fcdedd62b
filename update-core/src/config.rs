/// Receiver options, set once when the update manager is created
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_PORT: u16 = 54322;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionOptions {
    /// UDP port the receiver binds to
    pub listen_port: u16,
    /// Switch boot partition and restart once the final chunk is acknowledged
    pub auto_restart: bool,
    /// Wait between the final acknowledgement and the restart
    pub restart_delay_ms: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            auto_restart: true,
            restart_delay_ms: 0,
        }
    }
}

impl SessionOptions {
    pub fn restart_delay(&self) -> core::time::Duration {
        core::time::Duration::from_millis(u64::from(self.restart_delay_ms))
    }
}
