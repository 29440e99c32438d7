use std::env;
use std::time::Duration;

use crate::controller::SessionOptions;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:5000/ws";
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub relay_url: String,
    pub admission_control: bool,
    pub leave_grace: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            admission_control: false,
            leave_grace: Duration::from_millis(3000),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let ice_servers = lookup("BEACH_CALL_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Self {
            relay_url: lookup("BEACH_CALL_RELAY_URL").unwrap_or(defaults.relay_url),
            admission_control: lookup("BEACH_CALL_ADMISSION")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.admission_control),
            leave_grace: lookup("BEACH_CALL_LEAVE_GRACE_MS")
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.leave_grace),
            ice_servers,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            admission_control: self.admission_control,
            leave_grace: self.leave_grace,
        }
    }
}
