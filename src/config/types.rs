use serde::{Deserialize, Serialize};

use crate::sandbox::{Capability, CapabilityPolicy};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3002;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeletConfig {
    pub server: ServerConfig,
    pub policy: CapabilityPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Values from flags or the environment. Each one that is set wins over the
/// file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_code_length: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub allow_network: Option<bool>,
}

impl CodeletConfig {
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(max) = overrides.max_code_length {
            self.policy.max_code_length = max;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.policy.timeout_ms = timeout_ms;
        }
        match overrides.allow_network {
            Some(true) => {
                self.policy.denied.remove(&Capability::Network);
            }
            Some(false) => {
                self.policy.denied.insert(Capability::Network);
            }
            None => {}
        }
    }
}
