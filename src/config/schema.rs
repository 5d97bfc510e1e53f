use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
}

/// Settings for the backend probe binary
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Query sent after the ignorable ping; empty disables it
    #[serde(default = "default_probe_query")]
    pub query: String,
    /// How long to wait for a complete reply
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_query() -> String {
    "SELECT 1".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            query: default_probe_query(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Display name; defaults to host:port
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Send a proxy-protocol v1 header before any MySQL bytes
    #[serde(default)]
    pub proxy_protocol: bool,
    /// TLS to the backend; currently refused at connection setup
    #[serde(default)]
    pub ssl: bool,
    /// Connection may be pooled; COM_QUIT is swallowed to keep it alive
    #[serde(default)]
    pub persistent: bool,
    /// Negotiate session-state tracking when the server offers it
    #[serde(default = "default_session_track")]
    pub session_track: bool,
}

fn default_port() -> u16 {
    3306
}

fn default_session_track() -> bool {
    true
}

impl BackendConfig {
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.name.clone()
        }
    }
}
