use crate::error::ServerError;

/// Relay configuration, loaded from the environment. Startup is fatal if any
/// variable is absent.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub cert_path: String,
    pub key_path: String,
    pub db_name: String,
    pub db_key: String,
    /// Empty string logs to stderr instead of a file.
    pub log_path: String,
    pub log_max_bytes: u64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServerError> {
        Ok(Self {
            hostname: require("BURROW_SERVER_HOSTNAME")?,
            port: require("BURROW_SERVER_PORT")?
                .parse()
                .map_err(|e| ServerError::Config(format!("BURROW_SERVER_PORT: {e}")))?,
            cert_path: require("BURROW_CERT_PATH")?,
            key_path: require("BURROW_KEY_PATH")?,
            db_name: require("BURROW_SERVER_DB_NAME")?,
            db_key: require("BURROW_SERVER_DB_KEY")?,
            log_path: require("BURROW_LOG_PATH")?,
            log_max_bytes: require("BURROW_LOG_MAX_BYTES")?
                .parse()
                .map_err(|e| ServerError::Config(format!("BURROW_LOG_MAX_BYTES: {e}")))?,
        })
    }
}

fn require(name: &str) -> Result<String, ServerError> {
    std::env::var(name)
        .map_err(|_| ServerError::Config(format!("missing environment variable {name}")))
}
