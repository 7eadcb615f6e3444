// Relay server configuration from the environment, with development
// defaults.

use std::net::SocketAddr;

pub const DEFAULT_PORT: u16 = 1999;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Comma-separated CORS origins, or `"*"`. Unset allows any origin.
    pub cors_origins: Option<String>,
    /// Log filter directive, used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl RelayConfig {
    /// | Variable | Default |
    /// |---|---|
    /// | `COWRITE_RELAY_HOST` | `0.0.0.0` |
    /// | `COWRITE_RELAY_PORT` | `1999` |
    /// | `COWRITE_RELAY_CORS_ORIGINS` | *(none)* |
    /// | `COWRITE_RELAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COWRITE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("COWRITE_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let cors_origins =
            env("COWRITE_RELAY_CORS_ORIGINS").ok().filter(|origins| !origins.trim().is_empty());
        let log_filter = env("COWRITE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, cors_origins, log_filter }
    }
}
