use clap::Parser;
use std::fmt;
use std::net::SocketAddr;

/// CLI arguments for the relay server.
#[derive(Parser, Clone)]
#[command(name = "devrelay")]
#[command(about = "WebSocket relay between IoT devices and controllers")]
#[command(version)]
pub struct Args {
    /// Socket address to accept WebSocket connections on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "DEVRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the health and metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "DEVRELAY_HEALTH_ADDR")]
    pub health_addr: SocketAddr,
    /// Shared secret every client must present in its `auth` message.
    #[arg(long, env = "DEVRELAY_TOKEN", hide_env_values = true)]
    pub token: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "DEVRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "DEVRELAY_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Seconds a new connection has to send its `auth` message.
    #[arg(long, default_value = "10", env = "DEVRELAY_AUTH_TIMEOUT")]
    pub auth_timeout: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address to accept WebSocket connections on.
    pub listen: SocketAddr,
    /// Socket address for the health and metrics endpoint.
    pub health_addr: SocketAddr,
    /// Shared secret every client must present.
    pub token: String,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Handshake timeout in seconds.
    pub auth_timeout: u64,
}

/// Upper bound on `max_payload` (16 MiB).
const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.token.is_empty() {
            return Err("token must not be empty".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({MAX_ALLOWED_PAYLOAD} bytes)"
            ));
        }

        if self.auth_timeout == 0 {
            return Err("auth_timeout must be greater than 0".to_string());
        }
        if self.auth_timeout > 300 {
            return Err("auth_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("health_addr", &self.health_addr)
            .field("token", &"<redacted>")
            .field("max_conns", &self.max_conns)
            .field("max_payload", &self.max_payload)
            .field("auth_timeout", &self.auth_timeout)
            .finish()
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            health_addr: args.health_addr,
            token: args.token,
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            auth_timeout: args.auth_timeout,
        }
    }
}
