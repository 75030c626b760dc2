//! Gateway configuration
//!
//! Parsed once at startup from the command line, with every option also
//! readable from an environment variable. The bind address stays the first
//! positional argument.

use clap::Parser;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default capacity of each session's outbound queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Default buffer size for registry control commands
pub const DEFAULT_CONTROL_CAPACITY: usize = 256;

/// Runtime configuration for one gateway process
#[derive(Debug, Clone, Parser)]
#[command(name = "chat_gateway", version, about = "Multi-device WebSocket delivery gateway")]
pub struct GatewayConfig {
    /// Socket bind address
    #[arg(env = "GATEWAY_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Outbound queue capacity per session
    #[arg(
        long,
        env = "OUTBOUND_QUEUE_CAPACITY",
        default_value_t = DEFAULT_OUTBOUND_CAPACITY,
        value_parser = parse_capacity
    )]
    pub outbound_capacity: usize,

    /// Registry control channel capacity
    #[arg(
        long,
        env = "CONTROL_CHANNEL_CAPACITY",
        default_value_t = DEFAULT_CONTROL_CAPACITY,
        value_parser = parse_capacity
    )]
    pub control_capacity: usize,

    /// Shared broker URL (used with the `redis` feature)
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: Option<String>,

    /// Optional JSON seed for the in-memory store
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
            broker_url: None,
            seed_file: None,
        }
    }
}

impl GatewayConfig {
    /// Parse the process arguments and environment
    ///
    /// Exits with usage on invalid input, like any clap binary.
    pub fn load() -> Self {
        Self::parse().normalized()
    }

    /// Treat empty optional values as unset
    fn normalized(mut self) -> Self {
        self.broker_url = self.broker_url.filter(|v| !v.is_empty());
        self.seed_file = self.seed_file.filter(|v| !v.is_empty());
        self
    }
}

/// Positive channel capacity (tokio channels reject zero)
fn parse_capacity(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err("capacity must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
