//! Node and session settings

use clap::Args;
use shared::{ConfigError, GameConfig, MULTICAST_GROUP};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// How often a MASTER re-broadcasts its announcement
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Announcements older than this drop out of the session list
pub const SESSION_EXPIRY: Duration = Duration::from_secs(3);

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket-level settings of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Unicast bind address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    /// Group for announcements; `None` disables discovery
    pub multicast_group: Option<SocketAddrV4>,
    pub join_timeout: Duration,
}

impl NodeConfig {
    /// Loopback-only node without discovery
    pub fn loopback() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            multicast_group: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            multicast_group: Some(MULTICAST_GROUP),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Session parameters as given on the command line
#[derive(Args, Debug, Clone)]
pub struct GameArgs {
    /// Field width in cells
    #[arg(long, default_value_t = 15)]
    pub width: i32,
    /// Field height in cells
    #[arg(long, default_value_t = 15)]
    pub height: i32,
    /// Food kept on the field on top of one per live snake
    #[arg(long, default_value_t = 1)]
    pub food: i32,
    /// Tick interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub delay: i32,
}

impl GameArgs {
    pub fn to_config(&self) -> Result<GameConfig, ConfigError> {
        GameConfig::new(self.width, self.height, self.food, self.delay)
    }
}
