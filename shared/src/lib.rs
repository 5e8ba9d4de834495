//! Types and wire format shared by every node of a snake session
//!
//! A session has no dedicated server: one node is the MASTER and runs the
//! simulation, the others replicate its snapshots. This crate holds what they
//! all have to agree on: the game entities, the session configuration and the
//! datagram codec.

mod config;
mod message;
mod model;

pub use config::{
    ConfigError, GameConfig, FOOD_STATIC_RANGE, HEIGHT_RANGE, STATE_DELAY_RANGE, WIDTH_RANGE,
};
pub use message::{CodecError, Envelope, Payload, MAX_DATAGRAM_SIZE};
pub use model::{
    is_reverse_direction, Coord, Direction, GameAnnouncement, GameSnapshot, NodeRole, Player,
    PlayerKind, Snake, SnakeState,
};

use std::net::{Ipv4Addr, SocketAddrV4};

/// Well-known multicast group every node joins for announcements
pub const MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 9999);

/// Side length of the empty square a new snake needs
pub const SPAWN_BLOCK_SIZE: i32 = 5;

/// How many candidate blocks a placement tries before giving up
pub const SPAWN_ATTEMPTS: usize = 100;
