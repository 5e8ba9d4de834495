//! # Snake Arena Node Library
//!
//! This library implements one participant of a serverless multiplayer snake
//! session on a local network. Every process runs the same code; which part of
//! it is active depends on the role the node currently holds.
//!
//! ## Core Responsibilities
//!
//! ### Discovery
//! A MASTER multicasts an announcement of its session once per second. Every
//! node listens on the group and keeps a table of sessions it has heard of,
//! together with the unicast address the announcement came from.
//!
//! ### Authoritative Simulation
//! The MASTER alone advances the game. Each tick it applies buffered steer
//! intents, moves snakes on the toroidal field, resolves collisions and tops up
//! food, then sends the full resulting snapshot to every other player. Followers
//! never simulate; they replace their view with the newest snapshot they get.
//!
//! ### Liveness and Failover
//! Every unicast datagram refreshes per-peer activity timestamps. Idle peers
//! are pinged, silent peers are reaped. When the MASTER goes silent, the DEPUTY
//! promotes itself from its last snapshot and tells everybody; other followers
//! redirect their traffic to the DEPUTY in the meantime.
//!
//! ## Roles
//!
//! - **MASTER**: hosts the session, runs the coordinator, answers JOIN
//! - **DEPUTY**: a NORMAL appointed by the MASTER as its successor
//! - **NORMAL**: plays and replicates snapshots
//! - **VIEWER**: replicates snapshots without a snake
//!
//! ## Module Organization
//!
//! ### Engine (`field`, `game`)
//! Pure, deterministic simulation without I/O:
//! - Toroidal geometry and 5×5 spawn blocks
//! - Steering, movement, growth and scoring
//! - Simultaneous collision resolution with zombie snakes
//! - Food replenishment and snake placement
//!
//! ### Coordinator (`coordinator`, `ids`)
//! MASTER-side owner of the engine. Joins, steers and timeouts arrive as
//! commands between ticks; snapshots leave as immutable shared values.
//!
//! ### Liveness (`activity`, `failover`)
//! Activity timestamps per peer and the pure decision of what to do when one
//! of them goes silent.
//!
//! ### Session Manager (`network`, `session`, `transport`)
//! Sockets, receive loops, message handlers and the per-node view of the
//! session. [`Node`] is the public entry point.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use node::{Node, NodeConfig};
//! use shared::{Direction, GameConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the unicast and multicast sockets and start listening
//!     let node = Node::bind(NodeConfig::default()).await?;
//!
//!     // Create a 15x15 session with one static food and a 200ms tick
//!     let config = GameConfig::new(15, 15, 1, 200)?;
//!     let player_id = node.host("arena", "alice", config).await?;
//!     println!("hosting as player {}", player_id);
//!
//!     // Forward input from whatever UI drives this node
//!     node.steer(Direction::Up).await?;
//!
//!     // Render from the latest snapshot
//!     if let Some(view) = node.view().await {
//!         println!("tick {} with {} snakes", view.tick, view.snakes.len());
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Known Limitations
//!
//! Failover is leader-driven and best effort. It assumes at most one failure
//! per detection window; a network partition can leave two nodes that both
//! consider themselves MASTER.

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failover;
pub mod field;
pub mod game;
pub mod ids;
pub mod network;
pub mod session;
pub mod transport;

pub use config::{GameArgs, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use game::Engine;
pub use ids::{IdGenerator, RandomIds, SequentialIds};
pub use network::Node;
pub use session::{FrameView, SessionInfo};
