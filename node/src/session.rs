//! Per-node session bookkeeping
//!
//! [`SessionState`] is what this node believes about the session it takes part
//! in: its own role and id, where the MASTER lives, and the latest snapshot.
//! It sits behind one lock in the node; handlers copy out what they need and
//! release it before sending anything.

use crate::coordinator::Command;
use crate::error::{NodeError, NodeResult};
use log::{debug, info, warn};
use shared::{Coord, GameAnnouncement, GameConfig, GameSnapshot, NodeRole, Player, Snake};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

/// Cloneable handle on the node-wide cancellation signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown was requested or the signal was dropped
    pub async fn cancelled(&mut self) {
        loop {
            let cancelled = *self.receiver.borrow_and_update();
            if cancelled {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A session heard on the multicast group
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub announcement: GameAnnouncement,
    /// Source address of the announcement, where JOIN goes
    pub master_addr: SocketAddr,
    pub last_seen: Instant,
}

pub(crate) type JoinReply = oneshot::Sender<NodeResult<i32>>;

#[derive(Debug)]
pub struct SessionState {
    pub role: NodeRole,
    /// 0 until the MASTER assigns an id
    pub player_id: i32,
    pub game_name: Option<String>,
    pub config: Option<GameConfig>,
    pub master_addr: Option<SocketAddr>,
    pub snapshot: Option<Arc<GameSnapshot>>,
    /// Tick of the last snapshot applied from the current MASTER
    applied_tick: Option<u64>,
    /// Only kept while this node is MASTER
    pub announcement: Option<GameAnnouncement>,
    pub(crate) pending_join: Option<JoinReply>,
    /// Command queue of the coordinator, present while this node is MASTER
    pub(crate) commands: Option<mpsc::Sender<Command>>,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            role: NodeRole::Normal,
            player_id: 0,
            game_name: None,
            config: None,
            master_addr: None,
            snapshot: None,
            applied_tick: None,
            announcement: None,
            pending_join: None,
            commands: None,
        }
    }

    pub fn in_session(&self) -> bool {
        self.game_name.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    /// Forgets a session that was never completed
    pub fn reset(&mut self) {
        *self = Self::idle();
    }

    pub fn roster(&self) -> &[Player] {
        self.snapshot
            .as_deref()
            .map(|s| s.players.as_slice())
            .unwrap_or(&[])
    }

    /// Whether a message from `sender_id` at `addr` may change this node's view
    ///
    /// Once a roster is known the sender must be on it; before the first
    /// snapshot only the MASTER we joined is trusted.
    pub fn knows_sender(&self, sender_id: i32, addr: SocketAddr) -> bool {
        let roster = self.roster();
        if roster.is_empty() {
            self.master_addr == Some(addr)
        } else {
            roster.iter().any(|p| p.id == sender_id)
        }
    }

    /// Points MASTER-bound traffic at `addr`
    ///
    /// A new MASTER may resume from an older tick than the one we last saw,
    /// so the staleness check starts over.
    pub fn follow_master(&mut self, addr: SocketAddr) {
        if self.master_addr != Some(addr) {
            info!("MASTER is now at {}", addr);
            self.master_addr = Some(addr);
            self.applied_tick = None;
        }
    }

    /// Replaces the local view with a snapshot from the MASTER
    ///
    /// Returns false when the snapshot was dropped: this node is MASTER
    /// itself, the snapshot is malformed, or it is not newer than the one
    /// already applied since the MASTER last changed.
    pub fn apply_snapshot(&mut self, snapshot: GameSnapshot, from: SocketAddr) -> bool {
        if self.is_master() {
            debug!("MASTER ignores STATE from {}", from);
            return false;
        }
        if let Err(reason) = check_snapshot(&snapshot, self.config.as_ref()) {
            warn!("{}", NodeError::MalformedState { addr: from, reason });
            return false;
        }
        if let Some(last) = self.applied_tick {
            if snapshot.tick <= last {
                debug!(
                    "Dropping stale STATE tick {} from {} (have {})",
                    snapshot.tick, from, last
                );
                return false;
            }
        }

        if let Some(me) = snapshot.player(self.player_id) {
            if me.role != self.role && me.role != NodeRole::Master {
                info!("Role changed {} -> {} by snapshot", self.role, me.role);
                self.role = me.role;
            }
        }
        if self.master_addr != Some(from) {
            info!("MASTER is now at {}", from);
            self.master_addr = Some(from);
        }
        self.applied_tick = Some(snapshot.tick);
        self.snapshot = Some(Arc::new(snapshot));
        true
    }

    /// Stores what the local coordinator just produced
    pub fn publish(&mut self, snapshot: Arc<GameSnapshot>, announcement: GameAnnouncement) {
        self.snapshot = Some(snapshot);
        self.announcement = Some(announcement);
    }

    pub fn view(&self) -> Option<FrameView> {
        let config = self.config?;
        let snapshot = self.snapshot.as_deref()?;
        Some(FrameView::new(&config, snapshot, self.player_id, self.role))
    }
}

/// Structural checks a snapshot must pass before an engine may run on it
fn check_snapshot(snapshot: &GameSnapshot, config: Option<&GameConfig>) -> Result<(), &'static str> {
    let mut ids = HashSet::new();
    if !snapshot.players.iter().all(|p| ids.insert(p.id)) {
        return Err("duplicate player id");
    }
    let mut owners = HashSet::new();
    if !snapshot.snakes.iter().all(|s| owners.insert(s.player_id)) {
        return Err("two snakes for one player");
    }
    if snapshot.snakes.iter().any(|s| s.cells.is_empty()) {
        return Err("snake without cells");
    }
    if let Some(config) = config {
        let inside = |c: &Coord| (0..config.width).contains(&c.x) && (0..config.height).contains(&c.y);
        let cells = snapshot.snakes.iter().flat_map(|s| s.cells.iter());
        if !cells.chain(&snapshot.food).all(inside) {
            return Err("cell outside the field");
        }
    }
    Ok(())
}

/// Everything a renderer needs for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameView {
    pub width: i32,
    pub height: i32,
    pub tick: u64,
    pub snakes: Vec<Snake>,
    pub food: Vec<Coord>,
    pub players: Vec<Player>,
    pub local_id: i32,
    pub role: NodeRole,
}

impl FrameView {
    pub fn new(config: &GameConfig, snapshot: &GameSnapshot, local_id: i32, role: NodeRole) -> Self {
        Self {
            width: config.width,
            height: config.height,
            tick: snapshot.tick,
            snakes: snapshot.snakes.clone(),
            food: snapshot.food.clone(),
            players: snapshot.players.clone(),
            local_id,
            role,
        }
    }

    /// Score of the local player, if it has a roster entry
    pub fn local_score(&self) -> Option<i32> {
        self.players
            .iter()
            .find(|p| p.id == self.local_id)
            .map(|p| p.score)
    }
}
