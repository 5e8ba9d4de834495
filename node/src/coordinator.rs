//! MASTER-side session authority
//!
//! The [`Coordinator`] exclusively owns the engine and the roster. Everything
//! that mutates them (joins, steers, spectators, timed-out peers) arrives as a
//! [`Command`] on one queue, so the tick never races a join. Each tick's
//! snapshot is published as an `Arc` and never touched again; the broadcaster
//! task fans it out to every other player.

use crate::error::{NodeError, NodeResult};
use crate::failover::{self, FailoverAction, FailoverContext};
use crate::game::Engine;
use crate::ids::{mint_unique, IdGenerator};
use crate::session::{SessionState, Shutdown};
use crate::transport::{Outgoing, Transport};
use log::{debug, info, warn};
use shared::{
    Direction, GameAnnouncement, GameConfig, GameSnapshot, NodeRole, Payload, Player, PlayerKind,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// A JOIN as seen by the MASTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub player_name: String,
    pub kind: PlayerKind,
    pub game_name: String,
    pub requested_role: NodeRole,
    /// Unicast source of the JOIN datagram
    pub addr: SocketAddr,
}

/// Requests handled between two ticks
#[derive(Debug)]
pub enum Command {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<NodeResult<i32>>,
    },
    Steer {
        player_id: i32,
        direction: Direction,
    },
    /// A player asked to continue as a viewer
    Spectate { player_id: i32 },
    PeerTimedOut { addr: SocketAddr },
}

pub struct Coordinator {
    engine: Engine,
    ids: Box<dyn IdGenerator>,
    game_name: String,
    local_id: i32,
    can_join: bool,
}

impl Coordinator {
    /// Creates a new session with the local player as MASTER
    pub fn host(
        config: GameConfig,
        game_name: impl Into<String>,
        player_name: impl Into<String>,
        mut ids: Box<dyn IdGenerator>,
    ) -> NodeResult<Self> {
        let mut engine = Engine::new(config);
        let local_id = mint_unique(ids.as_mut(), |_| false);
        engine.add_player(Player::new(
            local_id,
            player_name,
            PlayerKind::Human,
            NodeRole::Master,
        ))?;
        engine.init();

        let game_name = game_name.into();
        info!("Created session `{}` as player {}", game_name, local_id);
        Ok(Self {
            engine,
            ids,
            game_name,
            local_id,
            can_join: true,
        })
    }

    /// Continues a session from the last replicated snapshot
    pub fn from_snapshot(
        config: GameConfig,
        game_name: impl Into<String>,
        snapshot: GameSnapshot,
        local_id: i32,
        ids: Box<dyn IdGenerator>,
    ) -> Self {
        let mut engine = Engine::from_snapshot(config, snapshot);
        engine.set_role(local_id, NodeRole::Master);
        Self {
            engine,
            ids,
            game_name: game_name.into(),
            local_id,
            can_join: true,
        }
    }

    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    pub fn can_join(&self) -> bool {
        self.can_join
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn announcement(&self) -> GameAnnouncement {
        GameAnnouncement {
            name: self.game_name.clone(),
            config: *self.engine.config(),
            players: self.engine.players().to_vec(),
            can_join: self.can_join,
        }
    }

    /// Admits a player, returning its id and any role changes it caused
    pub fn join(&mut self, request: &JoinRequest) -> NodeResult<(i32, Vec<Outgoing>)> {
        if request.game_name != self.game_name {
            info!(
                "Rejected JOIN from {} for unknown session `{}`",
                request.addr, request.game_name
            );
            return Err(NodeError::UnknownSession(request.game_name.clone()));
        }

        if let Some(existing) = self
            .engine
            .players()
            .iter()
            .find(|p| p.address == Some(request.addr))
        {
            debug!("Repeated JOIN from {}, keeping id {}", request.addr, existing.id);
            return Ok((existing.id, Vec::new()));
        }

        let role = match request.requested_role {
            NodeRole::Viewer => NodeRole::Viewer,
            _ => NodeRole::Normal,
        };
        let engine = &self.engine;
        let id = mint_unique(self.ids.as_mut(), |id| engine.player(id).is_some());
        let player =
            Player::new(id, request.player_name.clone(), request.kind, role).with_address(request.addr);

        if let Err(e) = self.engine.add_player(player) {
            if matches!(e, NodeError::NoSpawnSpace) {
                self.can_join = false;
            }
            warn!("Rejected JOIN from {}: {}", request.addr, e);
            return Err(e);
        }

        self.can_join = true;
        info!(
            "Accepted JOIN from {} as player {} ({})",
            request.addr, id, role
        );
        Ok((id, self.ensure_deputy()))
    }

    /// Relays a steer intent; viewers are ignored
    pub fn steer(&mut self, player_id: i32, direction: Direction) -> NodeResult<()> {
        let Some(player) = self.engine.player(player_id) else {
            return Err(NodeError::UnknownPeer(player_id));
        };
        if !player.role.is_player() {
            debug!("Ignoring STEER from viewer {}", player_id);
            return Ok(());
        }
        self.engine.steer(player_id, direction)
    }

    /// Turns a player into a viewer; its snake stays behind as a zombie
    pub fn spectate(&mut self, player_id: i32) -> NodeResult<Vec<Outgoing>> {
        if player_id == self.local_id {
            return Ok(Vec::new());
        }
        if !self.engine.set_role(player_id, NodeRole::Viewer) {
            return Err(NodeError::UnknownPeer(player_id));
        }
        info!("Player {} is now a VIEWER", player_id);
        Ok(self.ensure_deputy())
    }

    /// Reacts to a peer that went silent
    pub fn peer_timed_out(&mut self, addr: SocketAddr) -> Vec<Outgoing> {
        let actions = failover::plan(
            &FailoverContext {
                local_role: NodeRole::Master,
                local_id: self.local_id,
                roster: self.engine.players(),
                master_addr: None,
            },
            addr,
        );
        self.apply(actions)
    }

    /// Carries out a failover plan, returning the messages it produces
    pub fn apply(&mut self, actions: Vec<FailoverAction>) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        for action in actions {
            match action {
                FailoverAction::RemovePlayer { player_id } => {
                    self.engine.remove_player(player_id);
                }
                FailoverAction::NotifyViewer { player_id, addr } => {
                    outgoing.push(role_change(addr, player_id, Some(NodeRole::Viewer)));
                }
                FailoverAction::AppointDeputy { player_id, addr } => {
                    if self.engine.set_role(player_id, NodeRole::Deputy) {
                        info!("Appointed player {} as DEPUTY", player_id);
                        outgoing.push(role_change(addr, player_id, Some(NodeRole::Deputy)));
                    }
                }
                FailoverAction::AnnounceMaster { player_id, addr } => {
                    outgoing.push(role_change(addr, player_id, None));
                }
                FailoverAction::PromoteSelf | FailoverAction::RedirectToDeputy { .. } => {}
            }
        }
        outgoing.extend(self.ensure_deputy());
        outgoing
    }

    /// Appoints the lowest-id NORMAL when the roster has no DEPUTY
    pub fn ensure_deputy(&mut self) -> Vec<Outgoing> {
        if self
            .engine
            .players()
            .iter()
            .any(|p| p.role == NodeRole::Deputy)
        {
            return Vec::new();
        }
        match failover::pick_deputy(self.engine.players(), &[self.local_id]) {
            Some(action) => self.apply(vec![action]),
            None => Vec::new(),
        }
    }

    pub fn tick(&mut self) -> Arc<GameSnapshot> {
        Arc::new(self.engine.tick())
    }

    /// Handles one queued command and returns what has to be sent
    pub fn handle(&mut self, command: Command) -> Vec<Outgoing> {
        match command {
            Command::Join { request, reply } => match self.join(&request) {
                Ok((id, outgoing)) => {
                    let _ = reply.send(Ok(id));
                    outgoing
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            Command::Steer {
                player_id,
                direction,
            } => {
                if let Err(e) = self.steer(player_id, direction) {
                    debug!("Dropped STEER: {}", e);
                }
                Vec::new()
            }
            Command::Spectate { player_id } => self.spectate(player_id).unwrap_or_else(|e| {
                debug!("Dropped ROLE_CHANGE: {}", e);
                Vec::new()
            }),
            Command::PeerTimedOut { addr } => self.peer_timed_out(addr),
        }
    }
}

fn role_change(addr: SocketAddr, receiver_id: i32, receiver_role: Option<NodeRole>) -> Outgoing {
    Outgoing::new(
        addr,
        receiver_id,
        Payload::RoleChange {
            sender_role: Some(NodeRole::Master),
            receiver_role,
        },
    )
}

/// Runs the coordinator until shutdown: ticks at the session interval and
/// serves queued commands in between
pub async fn run(
    mut coordinator: Coordinator,
    mut commands: mpsc::Receiver<Command>,
    transport: Arc<Transport>,
    session: Arc<RwLock<SessionState>>,
    states: watch::Sender<Option<Arc<GameSnapshot>>>,
    mut shutdown: Shutdown,
    initial: Vec<Outgoing>,
) {
    let local_id = coordinator.local_id();
    transport.send_all(local_id, initial).await;

    let mut ticker = interval(coordinator.engine().config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Coordinator for `{}` running every {:?}",
        coordinator.game_name(),
        coordinator.engine().config().tick_interval()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(command) = commands.recv() => {
                let outgoing = coordinator.handle(command);
                session.write().await.announcement = Some(coordinator.announcement());
                transport.send_all(local_id, outgoing).await;
            }
            _ = ticker.tick() => {
                let snapshot = coordinator.tick();
                session
                    .write()
                    .await
                    .publish(Arc::clone(&snapshot), coordinator.announcement());
                states.send_replace(Some(snapshot));
            }
        }
    }
    debug!("Coordinator stopped at tick {}", coordinator.engine().current_tick());
}

/// Sends every published snapshot to all players except the local one
pub async fn broadcast_states(
    transport: Arc<Transport>,
    local_id: i32,
    mut states: watch::Receiver<Option<Arc<GameSnapshot>>>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = states.borrow_and_update().clone();
                let Some(snapshot) = latest else {
                    continue;
                };
                let targets: Vec<(i32, SocketAddr)> = snapshot
                    .players
                    .iter()
                    .filter(|p| p.id != local_id)
                    .filter_map(|p| p.address.map(|addr| (p.id, addr)))
                    .collect();
                for (player_id, addr) in targets {
                    let payload = Payload::State {
                        snapshot: (*snapshot).clone(),
                    };
                    transport.send(addr, local_id, player_id, payload).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use shared::{Coord, Snake, SnakeState};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn request(name: &str, port: u16, role: NodeRole) -> JoinRequest {
        JoinRequest {
            player_name: name.into(),
            kind: PlayerKind::Human,
            game_name: "arena".into(),
            requested_role: role,
            addr: addr(port),
        }
    }

    fn full_row(player_id: i32, y: i32) -> Snake {
        Snake {
            player_id,
            cells: (0..10).rev().map(|x| Coord::new(x, y)).collect(),
            heading: Direction::Right,
            state: SnakeState::Alive,
        }
    }

    /// 10×10 field whose rows 2 and 7 are taken by live snakes, leaving no
    /// free 5×5 block
    fn crowded() -> Coordinator {
        let config = GameConfig::new(10, 10, 0, 100).unwrap();
        let snapshot = GameSnapshot {
            tick: 3,
            snakes: vec![full_row(1, 2), full_row(2, 7)],
            food: vec![],
            players: vec![
                Player::new(1, "host", PlayerKind::Human, NodeRole::Master),
                Player::new(2, "second", PlayerKind::Human, NodeRole::Deputy)
                    .with_address(addr(9002)),
            ],
        };
        Coordinator::from_snapshot(
            config,
            "arena",
            snapshot,
            1,
            Box::new(SequentialIds::starting_at(10)),
        )
    }

    #[test]
    fn test_host_places_master_and_food() {
        let config = GameConfig::new(15, 15, 1, 100).unwrap();
        let coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();

        let snapshot = coordinator.engine().snapshot();
        assert_eq!(coordinator.local_id(), 1);
        assert_eq!(snapshot.players[0].role, NodeRole::Master);
        assert_eq!(snapshot.snakes.len(), 1);
        assert_eq!(snapshot.snakes[0].cells.len(), 2);
        assert_eq!(snapshot.food.len(), 1);
        assert!(coordinator.announcement().can_join);
    }

    #[test]
    fn test_join_assigns_id_and_appoints_deputy() {
        let config = GameConfig::new(30, 30, 1, 100).unwrap();
        let mut coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();

        let (id, outgoing) = coordinator
            .join(&request("bob", 9002, NodeRole::Normal))
            .unwrap();
        assert_eq!(id, 2);
        assert_eq!(
            outgoing,
            vec![Outgoing::new(
                addr(9002),
                2,
                Payload::RoleChange {
                    sender_role: Some(NodeRole::Master),
                    receiver_role: Some(NodeRole::Deputy),
                }
            )]
        );
        assert_eq!(coordinator.engine().player(2).unwrap().role, NodeRole::Deputy);

        let (id, outgoing) = coordinator
            .join(&request("carol", 9003, NodeRole::Normal))
            .unwrap();
        assert_eq!(id, 3);
        assert!(outgoing.is_empty());
        assert_eq!(coordinator.engine().player(3).unwrap().role, NodeRole::Normal);
    }

    #[test]
    fn test_repeated_join_keeps_id() {
        let config = GameConfig::new(30, 30, 1, 100).unwrap();
        let mut coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();

        let (first, _) = coordinator.join(&request("bob", 9002, NodeRole::Normal)).unwrap();
        let (second, outgoing) = coordinator.join(&request("bob", 9002, NodeRole::Normal)).unwrap();
        assert_eq!(first, second);
        assert!(outgoing.is_empty());
        assert_eq!(coordinator.engine().players().len(), 2);
    }

    #[test]
    fn test_join_for_other_session_is_rejected() {
        let mut coordinator = crowded();
        let mut req = request("bob", 9003, NodeRole::Normal);
        req.game_name = "elsewhere".into();

        assert!(matches!(
            coordinator.join(&req),
            Err(NodeError::UnknownSession(name)) if name == "elsewhere"
        ));
        assert!(coordinator.can_join());
    }

    #[test]
    fn test_join_without_space_flips_can_join_until_snake_dies() {
        let mut coordinator = crowded();

        let result = coordinator.join(&request("late", 9003, NodeRole::Normal));
        assert!(matches!(result, Err(NodeError::NoSpawnSpace)));
        assert!(!coordinator.can_join());
        assert!(!coordinator.announcement().can_join);
        assert_eq!(coordinator.engine().players().len(), 2);

        // the DEPUTY leaves play, its row becomes a zombie
        coordinator.spectate(2).unwrap();

        let (id, outgoing) = coordinator
            .join(&request("late", 9003, NodeRole::Normal))
            .unwrap();
        assert!(coordinator.can_join());
        assert!(coordinator.engine().snake(id).is_some());
        assert_eq!(
            outgoing,
            vec![Outgoing::new(
                addr(9003),
                id,
                Payload::RoleChange {
                    sender_role: Some(NodeRole::Master),
                    receiver_role: Some(NodeRole::Deputy),
                }
            )]
        );
    }

    #[test]
    fn test_viewer_join_never_needs_space() {
        let mut coordinator = crowded();
        let (id, outgoing) = coordinator
            .join(&request("watcher", 9004, NodeRole::Viewer))
            .unwrap();

        assert_eq!(coordinator.engine().player(id).unwrap().role, NodeRole::Viewer);
        assert!(coordinator.engine().snake(id).is_none());
        assert!(outgoing.is_empty());
    }

    #[test]
    fn test_requested_deputy_role_joins_as_normal() {
        let config = GameConfig::new(30, 30, 1, 100).unwrap();
        let mut coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();
        coordinator.join(&request("bob", 9002, NodeRole::Normal)).unwrap();

        let (id, _) = coordinator
            .join(&request("eve", 9003, NodeRole::Master))
            .unwrap();
        assert_eq!(coordinator.engine().player(id).unwrap().role, NodeRole::Normal);
    }

    #[test]
    fn test_steer_from_unknown_player() {
        let mut coordinator = crowded();
        assert!(matches!(
            coordinator.steer(99, Direction::Up),
            Err(NodeError::UnknownPeer(99))
        ));
        assert!(coordinator.steer(1, Direction::Up).is_ok());
    }

    #[test]
    fn test_deputy_timeout_appoints_replacement() {
        let config = GameConfig::new(30, 30, 1, 100).unwrap();
        let mut coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();
        coordinator.join(&request("bob", 9002, NodeRole::Normal)).unwrap();
        coordinator.join(&request("carol", 9003, NodeRole::Normal)).unwrap();

        let outgoing = coordinator.peer_timed_out(addr(9002));

        assert!(coordinator.engine().player(2).is_none());
        assert_eq!(coordinator.engine().snake(2).unwrap().state, SnakeState::Zombie);
        assert_eq!(coordinator.engine().player(3).unwrap().role, NodeRole::Deputy);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].addr, addr(9003));
    }

    #[test]
    fn test_normal_timeout_notifies_viewer() {
        let config = GameConfig::new(30, 30, 1, 100).unwrap();
        let mut coordinator =
            Coordinator::host(config, "arena", "host", Box::new(SequentialIds::starting_at(1)))
                .unwrap();
        coordinator.join(&request("bob", 9002, NodeRole::Normal)).unwrap();
        coordinator.join(&request("carol", 9003, NodeRole::Normal)).unwrap();

        let outgoing = coordinator.peer_timed_out(addr(9003));

        assert!(coordinator.engine().player(3).is_none());
        assert_eq!(
            outgoing,
            vec![Outgoing::new(
                addr(9003),
                3,
                Payload::RoleChange {
                    sender_role: Some(NodeRole::Master),
                    receiver_role: Some(NodeRole::Viewer),
                }
            )]
        );
    }

    #[test]
    fn test_promoted_coordinator_continues_tick() {
        let mut coordinator = crowded();
        assert_eq!(coordinator.engine().player(1).unwrap().role, NodeRole::Master);

        let snapshot = coordinator.tick();
        assert_eq!(snapshot.tick, 4);
    }

    #[tokio::test]
    async fn test_handle_join_replies_on_channel() {
        let mut coordinator = crowded();
        let (tx, rx) = oneshot::channel();

        coordinator.handle(Command::Join {
            request: request("late", 9003, NodeRole::Normal),
            reply: tx,
        });

        assert!(matches!(rx.await.unwrap(), Err(NodeError::NoSpawnSpace)));
    }
}
