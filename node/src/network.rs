//! Session Manager: sockets, discovery, message handling and failover
//!
//! A [`Node`] owns two UDP sockets. The multicast socket only ever carries
//! announcements; everything else travels over the unicast socket, whose
//! ephemeral port peers learn from the source address of our datagrams.
//!
//! Tasks running per node:
//! - one receive loop per socket, each spawning a short-lived handler task
//!   per datagram
//! - a ping ticker and a timeout reaper driven by the activity tracker
//! - while MASTER: the coordinator, the state broadcaster and the
//!   announcement ticker
//!
//! All of them watch one cancellation signal. [`Node::shutdown`] raises it and
//! waits for every task before the sockets are released.

use crate::activity::ActivityTracker;
use crate::config::{NodeConfig, ANNOUNCE_INTERVAL, SESSION_EXPIRY};
use crate::coordinator::{self, Command, Coordinator, JoinRequest};
use crate::error::{NodeError, NodeResult};
use crate::failover::{self, FailoverAction, FailoverContext};
use crate::ids::{IdGenerator, RandomIds};
use crate::session::{FrameView, SessionInfo, SessionState, Shutdown};
use crate::transport::{Outgoing, Transport};
use log::{debug, error, info, warn};
use shared::{
    Direction, Envelope, GameAnnouncement, GameConfig, GameSnapshot, NodeRole, Payload,
    PlayerKind, MAX_DATAGRAM_SIZE,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep};

/// ERROR text sent when the engine finds no room for another snake
pub const NO_SPACE_MESSAGE: &str = "Cannot find suitable position for new snake";

const COMMAND_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Unicast,
    Multicast,
}

/// One participant of the peer session
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: NodeConfig,
    transport: Arc<Transport>,
    session: Arc<RwLock<SessionState>>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
    activity: Arc<Mutex<ActivityTracker>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Node {
    /// Binds both sockets and starts the receive loops and liveness tickers
    ///
    /// This is the only fallible step that is fatal for a node.
    pub async fn bind(config: NodeConfig) -> NodeResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                socket: "unicast",
                source,
            })?;
        let socket = Arc::new(socket);
        info!("Unicast socket bound on {}", socket.local_addr()?);

        let multicast = match config.multicast_group {
            Some(group) => {
                let socket = bind_multicast(group).map_err(|source| NodeError::Bind {
                    socket: "multicast",
                    source,
                })?;
                info!("Listening for announcements on {}", group);
                Some(Arc::new(socket))
            }
            None => None,
        };

        let activity = Arc::new(Mutex::new(ActivityTracker::new(
            GameConfig::default().tick_interval(),
        )));
        let transport = Arc::new(Transport::new(
            Arc::clone(&socket),
            Arc::clone(&activity),
            config.multicast_group,
        )?);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            config,
            transport,
            session: Arc::new(RwLock::new(SessionState::idle())),
            sessions: RwLock::new(HashMap::new()),
            activity,
            shutdown_tx,
            tasks: Mutex::new(JoinSet::new()),
        });

        inner
            .spawn(receive_loop(
                Arc::clone(&inner),
                socket,
                Channel::Unicast,
                inner.shutdown_signal(),
            ))
            .await;
        if let Some(socket) = multicast {
            inner
                .spawn(receive_loop(
                    Arc::clone(&inner),
                    socket,
                    Channel::Multicast,
                    inner.shutdown_signal(),
                ))
                .await;
        }
        inner
            .spawn(ping_loop(Arc::clone(&inner), inner.shutdown_signal()))
            .await;
        inner
            .spawn(reaper_loop(Arc::clone(&inner), inner.shutdown_signal()))
            .await;

        Ok(Node { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Starts a new session with this node as MASTER; returns the local player id
    pub async fn host(
        &self,
        game_name: &str,
        player_name: &str,
        config: GameConfig,
    ) -> NodeResult<i32> {
        self.host_with_ids(game_name, player_name, config, Box::new(RandomIds::new()))
            .await
    }

    /// Like [`Node::host`], minting player ids from `ids`
    pub async fn host_with_ids(
        &self,
        game_name: &str,
        player_name: &str,
        config: GameConfig,
        ids: Box<dyn IdGenerator>,
    ) -> NodeResult<i32> {
        self.inner.ensure_running()?;
        config.validate()?;
        {
            let mut session = self.inner.session.write().await;
            if session.in_session() {
                return Err(NodeError::AlreadyInSession);
            }
            session.game_name = Some(game_name.to_string());
        }

        let coordinator = match Coordinator::host(config, game_name, player_name, ids) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                self.inner.session.write().await.reset();
                return Err(e);
            }
        };
        let local_id = coordinator.local_id();
        self.inner.start_master(coordinator, Vec::new()).await;
        Ok(local_id)
    }

    /// Joins a session heard on the multicast group
    pub async fn join(
        &self,
        game_name: &str,
        player_name: &str,
        requested_role: NodeRole,
    ) -> NodeResult<i32> {
        let info = self
            .inner
            .sessions
            .read()
            .await
            .get(game_name)
            .cloned()
            .ok_or_else(|| NodeError::UnknownSession(game_name.to_string()))?;
        if !info.announcement.can_join {
            return Err(NodeError::NotJoinable(game_name.to_string()));
        }
        self.join_at(
            info.master_addr,
            game_name,
            info.announcement.config,
            player_name,
            requested_role,
        )
        .await
    }

    /// Joins the session served by the MASTER at `master_addr`
    ///
    /// The JOIN is repeated once per tick interval until an ACK or ERROR
    /// arrives or the join timeout expires.
    pub async fn join_at(
        &self,
        master_addr: SocketAddr,
        game_name: &str,
        config: GameConfig,
        player_name: &str,
        requested_role: NodeRole,
    ) -> NodeResult<i32> {
        self.inner.ensure_running()?;
        config.validate()?;

        let (reply, mut response) = oneshot::channel();
        {
            let mut session = self.inner.session.write().await;
            if session.in_session() {
                return Err(NodeError::AlreadyInSession);
            }
            session.game_name = Some(game_name.to_string());
            session.config = Some(config);
            session.master_addr = Some(master_addr);
            session.role = match requested_role {
                NodeRole::Viewer => NodeRole::Viewer,
                _ => NodeRole::Normal,
            };
            session.pending_join = Some(reply);
        }
        self.inner
            .activity
            .lock()
            .await
            .configure(config.tick_interval());

        info!(
            "Joining session `{}` at {} as {}",
            game_name, master_addr, requested_role
        );
        let request = Payload::Join {
            player_name: player_name.to_string(),
            kind: PlayerKind::Human,
            game_name: game_name.to_string(),
            requested_role,
        };

        let join_timeout = self.inner.config.join_timeout;
        let deadline = sleep(join_timeout);
        tokio::pin!(deadline);
        let mut resend = interval(config.tick_interval());

        let outcome = loop {
            tokio::select! {
                result = &mut response => {
                    break result.unwrap_or(Err(NodeError::ShuttingDown));
                }
                _ = &mut deadline => break Err(NodeError::JoinTimeout(join_timeout)),
                _ = resend.tick() => {
                    self.inner
                        .transport
                        .send(master_addr, 0, 0, request.clone())
                        .await;
                }
            }
        };

        match outcome {
            Ok(player_id) => {
                self.inner.session.write().await.player_id = player_id;
                info!("Joined session `{}` as player {}", game_name, player_id);
                Ok(player_id)
            }
            Err(e) => {
                self.inner.session.write().await.reset();
                self.inner.activity.lock().await.remove(&master_addr);
                warn!("Joining `{}` failed: {}", game_name, e);
                Err(e)
            }
        }
    }

    /// Sessions announced recently, by name
    pub async fn available_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .filter(|info| info.last_seen.elapsed() <= SESSION_EXPIRY)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.announcement.name.cmp(&b.announcement.name));
        sessions
    }

    /// Forwards a direction change for the local snake
    ///
    /// Viewers cannot steer; their input is dropped.
    pub async fn steer(&self, direction: Direction) -> NodeResult<()> {
        let (role, player_id, master_addr, commands) = {
            let session = self.inner.session.read().await;
            if !session.in_session() || session.player_id == 0 {
                return Err(NodeError::NotInSession);
            }
            (
                session.role,
                session.player_id,
                session.master_addr,
                session.commands.clone(),
            )
        };

        match role {
            NodeRole::Master => {
                if let Some(commands) = commands {
                    commands
                        .send(Command::Steer {
                            player_id,
                            direction,
                        })
                        .await
                        .map_err(|_| NodeError::ShuttingDown)?;
                }
            }
            NodeRole::Viewer => debug!("Viewers cannot steer"),
            NodeRole::Normal | NodeRole::Deputy => {
                if let Some(addr) = master_addr {
                    self.inner
                        .transport
                        .send(addr, player_id, 0, Payload::Steer { direction })
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Leaves play and keeps watching; the snake stays behind as a zombie
    pub async fn spectate(&self) -> NodeResult<()> {
        let (role, player_id, master_addr) = {
            let mut session = self.inner.session.write().await;
            if !session.in_session() || session.player_id == 0 {
                return Err(NodeError::NotInSession);
            }
            let previous = session.role;
            if previous == NodeRole::Normal || previous == NodeRole::Deputy {
                info!("Role changed {} -> {} on request", previous, NodeRole::Viewer);
                session.role = NodeRole::Viewer;
            }
            (previous, session.player_id, session.master_addr)
        };

        match role {
            NodeRole::Master => {
                warn!("MASTER keeps playing; handing the session over is not supported");
            }
            NodeRole::Viewer => {}
            NodeRole::Normal | NodeRole::Deputy => {
                if let Some(addr) = master_addr {
                    let payload = Payload::RoleChange {
                        sender_role: Some(NodeRole::Viewer),
                        receiver_role: None,
                    };
                    self.inner.transport.send(addr, player_id, 0, payload).await;
                }
            }
        }
        Ok(())
    }

    pub async fn role(&self) -> NodeRole {
        self.inner.session.read().await.role
    }

    pub async fn player_id(&self) -> i32 {
        self.inner.session.read().await.player_id
    }

    pub async fn game_name(&self) -> Option<String> {
        self.inner.session.read().await.game_name.clone()
    }

    /// Where MASTER-bound traffic goes; the local address when this node is MASTER
    pub async fn master_addr(&self) -> Option<SocketAddr> {
        let session = self.inner.session.read().await;
        if session.is_master() {
            Some(self.local_addr())
        } else {
            session.master_addr
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<GameSnapshot>> {
        self.inner.session.read().await.snapshot.clone()
    }

    /// The announcement this node currently broadcasts, if it is MASTER
    pub async fn announcement(&self) -> Option<GameAnnouncement> {
        let session = self.inner.session.read().await;
        if session.is_master() {
            session.announcement.clone()
        } else {
            None
        }
    }

    /// Frame data for a renderer
    pub async fn view(&self) -> Option<FrameView> {
        self.inner.session.read().await.view()
    }

    /// Stops every task, waits for in-flight handlers and closes the sockets
    pub async fn shutdown(self) {
        info!("Shutting down node at {}", self.local_addr());
        self.inner.shutdown_tx.send_replace(true);

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Task failed during shutdown: {}", e);
            }
        }
        debug!("All tasks of {} finished", self.local_addr());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}

impl Inner {
    fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.shutdown_tx.subscribe())
    }

    fn ensure_running(&self) -> NodeResult<()> {
        let stopping = *self.shutdown_tx.borrow();
        if stopping {
            Err(NodeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Tracks a long-running task so shutdown can wait for it
    async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if self.ensure_running().is_err() {
            debug!("Not starting a task during shutdown");
            return;
        }
        tasks.spawn(task);
    }

    /// Switches this node to MASTER and starts the tasks that go with it
    async fn start_master(self: &Arc<Self>, coordinator: Coordinator, initial: Vec<Outgoing>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (states_tx, states_rx) = watch::channel(None);
        let local_id = coordinator.local_id();
        let config = *coordinator.engine().config();
        {
            let mut session = self.session.write().await;
            session.role = NodeRole::Master;
            session.player_id = local_id;
            session.game_name = Some(coordinator.game_name().to_string());
            session.config = Some(config);
            session.master_addr = None;
            session.commands = Some(commands_tx);
            session.publish(
                Arc::new(coordinator.engine().snapshot()),
                coordinator.announcement(),
            );
        }
        self.activity.lock().await.configure(config.tick_interval());
        info!(
            "Node {} is MASTER of `{}`",
            self.transport.local_addr(),
            coordinator.game_name()
        );

        self.spawn(coordinator::run(
            coordinator,
            commands_rx,
            Arc::clone(&self.transport),
            Arc::clone(&self.session),
            states_tx,
            self.shutdown_signal(),
            initial,
        ))
        .await;
        self.spawn(coordinator::broadcast_states(
            Arc::clone(&self.transport),
            local_id,
            states_rx,
            self.shutdown_signal(),
        ))
        .await;
        self.spawn(announce_loop(Arc::clone(self), self.shutdown_signal()))
            .await;
    }

    /// Promotes this node after the MASTER at `old_master` went away or
    /// handed the session over
    async fn take_over(self: &Arc<Self>, old_master: SocketAddr) {
        let prepared = {
            let mut session = self.session.write().await;
            if session.is_master() {
                debug!("Already MASTER, ignoring takeover from {}", old_master);
                return;
            }
            let (Some(config), Some(game_name), Some(snapshot)) = (
                session.config,
                session.game_name.clone(),
                session.snapshot.clone(),
            ) else {
                warn!("Cannot take over without a replicated snapshot");
                return;
            };
            let actions = failover::plan(
                &FailoverContext {
                    local_role: NodeRole::Deputy,
                    local_id: session.player_id,
                    roster: &snapshot.players,
                    master_addr: Some(old_master),
                },
                old_master,
            );
            // duplicate triggers find this node MASTER from here on
            session.role = NodeRole::Master;
            (config, game_name, snapshot, session.player_id, actions)
        };
        let (config, game_name, snapshot, local_id, actions) = prepared;

        info!(
            "Taking over session `{}` from {} at tick {}",
            game_name, old_master, snapshot.tick
        );
        let mut coordinator = Coordinator::from_snapshot(
            config,
            game_name,
            (*snapshot).clone(),
            local_id,
            Box::new(RandomIds::new()),
        );
        let initial = coordinator.apply(actions);
        self.start_master(coordinator, initial).await;
    }

    async fn handle_datagram(self: Arc<Self>, datagram: Vec<u8>, addr: SocketAddr, channel: Channel) {
        let envelope = match Envelope::decode(&datagram) {
            Ok(envelope) => envelope,
            Err(source) => {
                warn!("{}", NodeError::ProtocolDecode { addr, source });
                return;
            }
        };

        match channel {
            Channel::Multicast => match envelope.payload {
                Payload::Announcement { games } => self.handle_announcement(games, addr).await,
                other => debug!(
                    "Ignoring {} from {} on the multicast group",
                    other.kind(),
                    addr
                ),
            },
            Channel::Unicast => self.dispatch(envelope, addr).await,
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope, addr: SocketAddr) {
        let in_session = self.session.read().await.in_session();
        if in_session {
            self.activity.lock().await.record_received(addr);
        }

        let Envelope {
            seq,
            sender_id,
            receiver_id,
            payload,
        } = envelope;
        debug!("Received {} #{} from {}", payload.kind(), seq, addr);

        match payload {
            Payload::Ping => {}
            Payload::Ack => self.handle_ack(receiver_id, addr).await,
            Payload::Steer { direction } => self.handle_steer(sender_id, direction, addr).await,
            Payload::State { snapshot } => self.handle_state(sender_id, snapshot, addr).await,
            Payload::Announcement { games } => self.handle_announcement(games, addr).await,
            Payload::Join {
                player_name,
                kind,
                game_name,
                requested_role,
            } => {
                let request = JoinRequest {
                    player_name,
                    kind,
                    game_name,
                    requested_role,
                    addr,
                };
                self.handle_join(request, seq).await
            }
            Payload::Error { message } => self.handle_error(message, addr).await,
            Payload::RoleChange {
                sender_role,
                receiver_role,
            } => {
                self.handle_role_change(sender_id, sender_role, receiver_role, addr)
                    .await
            }
        }
    }

    async fn handle_ack(&self, receiver_id: i32, addr: SocketAddr) {
        let pending = {
            let mut session = self.session.write().await;
            if receiver_id == 0 {
                None
            } else {
                let pending = session.pending_join.take();
                if pending.is_some() {
                    session.player_id = receiver_id;
                }
                pending
            }
        };
        match pending {
            Some(reply) => {
                let _ = reply.send(Ok(receiver_id));
            }
            None => debug!("ACK from {} needs no action", addr),
        }
    }

    async fn handle_error(&self, message: String, addr: SocketAddr) {
        let pending = self.session.write().await.pending_join.take();
        match pending {
            Some(reply) => {
                let _ = reply.send(Err(NodeError::JoinRejected(message)));
            }
            None => warn!("ERROR from {}: {}", addr, message),
        }
    }

    async fn handle_steer(&self, sender_id: i32, direction: Direction, addr: SocketAddr) {
        let commands = {
            let session = self.session.read().await;
            if !session.is_master() {
                debug!("Dropping STEER from {}: not MASTER", addr);
                return;
            }
            session.commands.clone()
        };
        if sender_id == 0 {
            warn!("{}", NodeError::UnknownPeer(sender_id));
            return;
        }
        if let Some(commands) = commands {
            let command = Command::Steer {
                player_id: sender_id,
                direction,
            };
            if commands.send(command).await.is_err() {
                debug!("Coordinator stopped, STEER from {} dropped", addr);
            }
        }
    }

    async fn handle_state(&self, sender_id: i32, snapshot: GameSnapshot, addr: SocketAddr) {
        let mut session = self.session.write().await;
        if !session.in_session() {
            debug!("Dropping STATE from {} outside a session", addr);
            return;
        }
        if !session.is_master() && !session.knows_sender(sender_id, addr) {
            warn!("Dropping STATE from {}: {}", addr, NodeError::UnknownPeer(sender_id));
            return;
        }
        session.apply_snapshot(snapshot, addr);
    }

    async fn handle_announcement(&self, games: Vec<GameAnnouncement>, addr: SocketAddr) {
        let mut sessions = self.sessions.write().await;
        for announcement in games {
            if let Err(e) = announcement.config.validate() {
                warn!(
                    "Ignoring announcement of `{}` from {}: {}",
                    announcement.name, addr, e
                );
                continue;
            }
            if !sessions.contains_key(&announcement.name) {
                info!("Discovered session `{}` at {}", announcement.name, addr);
            }
            sessions.insert(
                announcement.name.clone(),
                SessionInfo {
                    announcement,
                    master_addr: addr,
                    last_seen: Instant::now(),
                },
            );
        }
    }

    async fn handle_join(&self, request: JoinRequest, seq: i64) {
        let (commands, local_id) = {
            let session = self.session.read().await;
            if !session.is_master() {
                debug!("Ignoring JOIN from {}: not MASTER", request.addr);
                return;
            }
            (session.commands.clone(), session.player_id)
        };
        let Some(commands) = commands else {
            return;
        };

        let addr = request.addr;
        let (reply, response) = oneshot::channel();
        if commands
            .send(Command::Join { request, reply })
            .await
            .is_err()
        {
            return;
        }

        let (receiver_id, payload) = match response.await {
            Ok(Ok(player_id)) => (player_id, Payload::Ack),
            Ok(Err(NodeError::NoSpawnSpace)) => (
                0,
                Payload::Error {
                    message: NO_SPACE_MESSAGE.to_string(),
                },
            ),
            Ok(Err(e)) => (
                0,
                Payload::Error {
                    message: e.to_string(),
                },
            ),
            Err(_) => return,
        };
        self.transport
            .reply(addr, seq, local_id, receiver_id, payload)
            .await;
    }

    async fn handle_role_change(
        self: &Arc<Self>,
        sender_id: i32,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
        addr: SocketAddr,
    ) {
        let commands = {
            let session = self.session.read().await;
            if session.is_master() {
                Some(session.commands.clone())
            } else {
                None
            }
        };
        if let Some(commands) = commands {
            match (sender_role, commands) {
                (Some(NodeRole::Viewer), Some(commands)) => {
                    let command = Command::Spectate {
                        player_id: sender_id,
                    };
                    if commands.send(command).await.is_err() {
                        debug!("Coordinator stopped, ROLE_CHANGE from {} dropped", addr);
                    }
                }
                _ => debug!("MASTER ignores ROLE_CHANGE from {}", addr),
            }
            return;
        }

        {
            let mut session = self.session.write().await;
            if !session.in_session() {
                debug!("Dropping ROLE_CHANGE from {} outside a session", addr);
                return;
            }
            if !session.knows_sender(sender_id, addr) {
                warn!(
                    "Dropping ROLE_CHANGE from {}: {}",
                    addr,
                    NodeError::UnknownPeer(sender_id)
                );
                return;
            }
            if sender_role == Some(NodeRole::Master) {
                session.follow_master(addr);
            }
            if let Some(role) = receiver_role {
                if role != NodeRole::Master && role != session.role {
                    info!("Role changed {} -> {} by {}", session.role, role, addr);
                    session.role = role;
                }
            }
        }

        if receiver_role == Some(NodeRole::Master) {
            info!("Handed the MASTER role by {}", addr);
            self.take_over(addr).await;
        }
    }

    async fn handle_peer_timeout(self: &Arc<Self>, addr: SocketAddr) {
        let (actions, commands) = {
            let session = self.session.read().await;
            if !session.in_session() {
                return;
            }
            if session.is_master() {
                (Vec::new(), session.commands.clone())
            } else {
                let ctx = FailoverContext {
                    local_role: session.role,
                    local_id: session.player_id,
                    roster: session.roster(),
                    master_addr: session.master_addr,
                };
                (failover::plan(&ctx, addr), None)
            }
        };

        if let Some(commands) = commands {
            if commands.send(Command::PeerTimedOut { addr }).await.is_err() {
                debug!("Coordinator stopped, timeout of {} dropped", addr);
            }
            return;
        }

        for action in actions {
            match action {
                FailoverAction::PromoteSelf => {
                    self.take_over(addr).await;
                    return;
                }
                FailoverAction::RedirectToDeputy { addr: deputy } => {
                    info!("MASTER {} lost, sending to DEPUTY {}", addr, deputy);
                    self.session.write().await.follow_master(deputy);
                }
                _ => {}
            }
        }
    }
}

fn bind_multicast(group: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // several nodes on one host share the group port
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Reads datagrams until shutdown; each one is handled on its own task
async fn receive_loop(
    inner: Arc<Inner>,
    socket: Arc<UdpSocket>,
    channel: Channel,
    mut shutdown: Shutdown,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = finished {
                    error!("Handler task failed: {}", e);
                }
            }
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, addr)) => {
                    let datagram = buffer[..len].to_vec();
                    handlers.spawn(Arc::clone(&inner).handle_datagram(datagram, addr, channel));
                }
                Err(e) => {
                    error!("Error receiving on {:?} socket: {}", channel, e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    while let Some(finished) = handlers.join_next().await {
        if let Err(e) = finished {
            error!("Handler task failed: {}", e);
        }
    }
    debug!("{:?} receive loop stopped", channel);
}

/// Pings every peer we have not sent anything to for a while
async fn ping_loop(inner: Arc<Inner>, mut shutdown: Shutdown) {
    loop {
        let period = inner.activity.lock().await.ping_period();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(period) => {}
        }

        let targets = inner.activity.lock().await.take_ping_targets();
        if targets.is_empty() {
            continue;
        }
        let local_id = inner.session.read().await.player_id;
        for addr in targets {
            inner.transport.send(addr, local_id, 0, Payload::Ping).await;
        }
    }
}

/// Drops silent peers and runs failover for each of them
async fn reaper_loop(inner: Arc<Inner>, mut shutdown: Shutdown) {
    loop {
        let period = inner.activity.lock().await.reaper_period();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(period) => {}
        }

        let lost = inner.activity.lock().await.reap_timeouts();
        for addr in lost {
            inner.handle_peer_timeout(addr).await;
        }
    }
}

/// Re-broadcasts the session announcement while this node is MASTER
async fn announce_loop(inner: Arc<Inner>, mut shutdown: Shutdown) {
    let mut ticker = interval(ANNOUNCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (announcement, local_id) = {
            let session = inner.session.read().await;
            if !session.is_master() {
                break;
            }
            (session.announcement.clone(), session.player_id)
        };
        if let Some(announcement) = announcement {
            inner.transport.announce(local_id, announcement).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;

    fn small_config() -> GameConfig {
        GameConfig::new(20, 20, 1, 100).unwrap()
    }

    #[tokio::test]
    async fn test_bind_loopback_node() {
        let node = tokio_test::assert_ok!(Node::bind(NodeConfig::loopback()).await);
        assert!(node.local_addr().ip().is_loopback());
        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.role().await, NodeRole::Normal);
        assert_eq!(node.player_id().await, 0);
        assert!(node.view().await.is_none());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_host_becomes_master() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        let id = node
            .host_with_ids("arena", "host", small_config(), Box::new(SequentialIds::starting_at(7)))
            .await
            .unwrap();

        assert_eq!(id, 7);
        assert_eq!(node.role().await, NodeRole::Master);
        assert_eq!(node.master_addr().await, Some(node.local_addr()));
        assert!(node.announcement().await.unwrap().can_join);
        assert!(matches!(
            node.host("again", "host", small_config()).await,
            Err(NodeError::AlreadyInSession)
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_ticks_its_own_snapshot() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        node.host("arena", "host", small_config()).await.unwrap();

        let mut tick = 0;
        for _ in 0..100 {
            tick = node.view().await.map(|view| view.tick).unwrap_or(0);
            if tick >= 3 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(tick >= 3);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_steer_requires_session() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        assert!(matches!(
            node.steer(Direction::Up).await,
            Err(NodeError::NotInSession)
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        assert!(matches!(
            node.join("nowhere", "me", NodeRole::Normal).await,
            Err(NodeError::UnknownSession(_))
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_times_out_without_master() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = NodeConfig::loopback();
        config.join_timeout = Duration::from_millis(300);
        let node = Node::bind(config).await.unwrap();

        let result = node
            .join_at(silent.local_addr().unwrap(), "arena", small_config(), "me", NodeRole::Normal)
            .await;
        assert!(matches!(result, Err(NodeError::JoinTimeout(_))));
        assert!(node.game_name().await.is_none());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        node.host("arena", "host", small_config()).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[0xff, 0x00, 0x13], node.local_addr()).await.unwrap();
        peer.send_to(&[], node.local_addr()).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(node.role().await, NodeRole::Master);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_raw_join_gets_ack_with_new_id() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        node.host_with_ids("arena", "host", small_config(), Box::new(SequentialIds::starting_at(1)))
            .await
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let join = Envelope::new(
            41,
            0,
            0,
            Payload::Join {
                player_name: "raw".into(),
                kind: PlayerKind::Robot,
                game_name: "arena".into(),
                requested_role: NodeRole::Normal,
            },
        );
        peer.send_to(&join.encode().unwrap(), node.local_addr())
            .await
            .unwrap();

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let ack = loop {
            let (len, _) = peer.recv_from(&mut buffer).await.unwrap();
            let envelope = Envelope::decode(&buffer[..len]).unwrap();
            if envelope.payload == Payload::Ack {
                break envelope;
            }
        };
        assert_eq!(ack.seq, 41);
        assert_eq!(ack.receiver_id, 2);
        assert_eq!(ack.sender_id, 1);
        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_sender_cannot_redirect_follower() {
        let master = Node::bind(NodeConfig::loopback()).await.unwrap();
        master
            .host_with_ids("arena", "host", small_config(), Box::new(SequentialIds::starting_at(1)))
            .await
            .unwrap();
        let follower = Node::bind(NodeConfig::loopback()).await.unwrap();
        follower
            .join_at(master.local_addr(), "arena", small_config(), "bob", NodeRole::Normal)
            .await
            .unwrap();

        let mut known = None;
        for _ in 0..100 {
            known = follower.snapshot().await;
            if known.as_ref().map(|s| s.players.len() == 2).unwrap_or(false) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let mut forged = (*known.unwrap()).clone();
        forged.tick = 1_000_000;

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let role_change = Envelope::new(
            1,
            999,
            2,
            Payload::RoleChange {
                sender_role: Some(NodeRole::Master),
                receiver_role: Some(NodeRole::Master),
            },
        );
        let state = Envelope::new(2, 999, 2, Payload::State { snapshot: forged });
        for envelope in [role_change, state] {
            stranger
                .send_to(&envelope.encode().unwrap(), follower.local_addr())
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        assert_eq!(follower.master_addr().await, Some(master.local_addr()));
        assert_ne!(follower.role().await, NodeRole::Master);
        assert!(follower.snapshot().await.unwrap().tick < 1_000_000);

        follower.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_takeover_starts_one_coordinator() {
        let node = Node::bind(NodeConfig::loopback()).await.unwrap();
        let old_master: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        {
            let mut session = node.inner.session.write().await;
            session.role = NodeRole::Deputy;
            session.player_id = 2;
            session.game_name = Some("arena".into());
            session.config = Some(small_config());
            session.master_addr = Some(old_master);
            session.snapshot = Some(Arc::new(GameSnapshot {
                tick: 4,
                snakes: vec![],
                food: vec![],
                players: vec![
                    shared::Player::new(1, "a", PlayerKind::Human, NodeRole::Master)
                        .with_address(old_master),
                    shared::Player::new(2, "b", PlayerKind::Human, NodeRole::Deputy),
                ],
            }));
        }
        let base_tasks = node.inner.tasks.lock().await.len();

        tokio::join!(
            node.inner.take_over(old_master),
            node.inner.take_over(old_master)
        );

        assert_eq!(node.role().await, NodeRole::Master);
        // coordinator, state broadcaster and announcer
        assert_eq!(node.inner.tasks.lock().await.len(), base_tasks + 3);
        node.shutdown().await;
    }
}
