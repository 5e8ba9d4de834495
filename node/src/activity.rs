//! Per-peer liveness bookkeeping
//!
//! Every unicast datagram sent to or received from a peer refreshes its
//! timestamps. Two periodic jobs read this table:
//! - the prober pings peers that have not been sent anything recently
//! - the reaper drops peers that have been silent for too long and reports
//!   them so failover can react
//!
//! Liveness is detected only here; sockets never use read deadlines.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Tracked state of one remote node
#[derive(Debug, Clone)]
pub struct PeerActivity {
    pub addr: SocketAddr,
    /// Last time we sent anything to this peer
    pub last_sent: Instant,
    /// Last time we received anything from this peer
    pub last_received: Instant,
}

impl PeerActivity {
    pub fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            last_sent: now,
            last_received: now,
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_received.elapsed() > timeout
    }

    pub fn needs_ping(&self, idle: Duration) -> bool {
        self.last_sent.elapsed() > idle
    }
}

/// Activity table shared by the send path, the receive path and the tickers
#[derive(Debug)]
pub struct ActivityTracker {
    peers: HashMap<SocketAddr, PeerActivity>,
    state_delay: Duration,
    ping_after: Duration,
    timeout: Duration,
}

impl ActivityTracker {
    /// Derives the ping and timeout thresholds from the session tick interval
    pub fn new(state_delay: Duration) -> Self {
        let mut tracker = Self {
            peers: HashMap::new(),
            state_delay: Duration::ZERO,
            ping_after: Duration::ZERO,
            timeout: Duration::ZERO,
        };
        tracker.configure(state_delay);
        tracker
    }

    pub fn configure(&mut self, state_delay: Duration) {
        self.state_delay = state_delay;
        self.ping_after = ping_interval(state_delay);
        self.timeout = state_delay.mul_f64(0.8);
    }

    pub fn record_sent(&mut self, addr: SocketAddr) {
        self.peers
            .entry(addr)
            .or_insert_with(|| PeerActivity::new(addr))
            .last_sent = Instant::now();
    }

    pub fn record_received(&mut self, addr: SocketAddr) {
        self.peers
            .entry(addr)
            .or_insert_with(|| PeerActivity::new(addr))
            .last_received = Instant::now();
    }

    /// Returns peers idle on our side and marks them as messaged
    ///
    /// The caller is expected to ping every returned address.
    pub fn take_ping_targets(&mut self) -> Vec<SocketAddr> {
        let idle = self.ping_after;
        let now = Instant::now();
        self.peers
            .values_mut()
            .filter(|peer| peer.needs_ping(idle))
            .map(|peer| {
                peer.last_sent = now;
                peer.addr
            })
            .collect()
    }

    /// Removes and returns every peer silent for longer than the timeout
    pub fn reap_timeouts(&mut self) -> Vec<SocketAddr> {
        let timeout = self.timeout;
        let timed_out: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.addr)
            .collect();

        for addr in &timed_out {
            self.peers.remove(addr);
            info!("Peer {} timed out", addr);
        }

        timed_out
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> bool {
        let removed = self.peers.remove(addr).is_some();
        if removed {
            debug!("Stopped tracking {}", addr);
        }
        removed
    }

    #[cfg(test)]
    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerActivity> {
        self.peers.get(addr)
    }

    #[cfg(test)]
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    #[cfg(test)]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ping_period(&self) -> Duration {
        ping_interval(self.state_delay)
    }

    pub fn reaper_period(&self) -> Duration {
        reaper_interval(self.state_delay)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Period of the prober, also the idle time after which a peer gets pinged
pub fn ping_interval(state_delay: Duration) -> Duration {
    state_delay / 10
}

/// Period of the timeout reaper
pub fn reaper_interval(state_delay: Duration) -> Duration {
    state_delay / 5
}
