//! Outbound datagrams
//!
//! All unicast traffic leaves through [`Transport`], which stamps per-node
//! sequence numbers and records activity for the liveness tracker. A failed
//! send is logged and abandoned; the next periodic ping or snapshot retries
//! naturally.

use crate::activity::ActivityTracker;
use crate::error::{NodeError, NodeResult};
use log::{debug, error, warn};
use shared::{Envelope, GameAnnouncement, Payload};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// A message queued by the simulation side for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub receiver_id: i32,
    pub payload: Payload,
}

impl Outgoing {
    pub fn new(addr: SocketAddr, receiver_id: i32, payload: Payload) -> Self {
        Self {
            addr,
            receiver_id,
            payload,
        }
    }
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    seq: AtomicI64,
    activity: Arc<Mutex<ActivityTracker>>,
    multicast_group: Option<SocketAddrV4>,
}

impl Transport {
    pub fn new(
        socket: Arc<UdpSocket>,
        activity: Arc<Mutex<ActivityTracker>>,
        multicast_group: Option<SocketAddrV4>,
    ) -> NodeResult<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            seq: AtomicI64::new(1),
            activity,
            multicast_group,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a fresh message; returns false when it was abandoned
    pub async fn send(
        &self,
        addr: SocketAddr,
        sender_id: i32,
        receiver_id: i32,
        payload: Payload,
    ) -> bool {
        let envelope = Envelope::new(self.next_seq(), sender_id, receiver_id, payload);
        self.deliver(&envelope, addr).await
    }

    /// Answers a request, echoing its sequence number
    pub async fn reply(
        &self,
        addr: SocketAddr,
        request_seq: i64,
        sender_id: i32,
        receiver_id: i32,
        payload: Payload,
    ) -> bool {
        let envelope = Envelope::new(request_seq, sender_id, receiver_id, payload);
        self.deliver(&envelope, addr).await
    }

    pub async fn send_all(&self, sender_id: i32, outgoing: Vec<Outgoing>) {
        for message in outgoing {
            self.send(message.addr, sender_id, message.receiver_id, message.payload)
                .await;
        }
    }

    /// Multicasts the session announcement from the unicast socket, so the
    /// source address receivers see is where JOIN has to go
    pub async fn announce(&self, sender_id: i32, announcement: GameAnnouncement) -> bool {
        let Some(group) = self.multicast_group else {
            return false;
        };
        let envelope = Envelope::new(
            self.next_seq(),
            sender_id,
            0,
            Payload::Announcement {
                games: vec![announcement],
            },
        );
        match self.send_packet_impl(&envelope, SocketAddr::V4(group)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to announce session on {}: {}", group, e);
                false
            }
        }
    }

    async fn deliver(&self, envelope: &Envelope, addr: SocketAddr) -> bool {
        match self.send_packet_impl(envelope, addr).await {
            Ok(()) => {
                self.activity.lock().await.record_sent(addr);
                debug!(
                    "Sent {} #{} to {}",
                    envelope.payload.kind(),
                    envelope.seq,
                    addr
                );
                true
            }
            Err(NodeError::Codec(e)) => {
                error!("Failed to encode {} for {}: {}", envelope.payload.kind(), addr, e);
                false
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", envelope.payload.kind(), addr, e);
                false
            }
        }
    }

    async fn send_packet_impl(&self, envelope: &Envelope, addr: SocketAddr) -> NodeResult<()> {
        let data = envelope.encode()?;
        self.socket.send_to(&data, addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn transport() -> (Transport, Arc<Mutex<ActivityTracker>>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let activity = Arc::new(Mutex::new(ActivityTracker::new(Duration::from_millis(1000))));
        let transport = Transport::new(socket, Arc::clone(&activity), None).unwrap();
        (transport, activity)
    }

    #[tokio::test]
    async fn test_send_stamps_increasing_sequence() {
        let (transport, _) = transport().await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        assert!(transport.send(addr, 3, 4, Payload::Ping).await);
        assert!(transport.send(addr, 3, 4, Payload::Ack).await);

        let mut buffer = [0u8; 1024];
        let (len, from) = receiver.recv_from(&mut buffer).await.unwrap();
        let first = Envelope::decode(&buffer[..len]).unwrap();
        let (len, _) = receiver.recv_from(&mut buffer).await.unwrap();
        let second = Envelope::decode(&buffer[..len]).unwrap();

        assert_eq!(from, transport.local_addr());
        assert_eq!(first.sender_id, 3);
        assert_eq!(first.receiver_id, 4);
        assert_eq!(first.payload, Payload::Ping);
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_reply_echoes_request_sequence() {
        let (transport, _) = transport().await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        transport.reply(addr, 77, 1, 9, Payload::Ack).await;

        let mut buffer = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buffer).await.unwrap();
        let envelope = Envelope::decode(&buffer[..len]).unwrap();
        assert_eq!(envelope.seq, 77);
        assert_eq!(envelope.receiver_id, 9);
    }

    #[tokio::test]
    async fn test_send_records_activity() {
        let (transport, activity) = transport().await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        transport.send(addr, 1, 0, Payload::Ping).await;
        assert!(activity.lock().await.contains(&addr));
    }

    #[tokio::test]
    async fn test_announce_without_group_is_skipped() {
        let (transport, _) = transport().await;
        let announcement = GameAnnouncement {
            name: "arena".into(),
            config: shared::GameConfig::default(),
            players: vec![],
            can_join: true,
        };
        assert!(!transport.announce(1, announcement).await);
    }
}
