//! Wire envelope and the closed set of payloads
//!
//! Every datagram carries exactly one [`Envelope`]. Sequence numbers are
//! per-sender and monotonic, but receivers never reject duplicates or
//! reordered datagrams, so every handler on the receiving side has to be
//! idempotent.

use crate::{Direction, GameAnnouncement, GameSnapshot, NodeRole, PlayerKind};
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("malformed datagram: {0}")]
    Decode(#[source] bincode::Error),
    #[error("empty datagram")]
    Empty,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Liveness probe, no body
    Ping,
    Steer {
        direction: Direction,
    },
    Ack,
    State {
        snapshot: GameSnapshot,
    },
    Announcement {
        games: Vec<GameAnnouncement>,
    },
    Join {
        player_name: String,
        kind: PlayerKind,
        game_name: String,
        requested_role: NodeRole,
    },
    Error {
        message: String,
    },
    /// `sender_role` is the role the sender now holds, `receiver_role` the
    /// role assigned to the receiver; either may be absent
    RoleChange {
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping => "PING",
            Payload::Steer { .. } => "STEER",
            Payload::Ack => "ACK",
            Payload::State { .. } => "STATE",
            Payload::Announcement { .. } => "ANNOUNCEMENT",
            Payload::Join { .. } => "JOIN",
            Payload::Error { .. } => "ERROR",
            Payload::RoleChange { .. } => "ROLE_CHANGE",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub seq: i64,
    /// 0 until the MASTER assigns an id
    pub sender_id: i32,
    /// 0 for broadcast or when unused
    pub receiver_id: i32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(seq: i64, sender_id: i32, receiver_id: i32, payload: Payload) -> Self {
        Self {
            seq,
            sender_id,
            receiver_id,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec().serialize(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        codec().deserialize(bytes).map_err(CodecError::Decode)
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .reject_trailing_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coord, GameConfig, Player, Snake};

    fn sample_snapshot() -> GameSnapshot {
        GameSnapshot {
            tick: 42,
            snakes: vec![Snake::new(
                1,
                Coord::new(5, 5),
                Coord::new(4, 5),
                Direction::Right,
            )],
            food: vec![Coord::new(1, 2), Coord::new(8, 9)],
            players: vec![Player::new(1, "alice", PlayerKind::Human, NodeRole::Master)],
        }
    }

    #[test]
    fn test_envelope_serialization_state() {
        let envelope = Envelope::new(
            17,
            1,
            2,
            Payload::State {
                snapshot: sample_snapshot(),
            },
        );

        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.seq, 17);
        assert_eq!(decoded.sender_id, 1);
        assert_eq!(decoded.receiver_id, 2);
        match decoded.payload {
            Payload::State { snapshot } => {
                assert_eq!(snapshot.tick, 42);
                assert_eq!(snapshot.food.len(), 2);
                assert_eq!(snapshot.snakes[0].cells[0], Coord::new(5, 5));
            }
            other => panic!("Wrong payload after decoding: {}", other.kind()),
        }
    }

    #[test]
    fn test_envelope_serialization_join() {
        let envelope = Envelope::new(
            1,
            0,
            0,
            Payload::Join {
                player_name: "bob".to_string(),
                kind: PlayerKind::Human,
                game_name: "arena".to_string(),
                requested_role: NodeRole::Viewer,
            },
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_serialization_announcement() {
        let announcement = GameAnnouncement {
            name: "arena".to_string(),
            config: GameConfig::default(),
            players: sample_snapshot().players,
            can_join: false,
        };
        let envelope = Envelope::new(
            3,
            1,
            0,
            Payload::Announcement {
                games: vec![announcement],
            },
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        match decoded.payload {
            Payload::Announcement { games } => {
                assert_eq!(games.len(), 1);
                assert_eq!(games[0].name, "arena");
                assert!(!games[0].can_join);
            }
            other => panic!("Wrong payload after decoding: {}", other.kind()),
        }
    }

    #[test]
    fn test_role_change_keeps_optional_roles() {
        let envelope = Envelope::new(
            9,
            3,
            4,
            Payload::RoleChange {
                sender_role: Some(NodeRole::Master),
                receiver_role: None,
            },
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.payload,
            Payload::RoleChange {
                sender_role: Some(NodeRole::Master),
                receiver_role: None,
            }
        );
    }

    #[test]
    fn test_decode_rejects_empty_datagram() {
        assert!(matches!(Envelope::decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_decode_rejects_truncated_datagram() {
        let bytes = Envelope::new(1, 1, 0, Payload::State { snapshot: sample_snapshot() })
            .encode()
            .unwrap();
        let result = Envelope::decode(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Envelope::new(1, 1, 0, Payload::Ping).encode().unwrap();
        bytes.push(0);
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_variant() {
        let mut bytes = Envelope::new(1, 1, 0, Payload::Ack).encode().unwrap();
        // last byte is the payload discriminant for a unit variant
        let last = bytes.len() - 1;
        bytes[last] = 0x7f;
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_payload_kind_names() {
        assert_eq!(Payload::Ping.kind(), "PING");
        assert_eq!(
            Payload::Steer {
                direction: Direction::Up
            }
            .kind(),
            "STEER"
        );
        assert_eq!(
            Payload::Error {
                message: String::new()
            }
            .kind(),
            "ERROR"
        );
    }
}
