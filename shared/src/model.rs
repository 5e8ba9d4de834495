//! Game entities exchanged between nodes
//!
//! Everything here is plain data: the simulation engine mutates these values on
//! the MASTER and followers receive them verbatim inside snapshots.

use crate::GameConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A cell on the toroidal field
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Unit step of this direction; y grows downwards
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

/// Returns true when `new` would turn the snake back onto itself
pub fn is_reverse_direction(current: Direction, new: Direction) -> bool {
    current.opposite() == new
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Normal,
    Master,
    Deputy,
    Viewer,
}

impl NodeRole {
    /// Roles that own a snake on the field
    pub fn is_player(self) -> bool {
        !matches!(self, NodeRole::Viewer)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeRole::Normal => "NORMAL",
            NodeRole::Master => "MASTER",
            NodeRole::Deputy => "DEPUTY",
            NodeRole::Viewer => "VIEWER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Human,
    Robot,
}

/// Roster entry; one per participating node
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: i32,
    pub name: String,
    pub kind: PlayerKind,
    pub role: NodeRole,
    pub score: i32,
    /// Unicast address observed by the MASTER at join time; empty for the MASTER itself
    pub address: Option<SocketAddr>,
}

impl Player {
    pub fn new(id: i32, name: impl Into<String>, kind: PlayerKind, role: NodeRole) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            role,
            score: 0,
            address: None,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SnakeState {
    Alive,
    Zombie,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Snake {
    pub player_id: i32,
    /// Occupied cells, head first
    pub cells: Vec<Coord>,
    pub heading: Direction,
    pub state: SnakeState,
}

impl Snake {
    pub fn new(player_id: i32, head: Coord, tail: Coord, heading: Direction) -> Self {
        Self {
            player_id,
            cells: vec![head, tail],
            heading,
            state: SnakeState::Alive,
        }
    }

    pub fn head(&self) -> Coord {
        self.cells[0]
    }

    pub fn is_alive(&self) -> bool {
        self.state == SnakeState::Alive
    }
}

/// Full replicated state of a session at one tick
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GameSnapshot {
    pub tick: u64,
    pub snakes: Vec<Snake>,
    pub food: Vec<Coord>,
    pub players: Vec<Player>,
}

impl GameSnapshot {
    pub fn player(&self, id: i32) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn snake(&self, player_id: i32) -> Option<&Snake> {
        self.snakes.iter().find(|s| s.player_id == player_id)
    }

    pub fn alive_snakes(&self) -> usize {
        self.snakes.iter().filter(|s| s.is_alive()).count()
    }
}

/// What a MASTER advertises on the multicast group
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GameAnnouncement {
    pub name: String,
    pub config: GameConfig,
    pub players: Vec<Player>,
    pub can_join: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_is_an_involution() {
        for dir in Direction::ALL {
            assert_eq!(dir.opposite().opposite(), dir);
            assert_ne!(dir.opposite(), dir);
        }
    }

    #[test]
    fn test_reverse_direction_only_for_opposites() {
        for current in Direction::ALL {
            for new in Direction::ALL {
                assert_eq!(
                    is_reverse_direction(current, new),
                    new == current.opposite(),
                    "{:?} -> {:?}",
                    current,
                    new
                );
            }
        }
    }

    #[test]
    fn test_opposite_deltas_cancel() {
        for dir in Direction::ALL {
            let (dx, dy) = dir.delta();
            let (ox, oy) = dir.opposite().delta();
            assert_eq!((dx + ox, dy + oy), (0, 0));
        }
    }

    #[test]
    fn test_snake_creation() {
        let snake = Snake::new(7, Coord::new(3, 3), Coord::new(2, 3), Direction::Right);
        assert_eq!(snake.head(), Coord::new(3, 3));
        assert_eq!(snake.cells.len(), 2);
        assert!(snake.is_alive());
    }

    #[test]
    fn test_viewer_is_not_a_player() {
        assert!(!NodeRole::Viewer.is_player());
        assert!(NodeRole::Master.is_player());
        assert!(NodeRole::Deputy.is_player());
        assert!(NodeRole::Normal.is_player());
    }

    #[test]
    fn test_snapshot_lookups() {
        let snapshot = GameSnapshot {
            tick: 4,
            snakes: vec![Snake::new(1, Coord::new(0, 0), Coord::new(0, 1), Direction::Up)],
            food: vec![],
            players: vec![Player::new(1, "ann", PlayerKind::Human, NodeRole::Master)],
        };

        assert_eq!(snapshot.player(1).map(|p| p.name.as_str()), Some("ann"));
        assert!(snapshot.player(2).is_none());
        assert!(snapshot.snake(1).is_some());
        assert_eq!(snapshot.alive_snakes(), 1);
    }
}
