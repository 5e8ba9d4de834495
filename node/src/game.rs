//! Deterministic per-tick snake simulation
//!
//! The engine only runs on the MASTER. It owns the field, snakes, food and the
//! roster with scores; followers never tick, they replace their view with the
//! snapshots the MASTER produces. Given the same seed and the same sequence of
//! calls, two engines produce identical snapshots.

use crate::error::{NodeError, NodeResult};
use crate::field::Field;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::{
    is_reverse_direction, Coord, Direction, GameConfig, GameSnapshot, NodeRole, Player, Snake,
    SnakeState, SPAWN_ATTEMPTS, SPAWN_BLOCK_SIZE,
};
use std::collections::{HashMap, HashSet};

/// Chance that a cell of a freshly killed snake turns into food
const DEATH_FOOD_PROBABILITY: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Engine {
    config: GameConfig,
    field: Field,
    tick: u64,
    snakes: Vec<Snake>,
    food: Vec<Coord>,
    players: Vec<Player>,
    pending_steers: HashMap<i32, Direction>,
    rng: StdRng,
}

impl Engine {
    pub fn new(config: GameConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: GameConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: GameConfig, rng: StdRng) -> Self {
        Self {
            config,
            field: Field::from_config(&config),
            tick: 0,
            snakes: Vec::new(),
            food: Vec::new(),
            players: Vec::new(),
            pending_steers: HashMap::new(),
            rng,
        }
    }

    /// Rebuilds an engine from a replicated snapshot, e.g. when a DEPUTY takes over
    pub fn from_snapshot(config: GameConfig, snapshot: GameSnapshot) -> Self {
        let mut engine = Self::new(config);
        engine.restore(snapshot);
        engine
    }

    pub fn restore(&mut self, snapshot: GameSnapshot) {
        self.tick = snapshot.tick;
        self.snakes = snapshot.snakes;
        self.food = snapshot.food;
        self.players = snapshot.players;
        self.pending_steers.clear();
    }

    /// Lays out the initial static food
    pub fn init(&mut self) {
        let target = self.config.food_static.max(0) as usize;
        self.replenish_food(target);
        info!(
            "Field {}x{} initialised with {} food",
            self.field.width,
            self.field.height,
            self.food.len()
        );
    }

    /// Adds a player to the roster, spawning a snake unless it is a viewer
    ///
    /// Adding an id that is already present is a no-op. When no spawn
    /// position exists the roster is left untouched.
    pub fn add_player(&mut self, player: Player) -> NodeResult<()> {
        if self.player(player.id).is_some() {
            return Ok(());
        }

        if player.role.is_player() {
            let (head, tail, heading) = self.find_spawn().ok_or(NodeError::NoSpawnSpace)?;
            self.snakes.push(Snake::new(player.id, head, tail, heading));
            info!(
                "Spawned snake of player {} at ({}, {}) heading {:?}",
                player.id, head.x, head.y, heading
            );
        }

        info!("Added player {} `{}` as {}", player.id, player.name, player.role);
        self.players.push(player);
        Ok(())
    }

    /// Drops a player from the roster; its snake stays behind as a zombie
    pub fn remove_player(&mut self, player_id: i32) -> Option<Player> {
        let index = self.players.iter().position(|p| p.id == player_id)?;
        self.kill_player(player_id);
        self.pending_steers.remove(&player_id);
        let player = self.players.remove(index);
        info!("Removed player {}", player_id);
        Some(player)
    }

    pub fn kill_player(&mut self, player_id: i32) {
        if let Some(snake) = self.snakes.iter_mut().find(|s| s.player_id == player_id) {
            snake.state = SnakeState::Zombie;
        }
    }

    /// Changes a roster role; viewers lose their snake to the zombies
    pub fn set_role(&mut self, player_id: i32, role: NodeRole) -> bool {
        let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) else {
            return false;
        };
        player.role = role;
        if !role.is_player() {
            self.kill_player(player_id);
        }
        true
    }

    /// Buffers a steer intent for the next tick; the last one per tick wins
    pub fn steer(&mut self, player_id: i32, direction: Direction) -> NodeResult<()> {
        if !self.snakes.iter().any(|s| s.player_id == player_id) {
            return Err(NodeError::UnknownPeer(player_id));
        }
        self.pending_steers.insert(player_id, direction);
        Ok(())
    }

    /// Advances the simulation by one step and returns the resulting snapshot
    pub fn tick(&mut self) -> GameSnapshot {
        self.apply_steers();
        self.move_snakes();
        self.resolve_collisions();

        let target = self.config.food_static.max(0) as usize + self.alive_count();
        self.replenish_food(target);

        self.tick += 1;
        if self.tick % 50 == 0 {
            debug!(
                "Tick {}: {} alive snakes, {} food",
                self.tick,
                self.alive_count(),
                self.food.len()
            );
        }
        self.snapshot()
    }

    fn apply_steers(&mut self) {
        let steers = std::mem::take(&mut self.pending_steers);
        for (player_id, direction) in steers {
            let Some(snake) = self
                .snakes
                .iter_mut()
                .find(|s| s.player_id == player_id && s.is_alive())
            else {
                continue;
            };
            if !is_reverse_direction(snake.heading, direction) {
                snake.heading = direction;
            }
        }
    }

    fn move_snakes(&mut self) {
        let field = self.field;
        for snake in self.snakes.iter_mut().filter(|s| s.is_alive()) {
            let new_head = field.step(snake.head(), snake.heading);
            snake.cells.insert(0, new_head);

            let ate = match self.food.iter().position(|f| *f == new_head) {
                Some(index) => {
                    self.food.remove(index);
                    if let Some(player) = self.players.iter_mut().find(|p| p.id == snake.player_id)
                    {
                        player.score += 1;
                    }
                    true
                }
                None => false,
            };

            if !ate && snake.cells.len() > 2 {
                snake.cells.pop();
            }
        }
    }

    fn resolve_collisions(&mut self) {
        let mut head_counts: HashMap<Coord, usize> = HashMap::new();
        let mut obstacles: HashSet<Coord> = HashSet::new();

        for snake in &self.snakes {
            if snake.is_alive() {
                *head_counts.entry(snake.head()).or_default() += 1;
                obstacles.extend(snake.cells.iter().skip(1).copied());
            } else {
                obstacles.extend(snake.cells.iter().copied());
            }
        }

        let dead: Vec<usize> = self
            .snakes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_alive())
            .filter(|(_, s)| {
                let head = s.head();
                obstacles.contains(&head) || head_counts.get(&head).copied().unwrap_or(0) > 1
            })
            .map(|(index, _)| index)
            .collect();

        for index in dead {
            self.snakes[index].state = SnakeState::Zombie;
            info!("Snake of player {} died", self.snakes[index].player_id);

            let cells = self.snakes[index].cells.clone();
            for cell in cells {
                if self.rng.gen_bool(DEATH_FOOD_PROBABILITY) && !self.food.contains(&cell) {
                    self.food.push(cell);
                }
            }
        }
    }

    /// Tops food up to `target` using uniformly chosen empty cells; leaves a
    /// shortfall when the field has no room
    fn replenish_food(&mut self, target: usize) {
        if self.food.len() >= target {
            return;
        }
        let needed = target - self.food.len();

        let occupied = self.occupied_cells();
        let empty: Vec<Coord> = self
            .field
            .cells()
            .filter(|c| !occupied.contains(c))
            .collect();

        let chosen: Vec<Coord> = empty
            .choose_multiple(&mut self.rng, needed)
            .copied()
            .collect();
        self.food.extend(chosen);
    }

    fn occupied_cells(&self) -> HashSet<Coord> {
        self.snakes
            .iter()
            .flat_map(|s| s.cells.iter().copied())
            .chain(self.food.iter().copied())
            .collect()
    }

    /// Looks for a spawn: a 5×5 block without live snakes whose centre and
    /// a neighbouring tail cell hold neither food nor any snake
    fn find_spawn(&mut self) -> Option<(Coord, Coord, Direction)> {
        let field = self.field;
        let alive: HashSet<Coord> = self
            .snakes
            .iter()
            .filter(|s| s.is_alive())
            .flat_map(|s| s.cells.iter().copied())
            .collect();
        let blocked = self.occupied_cells();

        let mut centers: Vec<Coord> = field.cells().collect();
        centers.shuffle(&mut self.rng);

        for center in centers.into_iter().take(SPAWN_ATTEMPTS) {
            if blocked.contains(&center)
                || field
                    .block(center, SPAWN_BLOCK_SIZE)
                    .any(|c| alive.contains(&c))
            {
                continue;
            }

            let mut directions = Direction::ALL;
            directions.shuffle(&mut self.rng);
            for direction in directions {
                let tail = field.step(center, direction);
                if !blocked.contains(&tail) {
                    return Some((center, tail, direction.opposite()));
                }
            }
        }
        None
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            tick: self.tick,
            snakes: self.snakes.clone(),
            food: self.food.clone(),
            players: self.players.clone(),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, player_id: i32) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn snakes(&self) -> &[Snake] {
        &self.snakes
    }

    pub fn snake(&self, player_id: i32) -> Option<&Snake> {
        self.snakes.iter().find(|s| s.player_id == player_id)
    }

    pub fn food(&self) -> &[Coord] {
        &self.food
    }

    pub fn alive_count(&self) -> usize {
        self.snakes.iter().filter(|s| s.is_alive()).count()
    }
}
