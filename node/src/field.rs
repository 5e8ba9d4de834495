//! Toroidal grid geometry

use shared::{Coord, Direction, GameConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub width: i32,
    pub height: i32,
}

impl Field {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn from_config(config: &GameConfig) -> Self {
        Self::new(config.width, config.height)
    }

    pub fn contains(&self, coord: Coord) -> bool {
        (0..self.width).contains(&coord.x) && (0..self.height).contains(&coord.y)
    }

    /// Maps any coordinate back onto the field, wrapping both axes
    pub fn wrap(&self, coord: Coord) -> Coord {
        Coord::new(
            coord.x.rem_euclid(self.width),
            coord.y.rem_euclid(self.height),
        )
    }

    /// The neighbouring cell in `direction`
    pub fn step(&self, from: Coord, direction: Direction) -> Coord {
        let (dx, dy) = direction.delta();
        self.wrap(Coord::new(from.x + dx, from.y + dy))
    }

    pub fn cells(&self) -> impl Iterator<Item = Coord> + '_ {
        (0..self.height).flat_map(move |y| (0..self.width).map(move |x| Coord::new(x, y)))
    }

    /// Cells of the `size`×`size` square centred on `center`, wrapped
    pub fn block(&self, center: Coord, size: i32) -> impl Iterator<Item = Coord> + '_ {
        let half = size / 2;
        (-half..size - half).flat_map(move |dy| {
            (-half..size - half).map(move |dx| self.wrap(Coord::new(center.x + dx, center.y + dy)))
        })
    }

    pub fn cell_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}
