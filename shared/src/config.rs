//! Session configuration agreed at creation time and carried in announcements

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

pub const WIDTH_RANGE: RangeInclusive<i32> = 10..=100;
pub const HEIGHT_RANGE: RangeInclusive<i32> = 10..=100;
pub const FOOD_STATIC_RANGE: RangeInclusive<i32> = 0..=100;
pub const STATE_DELAY_RANGE: RangeInclusive<i32> = 100..=3000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
}

/// Field size, static food and tick interval of a session
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    pub food_static: i32,
    pub state_delay_ms: i32,
}

impl GameConfig {
    /// Builds a configuration, rejecting values outside the protocol ranges
    pub fn new(
        width: i32,
        height: i32,
        food_static: i32,
        state_delay_ms: i32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            width,
            height,
            food_static,
            state_delay_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration that arrived from elsewhere (e.g. an announcement)
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("width", self.width, WIDTH_RANGE)?;
        check("height", self.height, HEIGHT_RANGE)?;
        check("food_static", self.food_static, FOOD_STATIC_RANGE)?;
        check("state_delay_ms", self.state_delay_ms, STATE_DELAY_RANGE)?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms.max(1) as u64)
    }

    pub fn cell_count(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: 40,
            height: 30,
            food_static: 1,
            state_delay_ms: 1000,
        }
    }
}

fn check(field: &'static str, value: i32, range: RangeInclusive<i32>) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}
