//! Movement model weighting the predicted neighbor windows

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tolerance on the probability sum, absorbs rounding in hand-written configs
pub const PROBABILITY_EPSILON: f64 = 1e-4;

/// A user movement between two consecutive windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Right,
    UpRight,
    Up,
    UpLeft,
    Left,
    DownLeft,
    Down,
    DownRight,
    ZoomIn,
    ZoomOut,
}

impl Direction {
    /// The eight panning directions, counter-clockwise from the right
    pub const PANS: [Direction; 8] = [
        Direction::Right,
        Direction::UpRight,
        Direction::Up,
        Direction::UpLeft,
        Direction::Left,
        Direction::DownLeft,
        Direction::Down,
        Direction::DownRight,
    ];

    /// Unit shift of a pan in region-size steps, `None` for zooms
    pub fn shift(&self) -> Option<(i64, i64)> {
        match self {
            Direction::Right => Some((1, 0)),
            Direction::UpRight => Some((1, -1)),
            Direction::Up => Some((0, -1)),
            Direction::UpLeft => Some((-1, -1)),
            Direction::Left => Some((-1, 0)),
            Direction::DownLeft => Some((-1, 1)),
            Direction::Down => Some((0, 1)),
            Direction::DownRight => Some((1, 1)),
            Direction::ZoomIn | Direction::ZoomOut => None,
        }
    }
}

/// Probabilities of each possible movement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MovementProbabilities", into = "MovementProbabilities")]
pub struct MovementModel {
    probabilities: MovementProbabilities,
}

/// Raw probabilities as found in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementProbabilities {
    pub right: f64,
    pub up_right: f64,
    pub up: f64,
    pub up_left: f64,
    pub left: f64,
    pub down_left: f64,
    pub down: f64,
    pub down_right: f64,
    pub zoom_in: f64,
    pub zoom_out: f64,
}

impl MovementProbabilities {
    /// Same probability for every movement
    pub fn uniform(p: f64) -> Self {
        Self {
            right: p,
            up_right: p,
            up: p,
            up_left: p,
            left: p,
            down_left: p,
            down: p,
            down_right: p,
            zoom_in: p,
            zoom_out: p,
        }
    }

    fn values(&self) -> [f64; 10] {
        [
            self.right,
            self.up_right,
            self.up,
            self.up_left,
            self.left,
            self.down_left,
            self.down,
            self.down_right,
            self.zoom_in,
            self.zoom_out,
        ]
    }
}

impl MovementModel {
    /// Validates and wraps movement probabilities
    ///
    /// Each value must lie in `[0, 1]` and the sum may exceed 1 by at most
    /// [`PROBABILITY_EPSILON`].
    pub fn new(probabilities: MovementProbabilities) -> Result<Self> {
        let values = probabilities.values();
        if let Some(bad) = values.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(Error::InvalidMovement(format!(
                "probability {} outside [0, 1]",
                bad
            )));
        }
        let sum: f64 = values.iter().sum();
        if sum > 1.0 + PROBABILITY_EPSILON {
            return Err(Error::InvalidMovement(format!(
                "probabilities sum to {}",
                sum
            )));
        }
        Ok(Self { probabilities })
    }

    pub fn probabilities(&self) -> &MovementProbabilities {
        &self.probabilities
    }

    pub fn probability(&self, direction: Direction) -> f64 {
        let p = &self.probabilities;
        match direction {
            Direction::Right => p.right,
            Direction::UpRight => p.up_right,
            Direction::Up => p.up,
            Direction::UpLeft => p.up_left,
            Direction::Left => p.left,
            Direction::DownLeft => p.down_left,
            Direction::Down => p.down,
            Direction::DownRight => p.down_right,
            Direction::ZoomIn => p.zoom_in,
            Direction::ZoomOut => p.zoom_out,
        }
    }

    pub fn max_probability(&self) -> f64 {
        self.probabilities.values().into_iter().fold(0.0, f64::max)
    }

    pub fn min_probability(&self) -> f64 {
        self.probabilities.values().into_iter().fold(1.0, f64::min)
    }

    /// Probability relative to the most likely movement, 0 if nothing moves
    pub fn weight(&self, direction: Direction) -> f64 {
        let max = self.max_probability();
        if max <= 0.0 {
            0.0
        } else {
            self.probability(direction) / max
        }
    }
}

impl Default for MovementModel {
    fn default() -> Self {
        Self {
            probabilities: MovementProbabilities::uniform(0.1),
        }
    }
}

impl TryFrom<MovementProbabilities> for MovementModel {
    type Error = Error;

    fn try_from(probabilities: MovementProbabilities) -> Result<Self> {
        MovementModel::new(probabilities)
    }
}

impl From<MovementModel> for MovementProbabilities {
    fn from(model: MovementModel) -> Self {
        model.probabilities
    }
}
