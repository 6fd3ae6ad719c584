//! Core type definitions for the simulation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for any entity (food or agent).
///
/// Ids are handed out by the entity store in strictly increasing order and
/// are never reused, so ordering by id is ordering by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 2D position (or displacement) on the substrate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` (radians)
    pub fn from_angle(angle: f32) -> Self {
        Self {
            x: angle.cos(),
            y: angle.sin(),
        }
    }

    pub fn add(&self, other: Position) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    pub fn sub(&self, other: Position) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn scale(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
        }
    }

    pub fn dot(&self, other: Position) -> f32 {
        self.x * other.x + self.y * other.y
    }

    pub fn length(&self) -> f32 {
        self.x.hypot(self.y)
    }

    pub fn distance(&self, other: &Position) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn distance_sq(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Agent species. Behaviour shared by all agents is implemented once over the
/// common agent record; the species only selects a parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Species {
    Bacteria,
    Predator,
}

impl Species {
    pub fn all() -> [Species; 2] {
        [Species::Bacteria, Species::Predator]
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Species::Bacteria => EntityKind::Bacteria,
            Species::Predator => EntityKind::Predator,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Species::Bacteria => "bacteria",
            Species::Predator => "predator",
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of entity stored in the spatial index or seen by a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Food,
    Bacteria,
    Predator,
}

impl EntityKind {
    /// Numeric code written into tagged sensor readings. Zero is reserved for
    /// "nothing seen".
    pub fn sensor_code(&self) -> f32 {
        match self {
            EntityKind::Food => 1.0,
            EntityKind::Bacteria => 0.5,
            EntityKind::Predator => -1.0,
        }
    }
}

/// Per-kind visibility mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFilter {
    pub food: bool,
    pub bacteria: bool,
    pub predators: bool,
}

impl KindFilter {
    pub const ALL: KindFilter = KindFilter {
        food: true,
        bacteria: true,
        predators: true,
    };

    pub const FOOD: KindFilter = KindFilter {
        food: true,
        bacteria: false,
        predators: false,
    };

    pub const AGENTS: KindFilter = KindFilter {
        food: false,
        bacteria: true,
        predators: true,
    };

    pub fn only(kind: EntityKind) -> Self {
        Self {
            food: kind == EntityKind::Food,
            bacteria: kind == EntityKind::Bacteria,
            predators: kind == EntityKind::Predator,
        }
    }

    pub fn matches(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Food => self.food,
            EntityKind::Bacteria => self.bacteria,
            EntityKind::Predator => self.predators,
        }
    }

    /// Enabled kinds in a fixed order (food, bacteria, predators)
    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.food {
            kinds.push(EntityKind::Food);
        }
        if self.bacteria {
            kinds.push(EntityKind::Bacteria);
        }
        if self.predators {
            kinds.push(EntityKind::Predator);
        }
        kinds
    }

    pub fn count(&self) -> usize {
        self.food as usize + self.bacteria as usize + self.predators as usize
    }
}

/// Why an agent was queued for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeathCause {
    /// Eaten by a predator
    Predation,
    /// Removed after an internal inconsistency (e.g. sensor/controller mismatch)
    Culled,
    /// Energy at or below the death threshold
    Starvation,
    /// Exceeded the species' maximum age
    OldAge,
}
