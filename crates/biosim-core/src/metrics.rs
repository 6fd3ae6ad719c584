//! Population statistics gathered by the engine.

use crate::types::{DeathCause, Species};
use serde::{Deserialize, Serialize};

/// Aggregate statistics for one species
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesStats {
    /// Live agents (queued deaths excluded)
    pub count: usize,
    pub mean_energy: f32,
    pub mean_age: f32,
    pub max_generation: u32,
    /// Distinct controller signatures among live agents
    pub architectures: usize,
}

impl SpeciesStats {
    /// Accumulate stats from `(energy, age, generation)` triples
    pub fn from_samples<I>(samples: I, architectures: usize) -> Self
    where
        I: IntoIterator<Item = (f32, f32, u32)>,
    {
        let mut stats = SpeciesStats {
            architectures,
            ..Default::default()
        };
        let mut energy = 0.0f64;
        let mut age = 0.0f64;
        for (e, a, generation) in samples {
            stats.count += 1;
            energy += e as f64;
            age += a as f64;
            stats.max_generation = stats.max_generation.max(generation);
        }
        if stats.count > 0 {
            stats.mean_energy = (energy / stats.count as f64) as f32;
            stats.mean_age = (age / stats.count as f64) as f32;
        }
        stats
    }
}

/// Running counters plus the latest per-species summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationMetrics {
    /// Completed calls to `step`
    pub steps: u64,
    /// Simulated seconds elapsed
    pub time: f64,
    pub food_count: usize,
    pub bacteria: SpeciesStats,
    pub predators: SpeciesStats,
    pub births: u64,
    pub food_eaten: u64,
    pub food_spawned: u64,
    pub deaths: DeathCounters,
    /// Agents marked dead but not yet purged because of the per-step quota
    pub pending_deaths: usize,
    pub rejected_commands: u64,
    pub applied_commands: u64,
}

impl PopulationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn species(&self, species: Species) -> &SpeciesStats {
        match species {
            Species::Bacteria => &self.bacteria,
            Species::Predator => &self.predators,
        }
    }

    pub fn species_mut(&mut self, species: Species) -> &mut SpeciesStats {
        match species {
            Species::Bacteria => &mut self.bacteria,
            Species::Predator => &mut self.predators,
        }
    }

    pub fn living_agents(&self) -> usize {
        self.bacteria.count + self.predators.count
    }
}

/// Purged agents by cause
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathCounters {
    pub predation: u64,
    pub culled: u64,
    pub starvation: u64,
    pub old_age: u64,
}

impl DeathCounters {
    pub fn record(&mut self, cause: DeathCause) {
        match cause {
            DeathCause::Predation => self.predation += 1,
            DeathCause::Culled => self.culled += 1,
            DeathCause::Starvation => self.starvation += 1,
            DeathCause::OldAge => self.old_age += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.predation + self.culled + self.starvation + self.old_age
    }
}
