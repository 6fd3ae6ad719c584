//! Immutable world snapshots published for concurrent readers.

use crate::entity::{Agent, EntityStore, Food};
use biosim_core::{DeathCause, EntityId, PopulationMetrics, Position, SnapshotConfig, Species};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodRecord {
    pub id: EntityId,
    pub position: Position,
    pub radius: f32,
    pub value: f32,
}

impl From<&Food> for FoodRecord {
    fn from(food: &Food) -> Self {
        Self {
            id: food.id,
            position: food.position,
            radius: food.radius,
            value: food.value,
        }
    }
}

/// Read-only view of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: EntityId,
    pub species: Species,
    pub position: Position,
    pub heading: f32,
    pub speed: f32,
    pub radius: f32,
    pub energy: f32,
    pub age: f32,
    pub generation: u32,
    pub parent: Option<EntityId>,
    pub offspring: u32,
    pub meals: u32,
    /// False while queued for removal
    pub alive: bool,
    pub death: Option<DeathCause>,
    /// Controller layer widths
    pub signature: Vec<usize>,
    pub outputs: Vec<f32>,
    pub observation: Option<Vec<f32>>,
    /// Post-activation values per layer for the last observation
    pub activations: Option<Vec<Vec<f32>>>,
}

impl AgentRecord {
    pub fn capture(agent: &Agent, options: &SnapshotConfig) -> Self {
        let activations = if options.include_activations && !agent.observation.is_empty() {
            agent.brain.activations(&agent.observation).ok()
        } else {
            None
        };
        Self {
            id: agent.id,
            species: agent.species,
            position: agent.position,
            heading: agent.heading,
            speed: agent.speed,
            radius: agent.radius,
            energy: agent.energy,
            age: agent.age,
            generation: agent.generation,
            parent: agent.parent,
            offspring: agent.offspring,
            meals: agent.meals,
            alive: agent.is_alive(),
            death: agent.death,
            signature: agent.brain.signature().widths().to_vec(),
            outputs: agent.outputs.clone(),
            observation: options
                .include_observations
                .then(|| agent.observation.clone()),
            activations,
        }
    }
}

/// Consistent state of the world after one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Increases by one with every publication
    pub version: u64,
    pub step: u64,
    pub time: f64,
    pub config_version: u64,
    pub foods: Vec<FoodRecord>,
    pub bacteria: Vec<AgentRecord>,
    pub predators: Vec<AgentRecord>,
    pub metrics: PopulationMetrics,
}

impl WorldSnapshot {
    pub fn capture(store: &EntityStore, metrics: &PopulationMetrics, options: &SnapshotConfig) -> Self {
        let mut bacteria = Vec::new();
        let mut predators = Vec::new();
        for agent in store.agents() {
            let record = AgentRecord::capture(agent, options);
            match agent.species {
                Species::Bacteria => bacteria.push(record),
                Species::Predator => predators.push(record),
            }
        }
        Self {
            version: 0,
            step: metrics.steps,
            time: metrics.time,
            config_version: 0,
            foods: store.foods().map(FoodRecord::from).collect(),
            bacteria,
            predators,
            metrics: metrics.clone(),
        }
    }

    pub fn agents(&self, species: Species) -> &[AgentRecord] {
        match species {
            Species::Bacteria => &self.bacteria,
            Species::Predator => &self.predators,
        }
    }

    pub fn find(&self, id: EntityId) -> Option<&AgentRecord> {
        self.bacteria
            .iter()
            .chain(&self.predators)
            .find(|a| a.id == id)
    }
}

/// Single-writer, many-reader slot holding the latest snapshot.
///
/// Readers clone the inner `Arc` and keep a stable view while the engine
/// publishes newer versions.
#[derive(Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<WorldSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Arc<WorldSnapshot> {
        self.inner.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Stamp the next version onto `snapshot` and make it current
    pub(crate) fn publish(&self, mut snapshot: WorldSnapshot) -> u64 {
        let mut slot = self.inner.write();
        snapshot.version = slot.version + 1;
        let version = snapshot.version;
        *slot = Arc::new(snapshot);
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_bumps_version() {
        let handle = SnapshotHandle::new();
        assert_eq!(handle.version(), 0);
        let held = handle.latest();

        assert_eq!(handle.publish(WorldSnapshot::default()), 1);
        assert_eq!(handle.publish(WorldSnapshot::default()), 2);
        assert_eq!(handle.latest().version, 2);
        // earlier readers keep their view
        assert_eq!(held.version, 0);
    }

    #[test]
    fn test_capture_splits_species() {
        let mut store = EntityStore::new();
        store.add_food(Position::new(1.0, 1.0), 2.0, 3.0);
        let snapshot = WorldSnapshot::capture(
            &store,
            &PopulationMetrics::default(),
            &SnapshotConfig::default(),
        );
        assert_eq!(snapshot.foods.len(), 1);
        assert!(snapshot.bacteria.is_empty());
        assert!(snapshot.find(EntityId(1)).is_none());
    }

    #[test]
    fn test_handle_shared_across_threads() {
        let handle = SnapshotHandle::new();
        let reader = handle.clone();
        let t = std::thread::spawn(move || {
            let mut last = 0;
            for _ in 0..100 {
                let v = reader.version();
                assert!(v >= last);
                last = v;
            }
        });
        for _ in 0..100 {
            handle.publish(WorldSnapshot::default());
        }
        t.join().unwrap();
        assert_eq!(handle.version(), 100);
    }
}
