//! Food, agents and the store that owns them.

use crate::spatial::{Neighbour, NeighbourQuery};
use biosim_brain::NeuralNet;
use biosim_core::{
    DeathCause, EnergyConfig, EntityId, EntityKind, KindFilter, Position, SensorConfig, Species,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A passive food particle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Food {
    pub id: EntityId,
    pub position: Position,
    pub radius: f32,
    /// Energy granted when eaten
    pub value: f32,
}

/// A bacterium or predator
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: EntityId,
    pub species: Species,
    pub position: Position,
    /// Radians
    pub heading: f32,
    pub velocity: Position,
    pub speed: f32,
    pub radius: f32,
    pub energy: f32,
    /// Simulated seconds since birth
    pub age: f32,
    pub generation: u32,
    pub parent: Option<EntityId>,
    pub brain: NeuralNet,
    /// Sensor settings this agent currently senses with
    pub sensor: SensorConfig,
    /// Energy parameters refreshed from the species config every step
    pub energy_params: EnergyConfig,
    /// Last observation vector fed to the controller
    pub observation: Vec<f32>,
    /// Last controller outputs
    pub outputs: Vec<f32>,
    /// Sensing passes left before the observation is refreshed
    pub sensor_countdown: u32,
    /// Overlapping predator contacts received so far
    pub hits_taken: u32,
    pub offspring: u32,
    pub meals: u32,
    /// Set once the agent is queued for removal; such agents are inert
    pub death: Option<DeathCause>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: EntityId,
        species: Species,
        position: Position,
        heading: f32,
        radius: f32,
        energy: f32,
        brain: NeuralNet,
        sensor: SensorConfig,
        energy_params: EnergyConfig,
    ) -> Self {
        Self {
            id,
            species,
            position,
            heading,
            velocity: Position::ORIGIN,
            speed: 0.0,
            radius,
            energy,
            age: 0.0,
            generation: 0,
            parent: None,
            brain,
            sensor,
            energy_params,
            observation: Vec::new(),
            outputs: Vec::new(),
            sensor_countdown: 0,
            hits_taken: 0,
            offspring: 0,
            meals: 0,
            death: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.species.kind()
    }

    pub fn is_alive(&self) -> bool {
        self.death.is_none()
    }

    /// Queue this agent for removal. The first cause recorded wins.
    pub fn mark_dead(&mut self, cause: DeathCause) {
        if self.death.is_none() {
            self.death = Some(cause);
            self.velocity = Position::ORIGIN;
            self.speed = 0.0;
        }
    }

    /// Collision mass
    pub fn mass(&self) -> f32 {
        self.radius * self.radius
    }
}

/// Owner of every entity. Ids come from one monotonically increasing counter
/// shared by food and agents and are never reused.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    next_id: u64,
    foods: BTreeMap<EntityId, Food>,
    agents: BTreeMap<EntityId, Agent>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }

    pub fn add_food(&mut self, position: Position, radius: f32, value: f32) -> EntityId {
        let id = self.allocate_id();
        self.foods.insert(
            id,
            Food {
                id,
                position,
                radius,
                value,
            },
        );
        id
    }

    /// Insert an agent whose id came from [`EntityStore::allocate_id`]
    pub fn insert_agent(&mut self, agent: Agent) {
        self.agents.insert(agent.id, agent);
    }

    pub fn remove_food(&mut self, id: EntityId) -> Option<Food> {
        self.foods.remove(&id)
    }

    pub fn remove_agent(&mut self, id: EntityId) -> Option<Agent> {
        self.agents.remove(&id)
    }

    pub fn food(&self, id: EntityId) -> Option<&Food> {
        self.foods.get(&id)
    }

    pub fn agent(&self, id: EntityId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn agent_mut(&mut self, id: EntityId) -> Option<&mut Agent> {
        self.agents.get_mut(&id)
    }

    pub fn foods(&self) -> impl Iterator<Item = &Food> {
        self.foods.values()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn agents_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.values_mut()
    }

    /// Ids of agents that are not queued for removal, in id order
    pub fn live_ids(&self) -> Vec<EntityId> {
        self.agents
            .values()
            .filter(|a| a.is_alive())
            .map(|a| a.id)
            .collect()
    }

    pub fn food_count(&self) -> usize {
        self.foods.len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn live_count(&self, species: Species) -> usize {
        self.agents
            .values()
            .filter(|a| a.species == species && a.is_alive())
            .count()
    }

    pub fn clear_agents(&mut self) {
        self.agents.clear();
    }

    pub fn clear_food(&mut self) {
        self.foods.clear();
    }
}

impl NeighbourQuery for EntityStore {
    fn overlapping(&self, center: Position, radius: f32, filter: KindFilter) -> Vec<Neighbour> {
        if !center.is_finite() || !radius.is_finite() {
            return Vec::new();
        }
        let mut hits = Vec::new();
        if filter.food {
            hits.extend(
                self.foods
                    .values()
                    .filter(|f| f.position.distance(&center) <= radius + f.radius)
                    .map(|f| Neighbour {
                        id: f.id,
                        kind: EntityKind::Food,
                        position: f.position,
                        radius: f.radius,
                    }),
            );
        }
        hits.extend(
            self.agents
                .values()
                .filter(|a| a.is_alive() && filter.matches(a.kind()))
                .filter(|a| a.position.distance(&center) <= radius + a.radius)
                .map(|a| Neighbour {
                    id: a.id,
                    kind: a.kind(),
                    position: a.position,
                    radius: a.radius,
                }),
        );
        hits.sort_by_key(|n| n.id);
        hits
    }
}
