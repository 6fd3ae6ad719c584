//! The simulation engine: owns the world and advances it one step at a time.

use crate::actuator::{clamp_energy, drain, drive};
use crate::command::{self, Command, CommandQueue, CommandSender};
use crate::entity::{Agent, EntityStore};
use crate::food::{free_position, place_food, random_radius, FoodController};
use crate::prototype::Prototype;
use crate::sensor::{sense, Eye};
use crate::snapshot::{AgentRecord, SnapshotHandle, WorldSnapshot};
use crate::spatial::{IndexStats, SpatialIndex};
use crate::substrate::Substrate;
use crate::systems::{self, WorldMut};
use biosim_brain::{forward_batch, group_by_signature, NeuralNet, Signature};
use biosim_core::{
    DeathCause, EntityId, EntityKind, Error, KindFilter, PopulationMetrics, Position, Result,
    SimConfig, Species, SpeciesStats, ACTION_WIDTH,
};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Placement tries when seeding agents before accepting an overlap
const SEED_ATTEMPTS: usize = 300;

pub struct Engine {
    config: SimConfig,
    config_version: u64,
    /// Latest accepted config, shared with command senders for pre-validation
    shared_config: Arc<RwLock<SimConfig>>,
    substrate: Substrate,
    store: EntityStore,
    index: SpatialIndex,
    /// Force a full rebuild at the next index sync
    index_dirty: bool,
    food: FoodController,
    rng: ChaCha8Rng,
    queue: CommandQueue,
    sender: CommandSender,
    snapshots: SnapshotHandle,
    metrics: PopulationMetrics,
}

impl Engine {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let shared_config = Arc::new(RwLock::new(config.clone()));
        let (sender, queue) = command::channel(config.commands.queue_capacity, shared_config.clone());

        let mut engine = Self {
            substrate: Substrate::from_config(&config.world),
            index: SpatialIndex::new(config.performance.cell_size),
            index_dirty: true,
            store: EntityStore::new(),
            food: FoodController::new(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            queue,
            sender,
            snapshots: SnapshotHandle::new(),
            metrics: PopulationMetrics::new(),
            config_version: 0,
            shared_config,
            config,
        };
        engine.seed_population()?;
        engine.refresh_metrics();
        engine.publish();

        info!(
            seed = engine.config.seed,
            bacteria = engine.metrics.bacteria.count,
            predators = engine.metrics.predators.count,
            food = engine.metrics.food_count,
            "🌱 Engine initialised"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    pub fn metrics(&self) -> &PopulationMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Handle for enqueueing commands from other threads
    pub fn command_sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Enqueue a command; it is applied at the start of the next step
    pub fn send_command(&self, command: Command) -> Result<()> {
        self.sender.send(command)
    }

    /// Handle for reading published snapshots from other threads
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Arc<WorldSnapshot> {
        self.snapshots.latest()
    }

    /// Detailed record of one agent, including observation and activations
    pub fn agent(&self, id: EntityId) -> Option<AgentRecord> {
        let mut options = self.config.snapshot.clone();
        options.include_observations = true;
        options.include_activations = true;
        self.store.agent(id).map(|a| AgentRecord::capture(a, &options))
    }

    /// Live agent whose body contains `point`; the newest wins when several do
    pub fn agent_at(&self, point: Position) -> Option<EntityId> {
        self.store
            .agents()
            .filter(|a| a.is_alive() && a.position.distance(&point) <= a.radius)
            .map(|a| a.id)
            .max()
    }

    /// Advance the simulation by `dt` seconds.
    ///
    /// Pending commands are applied first, then every agent picks up the
    /// current species parameters, then `substeps` equal slices run the
    /// sense / think / act / systems pipeline.
    #[instrument(skip(self), fields(step = self.metrics.steps))]
    pub fn step(&mut self, dt: f32) -> Result<()> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(Error::invalid_parameter("dt", "must be finite and positive"));
        }
        self.drain_commands();
        self.refresh_parameters();

        let substeps = self.config.step.substeps.max(1);
        let sub_dt = dt / substeps as f32;
        let mut death_budget = self.config.step.max_deaths_per_step;
        for _ in 0..substeps {
            self.substep(sub_dt, &mut death_budget);
        }

        self.metrics.steps += 1;
        self.metrics.time += dt as f64;
        self.refresh_metrics();
        let interval = self.config.logging.metrics_interval;
        if interval > 0 && self.metrics.steps % interval == 0 {
            self.log_metrics();
        }
        self.publish();
        Ok(())
    }

    // --- commands and configuration -------------------------------------

    fn drain_commands(&mut self) {
        for command in self.queue.drain() {
            let name = command.name();
            match self.apply_command(command) {
                Ok(()) => {
                    self.metrics.applied_commands += 1;
                    debug!(command = name, "command applied");
                }
                Err(e) => {
                    self.metrics.rejected_commands += 1;
                    warn!(command = name, error = %e, "command rejected");
                }
            }
        }
    }

    fn apply_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::AddFood { position } => self.add_food(position).map(|_| ()),
            Command::AddBacteria {
                position,
                prototype,
            } => self
                .add_agent(Species::Bacteria, position, prototype.as_deref())
                .map(|_| ()),
            Command::AddPredator {
                position,
                prototype,
            } => self
                .add_agent(Species::Predator, position, prototype.as_deref())
                .map(|_| ()),
            Command::ResetPopulation => self.reset_population(),
            Command::SetParameter { path, value } => self.set_parameter(&path, value),
            Command::ReplaceConfig(config) => self.set_config(*config),
        }
    }

    /// Change one parameter by dotted path. Takes effect at the next step.
    pub fn set_parameter(&mut self, path: &str, value: serde_json::Value) -> Result<()> {
        let updated = self.config.with_parameter(path, value)?;
        self.apply_config(updated);
        debug!(path, version = self.config_version, "parameter updated");
        Ok(())
    }

    /// Replace the whole configuration. Takes effect at the next step.
    pub fn set_config(&mut self, config: SimConfig) -> Result<()> {
        config.validate()?;
        self.apply_config(config);
        info!(version = self.config_version, "configuration reloaded");
        Ok(())
    }

    fn apply_config(&mut self, config: SimConfig) {
        if config.performance != self.config.performance || config.world != self.config.world {
            self.index_dirty = true;
        }
        self.substrate = Substrate::from_config(&config.world);
        self.index.set_cell_size(config.performance.cell_size);
        *self.shared_config.write() = config.clone();
        self.config = config;
        self.config_version += 1;
    }

    /// Push the current species parameters into every agent. A sensor change
    /// that alters the observation width resizes the controller's input layer.
    fn refresh_parameters(&mut self) {
        let mut culled = Vec::new();
        for agent in self.store.agents_mut() {
            let species = self.config.species(agent.species);
            agent.energy_params = species.energy;
            agent.energy = clamp_energy(agent.energy, &agent.energy_params);
            if agent.sensor == species.sensor {
                continue;
            }
            agent.sensor = species.sensor;
            agent.observation.clear();
            agent.sensor_countdown = 0;
            let width = agent.sensor.output_width();
            if agent.brain.input_width() != width {
                if let Err(e) = agent.brain.resize_input(width, &mut self.rng) {
                    warn!(agent = %agent.id, error = %e, "controller resize failed, culling agent");
                    agent.mark_dead(DeathCause::Culled);
                    culled.push(agent.id);
                }
            }
        }
        for id in culled {
            self.index.remove(id);
        }
    }

    // --- population management ------------------------------------------

    /// Add a food item at `position` (clamped into the substrate)
    pub fn add_food(&mut self, position: Position) -> Result<EntityId> {
        if !position.is_finite() {
            return Err(Error::invalid_parameter("position", "must be finite"));
        }
        let food = &self.config.food;
        let radius = random_radius(food.min_radius, food.max_radius, &mut self.rng);
        let mut velocity = Position::ORIGIN;
        let position = self.substrate.clamp(position, radius, &mut velocity);
        let id = self.store.add_food(position, radius, food.value);
        if self.config.performance.use_spatial_index {
            self.index.insert(id, EntityKind::Food, position, radius);
        }
        Ok(id)
    }

    /// Add an agent. Without a prototype a fresh random controller is built
    /// from the species configuration; with one, its controller, energy and
    /// radius are used after validation.
    pub fn add_agent(
        &mut self,
        species: Species,
        position: Position,
        prototype: Option<&Prototype>,
    ) -> Result<EntityId> {
        if !position.is_finite() {
            return Err(Error::invalid_parameter("position", "must be finite"));
        }
        let species_config = self.config.species(species);
        if !species_config.enabled {
            return Err(Error::InvalidState(format!("{} are disabled", species)));
        }
        if self.store.live_count(species) >= species_config.max_count {
            return Err(Error::InvalidState(format!(
                "{} population is at its cap of {}",
                species, species_config.max_count
            )));
        }
        self.spawn_agent(species, Some(position), prototype)
    }

    /// Remove everything and reseed from the current configuration
    pub fn reset_population(&mut self) -> Result<()> {
        self.seed_population()?;
        info!(
            bacteria = self.store.live_count(Species::Bacteria),
            predators = self.store.live_count(Species::Predator),
            food = self.store.food_count(),
            "🔄 Population reset"
        );
        Ok(())
    }

    fn seed_population(&mut self) -> Result<()> {
        self.store.clear_agents();
        self.store.clear_food();
        self.index.clear();
        self.index_dirty = true;
        self.food.reset();

        for _ in 0..self.config.food.target {
            place_food(&mut self.store, &self.config.food, &self.substrate, &mut self.rng);
        }
        for species in Species::all() {
            let species_config = self.config.species(species);
            if !species_config.enabled {
                continue;
            }
            for _ in 0..species_config.initial_count {
                self.spawn_agent(species, None, None)?;
            }
        }
        self.sync_index();
        Ok(())
    }

    fn spawn_agent(
        &mut self,
        species: Species,
        position: Option<Position>,
        prototype: Option<&Prototype>,
    ) -> Result<EntityId> {
        let species_config = self.config.species(species).clone();
        let width = species_config.sensor.output_width();

        let (mut brain, radius, energy, heading) = match prototype {
            Some(proto) => {
                if proto.species != species {
                    return Err(Error::invalid_parameter(
                        "prototype.species",
                        format!("expected {}, got {}", species, proto.species),
                    ));
                }
                let heading = match proto.heading {
                    Some(h) => h,
                    None => self.random_heading(),
                };
                (proto.controller()?, proto.radius, proto.energy, heading)
            }
            None => {
                let signature = Signature::new(species_config.layer_widths())?;
                let brain = NeuralNet::random(signature, species_config.brain.init_std, &mut self.rng);
                let radius = random_radius(
                    species_config.min_radius,
                    species_config.max_radius,
                    &mut self.rng,
                );
                let heading = self.random_heading();
                (brain, radius, species_config.energy.initial_energy, heading)
            }
        };
        if brain.input_width() != width {
            brain.resize_input(width, &mut self.rng)?;
        }

        let position = match position {
            Some(p) => {
                let mut velocity = Position::ORIGIN;
                self.substrate.clamp(p, radius, &mut velocity)
            }
            None => free_position(
                &self.store,
                &self.substrate,
                radius,
                0.0,
                KindFilter::ALL,
                SEED_ATTEMPTS,
                &mut self.rng,
            )
            .unwrap_or_else(|| self.substrate.random_point(radius, &mut self.rng)),
        };

        let id = self.store.allocate_id();
        let agent = Agent::new(
            id,
            species,
            position,
            heading,
            radius,
            clamp_energy(energy, &species_config.energy),
            brain,
            species_config.sensor,
            species_config.energy,
        );
        self.store.insert_agent(agent);
        if self.config.performance.use_spatial_index {
            self.index.insert(id, species.kind(), position, radius);
        }
        trace!(agent = %id, %species, "agent spawned");
        Ok(id)
    }

    fn random_heading(&mut self) -> f32 {
        self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI)
    }

    // --- the sub-step pipeline --------------------------------------------

    fn substep(&mut self, dt: f32, death_budget: &mut usize) {
        self.sync_index();
        self.replenish_food(dt);
        self.sense_all();
        self.think_all();
        self.act_all(dt);
        self.sync_index();

        let use_index = self.config.performance.use_spatial_index;
        let mut world = WorldMut {
            store: &mut self.store,
            index: &mut self.index,
            use_index,
        };

        let report = systems::interaction(&mut world, &self.config);
        self.metrics.food_eaten += report.food_eaten as u64;

        for species in Species::all() {
            let born = systems::reproduction(&mut world, &self.config, species, &self.substrate, &mut self.rng);
            if !born.is_empty() {
                debug!(%species, count = born.len(), "agents born");
            }
            self.metrics.births += born.len() as u64;
        }

        systems::mark_deaths(&mut world, &self.config);
        let purged = systems::purge_dead(&mut world, *death_budget);
        *death_budget -= purged.len();
        for (id, species, cause) in purged {
            self.metrics.deaths.record(cause);
            debug!(agent = %id, %species, ?cause, "agent removed");
        }

        systems::collisions(&mut world, &self.substrate);
    }

    /// Bring the index in line with current positions: incremental moves when
    /// reuse is enabled, a full rebuild otherwise.
    fn sync_index(&mut self) {
        let perf = &self.config.performance;
        if !perf.use_spatial_index {
            if !self.index.is_empty() {
                self.index.clear();
            }
            self.index_dirty = true;
            return;
        }
        if perf.reuse_spatial_index && !self.index_dirty {
            for agent in self.store.agents().filter(|a| a.is_alive()) {
                if !self.index.move_to(agent.id, agent.position) {
                    self.index.insert(agent.id, agent.kind(), agent.position, agent.radius);
                }
            }
            return;
        }
        let foods = self
            .store
            .foods()
            .map(|f| (f.id, EntityKind::Food, f.position, f.radius));
        let agents = self
            .store
            .agents()
            .filter(|a| a.is_alive())
            .map(|a| (a.id, a.kind(), a.position, a.radius));
        self.index.rebuild(foods.chain(agents));
        self.index_dirty = false;
    }

    fn replenish_food(&mut self, dt: f32) {
        if !self.config.food.replenish {
            return;
        }
        let spawned = self.food.update(
            &mut self.store,
            &self.config.food,
            &self.substrate,
            dt,
            &mut self.rng,
        );
        self.metrics.food_spawned += spawned.len() as u64;
        if self.config.performance.use_spatial_index {
            for id in spawned {
                if let Some(f) = self.store.food(id) {
                    self.index.insert(id, EntityKind::Food, f.position, f.radius);
                }
            }
        }
    }

    fn sense_all(&mut self) {
        let use_index = self.config.performance.use_spatial_index;
        let skipping = self.config.performance.sensor_frame_skip;

        let readings: Vec<(EntityId, Option<Vec<f32>>)> = self
            .store
            .agents()
            .filter(|a| a.is_alive())
            .map(|agent| {
                let fresh = agent.observation.len() == agent.sensor.output_width();
                let skip = skipping && agent.sensor.frame_skip > 0;
                if skip && fresh && agent.sensor_countdown > 0 {
                    return (agent.id, None);
                }
                let eye = Eye {
                    owner: agent.id,
                    position: agent.position,
                    heading: agent.heading,
                    body_radius: agent.radius,
                };
                let observation = if use_index {
                    sense(&self.index, &eye, &agent.sensor)
                } else {
                    sense(&self.store, &eye, &agent.sensor)
                };
                (agent.id, Some(observation))
            })
            .collect();

        for (id, observation) in readings {
            let Some(agent) = self.store.agent_mut(id) else {
                continue;
            };
            match observation {
                Some(observation) => {
                    agent.observation = observation;
                    agent.sensor_countdown = if skipping { agent.sensor.frame_skip } else { 0 };
                }
                None => agent.sensor_countdown -= 1,
            }
        }
    }

    /// Run every live controller, grouped by signature when batching is on
    fn think_all(&mut self) {
        let live: Vec<&Agent> = self.store.agents().filter(|a| a.is_alive()).collect();
        let mut results: Vec<(EntityId, Result<Vec<f32>>)> = Vec::with_capacity(live.len());

        if self.config.performance.batched_inference {
            let groups = group_by_signature(live.iter().map(|&a| (a, &a.brain)));
            for (signature, members) in groups {
                let (ready, mismatched): (Vec<&Agent>, Vec<&Agent>) = members
                    .into_iter()
                    .partition(|a| a.observation.len() == signature.input_width());
                for agent in mismatched {
                    results.push((agent.id, agent.brain.forward(&agent.observation)));
                }
                let nets: Vec<&NeuralNet> = ready.iter().map(|a| &a.brain).collect();
                let inputs: Vec<&[f32]> = ready.iter().map(|a| a.observation.as_slice()).collect();
                match forward_batch(&nets, &inputs) {
                    Ok(rows) => {
                        results.extend(ready.iter().map(|a| a.id).zip(rows.into_iter().map(Ok)));
                    }
                    Err(e) => {
                        warn!(%signature, error = %e, "batched inference failed, evaluating singly");
                        results.extend(
                            ready
                                .iter()
                                .map(|a| (a.id, a.brain.forward(&a.observation))),
                        );
                    }
                }
            }
        } else {
            results.extend(live.iter().map(|a| (a.id, a.brain.forward(&a.observation))));
        }

        for (id, outcome) in results {
            let Some(agent) = self.store.agent_mut(id) else {
                continue;
            };
            match outcome {
                Ok(outputs) if outputs.len() == ACTION_WIDTH && outputs.iter().all(|o| o.is_finite()) => {
                    agent.outputs = outputs;
                }
                Ok(outputs) => {
                    warn!(agent = %id, ?outputs, "controller produced unusable output, culling agent");
                    agent.mark_dead(DeathCause::Culled);
                    self.index.remove(id);
                }
                Err(e) => {
                    warn!(agent = %id, error = %e, "controller failed, culling agent");
                    agent.mark_dead(DeathCause::Culled);
                    self.index.remove(id);
                }
            }
        }
    }

    fn act_all(&mut self, dt: f32) {
        for agent in self.store.agents_mut().filter(|a| a.is_alive()) {
            let species = self.config.species(agent.species);
            let motion = drive(&agent.outputs, agent.heading, &species.locomotion, dt);
            agent.heading = motion.heading;
            agent.speed = motion.speed;
            let mut velocity = motion.velocity;
            let moved = agent.position.add(velocity.scale(dt));
            agent.position = self.substrate.clamp(moved, agent.radius, &mut velocity);
            agent.velocity = velocity;
            agent.energy = drain(agent.energy, motion.speed, &agent.energy_params, dt);
            agent.age += dt;
        }
    }

    // --- metrics and publication -------------------------------------------

    fn refresh_metrics(&mut self) {
        for species in Species::all() {
            let live: Vec<&Agent> = self
                .store
                .agents()
                .filter(|a| a.species == species && a.is_alive())
                .collect();
            let architectures: BTreeSet<&Signature> = live.iter().map(|a| a.brain.signature()).collect();
            *self.metrics.species_mut(species) = SpeciesStats::from_samples(
                live.iter().map(|a| (a.energy, a.age, a.generation)),
                architectures.len(),
            );
        }
        self.metrics.food_count = self.store.food_count();
        self.metrics.pending_deaths = self.store.agents().filter(|a| !a.is_alive()).count();
    }

    fn log_metrics(&self) {
        let m = &self.metrics;
        info!(
            event = "population_metrics",
            step = m.steps,
            time = m.time,
            agents = m.living_agents(),
            bacteria = m.bacteria.count,
            predators = m.predators.count,
            food = m.food_count,
            bacteria_mean_energy = m.bacteria.mean_energy,
            predator_mean_energy = m.predators.mean_energy,
            max_generation = m.bacteria.max_generation.max(m.predators.max_generation),
            architectures = m.bacteria.architectures + m.predators.architectures,
            births = m.births,
            deaths = m.deaths.total(),
            pending_deaths = m.pending_deaths,
            food_eaten = m.food_eaten,
            rejected_commands = m.rejected_commands,
            "📊 Population metrics"
        );
    }

    fn publish(&self) {
        let mut snapshot = WorldSnapshot::capture(&self.store, &self.metrics, &self.config.snapshot);
        snapshot.config_version = self.config_version;
        self.snapshots.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn empty_config() -> SimConfig {
        let mut config = SimConfig::default();
        config.seed = 7;
        config.bacteria.initial_count = 0;
        config.bacteria.min_count = 0;
        config.predator.initial_count = 0;
        config.food.target = 0;
        config.food.replenish = false;
        config.bacteria.locomotion.max_speed = 0.0;
        config
    }

    fn prototype(engine: &Engine, species: Species, energy: f32, radius: f32) -> Prototype {
        let config = engine.config().species(species);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let brain = NeuralNet::random(Signature::new(config.layer_widths()).unwrap(), 1.0, &mut rng);
        Prototype::new(species, &brain, config.sensor, energy, radius).unwrap()
    }

    #[test]
    fn test_overlapping_food_is_eaten() {
        let mut config = empty_config();
        config.bacteria.energy.death_energy = 0.0;
        config.food.min_radius = 5.0;
        config.food.max_radius = 5.0;
        config.food.value = 5.0;
        let mut engine = Engine::new(config).unwrap();

        // food at (0, 0) and a bacterium at (0.1, 0), shifted by (100, 100)
        // so neither touches a wall
        let offset = Position::new(100.0, 100.0);
        let food = engine.add_food(offset).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 10.0, 5.0);
        let id = engine
            .add_agent(Species::Bacteria, offset.add(Position::new(0.1, 0.0)), Some(&proto))
            .unwrap();
        assert_eq!(engine.store().food(food).unwrap().position, offset);
        assert_eq!(engine.store().agent(id).unwrap().position, offset.add(Position::new(0.1, 0.0)));

        engine.step(0.1).unwrap();

        let v0 = engine.config().bacteria.energy.v0_cost;
        let agent = engine.store().agent(id).unwrap();
        assert_eq!(engine.store().food_count(), 0);
        assert!(engine.snapshot().foods.is_empty());
        assert!((agent.energy - (10.0 + 5.0 - v0 * 0.1)).abs() < 1e-4, "{}", agent.energy);
        assert_eq!(engine.metrics().food_eaten, 1);
    }

    #[test]
    fn test_split_energy_reproduces() {
        let mut config = empty_config();
        config.bacteria.energy.v0_cost = 0.0;
        config.bacteria.energy.vmax_cost = 0.0;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 200.0, 6.0);
        engine
            .add_agent(Species::Bacteria, Position::new(500.0, 350.0), Some(&proto))
            .unwrap();

        engine.step(0.1).unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.bacteria.len(), 2);
        for record in &snapshot.bacteria {
            assert!((record.energy - 100.0).abs() < 1e-4);
        }
        assert_eq!(engine.metrics().births, 1);
    }

    #[test]
    fn test_exactly_split_energy_reproduces() {
        let mut config = empty_config();
        config.bacteria.energy.v0_cost = 0.0;
        config.bacteria.energy.vmax_cost = 0.0;
        let split = config.bacteria.energy.split_energy;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, split, 6.0);
        let parent = engine
            .add_agent(Species::Bacteria, Position::new(500.0, 350.0), Some(&proto))
            .unwrap();

        engine.step(0.1).unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.bacteria.len(), 2);
        let child = snapshot.bacteria.iter().find(|r| r.id != parent).unwrap();
        assert_eq!(child.parent, Some(parent));
        assert_eq!(child.energy, split / 2.0);
        assert_eq!(snapshot.find(parent).unwrap().energy, split / 2.0);
    }

    #[test]
    fn test_population_floor_survives_starvation() {
        let mut config = empty_config();
        config.step.max_deaths_per_step = 100;
        config.bacteria.min_count = 10;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 0.0, 5.0);
        for i in 0..12 {
            let position = Position::new(40.0 + 60.0 * (i % 6) as f32, 100.0 + 60.0 * (i / 6) as f32);
            engine.add_agent(Species::Bacteria, position, Some(&proto)).unwrap();
        }

        engine.step(0.1).unwrap();
        engine.step(0.1).unwrap();

        assert_eq!(engine.store().live_count(Species::Bacteria), 10);
        assert_eq!(engine.store().agent_count(), 10);
        assert_eq!(engine.metrics().deaths.starvation, 2);
        let death_energy = engine.config().bacteria.energy.death_energy;
        for agent in engine.store().agents() {
            assert!(agent.energy >= death_energy - 1e-3);
        }
    }

    #[test]
    fn test_below_death_energy_is_removed() {
        let mut engine = Engine::new(empty_config()).unwrap();
        let death = engine.config().bacteria.energy.death_energy;
        let proto = prototype(&engine, Species::Bacteria, death - 0.001, 6.0);
        engine
            .add_agent(Species::Bacteria, Position::new(300.0, 300.0), Some(&proto))
            .unwrap();

        engine.step(0.1).unwrap();

        assert_eq!(engine.store().agent_count(), 0);
        assert_eq!(engine.metrics().deaths.starvation, 1);
    }

    #[test]
    fn test_death_quota_spreads_removals() {
        let mut config = empty_config();
        config.step.max_deaths_per_step = 2;
        config.step.substeps = 3;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 10.0, 5.0);
        for i in 0..5 {
            engine
                .add_agent(Species::Bacteria, Position::new(50.0 + 40.0 * i as f32, 100.0), Some(&proto))
                .unwrap();
        }

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let before = engine.store().agent_count();
            engine.step(0.1).unwrap();
            let after = engine.store().agent_count();
            assert!(before - after <= 2);
            remaining.push(after);
        }
        assert_eq!(remaining, vec![3, 1, 0]);
    }

    #[test]
    fn test_queued_deaths_are_inert_and_visible() {
        let mut config = empty_config();
        config.step.max_deaths_per_step = 1;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 10.0, 5.0);
        for i in 0..3 {
            engine
                .add_agent(Species::Bacteria, Position::new(50.0 + 40.0 * i as f32, 100.0), Some(&proto))
                .unwrap();
        }
        engine.step(0.1).unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.bacteria.len(), 2);
        assert!(snapshot.bacteria.iter().all(|r| !r.alive));
        assert_eq!(snapshot.metrics.pending_deaths, 2);
        assert_eq!(snapshot.metrics.bacteria.count, 0);

        // inert agents neither move nor age
        let ages: Vec<f32> = snapshot.bacteria.iter().map(|r| r.age).collect();
        engine.step(0.1).unwrap();
        let later = engine.snapshot();
        assert_eq!(later.bacteria.len(), 1);
        assert_eq!(later.bacteria[0].age, ages[1]);
    }

    #[test]
    fn test_commands_applied_at_next_step() {
        let mut engine = Engine::new(empty_config()).unwrap();
        let sender = engine.command_sender();
        sender.add_food(Position::new(100.0, 100.0)).unwrap();
        sender.set_parameter("food.value", json!(9.0)).unwrap();
        // predators are disabled by default: rejected when drained
        sender.add_predator(Position::new(10.0, 10.0), None).unwrap();
        assert!(sender.set_parameter("food.value", json!(-1.0)).is_err());

        assert_eq!(engine.store().food_count(), 0);
        engine.step(0.1).unwrap();

        assert_eq!(engine.store().food_count(), 1);
        assert_eq!(engine.config().food.value, 9.0);
        assert_eq!(engine.metrics().applied_commands, 2);
        assert_eq!(engine.metrics().rejected_commands, 1);
        assert_eq!(engine.config_version(), 1);
        assert_eq!(engine.snapshot().config_version, 1);
    }

    #[test]
    fn test_sensor_change_resizes_controllers() {
        let mut config = empty_config();
        config.bacteria.initial_count = 4;
        let mut engine = Engine::new(config).unwrap();
        engine
            .command_sender()
            .set_parameter("bacteria.sensor.ray_count", json!(5))
            .unwrap();
        engine.step(0.1).unwrap();

        for agent in engine.store().agents() {
            assert_eq!(agent.brain.input_width(), 10);
            assert_eq!(agent.observation.len(), 10);
            assert!(agent.is_alive());
        }
    }

    #[test]
    fn test_energy_parameters_refresh_live() {
        let mut config = empty_config();
        config.bacteria.initial_count = 3;
        let mut engine = Engine::new(config).unwrap();
        engine.set_parameter("bacteria.energy.v0_cost", json!(2.0)).unwrap();
        engine.step(0.1).unwrap();
        for agent in engine.store().agents() {
            assert_eq!(agent.energy_params.v0_cost, 2.0);
        }
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let mut engine = Engine::new(empty_config()).unwrap();
        assert!(engine.step(0.0).is_err());
        assert!(engine.step(f32::NAN).is_err());
        assert!(engine.set_parameter("step.substeps", json!(0)).is_err());
        assert_eq!(engine.config().step.substeps, 1);
        assert!(engine.add_food(Position::new(f32::INFINITY, 0.0)).is_err());

        let proto = prototype(&engine, Species::Bacteria, 10.0, 5.0);
        assert!(engine
            .add_agent(Species::Predator, Position::new(10.0, 10.0), Some(&proto))
            .is_err());
    }

    #[test]
    fn test_prototype_species_must_match() {
        let mut config = empty_config();
        config.predator.enabled = true;
        let mut engine = Engine::new(config).unwrap();
        let proto = prototype(&engine, Species::Bacteria, 10.0, 5.0);
        let err = engine
            .add_agent(Species::Predator, Position::new(10.0, 10.0), Some(&proto))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_energy_stays_bounded() {
        let mut config = SimConfig::default();
        config.seed = 3;
        config.bacteria.initial_count = 25;
        config.predator.enabled = true;
        config.predator.initial_count = 4;
        config.food.target = 30;
        config.step.substeps = 2;
        let mut engine = Engine::new(config).unwrap();

        for _ in 0..40 {
            engine.step(1.0 / 30.0).unwrap();
            for agent in engine.store().agents() {
                let cap = agent.energy_params.energy_cap;
                assert!(agent.energy >= 0.0 && agent.energy <= cap, "{}", agent.energy);
                assert!(agent.position.is_finite());
                assert!(engine.substrate().contains(agent.position, agent.radius - 1e-2));
            }
        }
    }

    #[test]
    fn test_same_seed_same_history() {
        let mut config = SimConfig::default();
        config.bacteria.initial_count = 15;
        config.food.target = 20;
        config.seed = 42;
        let mut a = Engine::new(config.clone()).unwrap();
        let mut b = Engine::new(config).unwrap();
        for _ in 0..15 {
            a.step(1.0 / 60.0).unwrap();
            b.step(1.0 / 60.0).unwrap();
        }
        assert_eq!(*a.snapshot(), *b.snapshot());
    }

    #[test]
    fn test_engine_batch_uses_per_agent_weights() {
        let mut config = SimConfig::default();
        config.bacteria.initial_count = 12;
        config.food.target = 20;
        let mut engine = Engine::new(config).unwrap();
        engine.step(1.0 / 60.0).unwrap();

        let mut distinct = BTreeSet::new();
        for agent in engine.store().agents().filter(|a| a.is_alive()) {
            let single = agent.brain.forward(&agent.observation).unwrap();
            for (x, y) in single.iter().zip(&agent.outputs) {
                assert!((x - y).abs() < 1e-4);
            }
            distinct.insert(agent.outputs.iter().map(|o| o.to_bits()).collect::<Vec<_>>());
        }
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_index_and_scan_see_the_same() {
        let mut config = SimConfig::default();
        config.bacteria.initial_count = 20;
        config.bacteria.sensor.see_bacteria = true;
        config.food.target = 40;
        config.snapshot.include_observations = true;
        let mut with_index = Engine::new(config.clone()).unwrap();
        config.performance.use_spatial_index = false;
        let mut scanning = Engine::new(config).unwrap();

        with_index.step(1.0 / 60.0).unwrap();
        scanning.step(1.0 / 60.0).unwrap();
        let (a, b) = (with_index.snapshot(), scanning.snapshot());
        assert_eq!(a.bacteria.len(), b.bacteria.len());
        for (x, y) in a.bacteria.iter().zip(&b.bacteria) {
            assert_eq!(x.observation, y.observation);
        }
    }

    #[test]
    fn test_frame_skip_reuses_observation() {
        let mut config = empty_config();
        config.bacteria.initial_count = 1;
        config.bacteria.sensor.frame_skip = 2;
        let mut engine = Engine::new(config).unwrap();

        let countdowns: Vec<u32> = (0..4)
            .map(|_| {
                engine.step(0.1).unwrap();
                engine.store().agents().next().unwrap().sensor_countdown
            })
            .collect();
        assert_eq!(countdowns, vec![2, 1, 0, 2]);
    }

    #[test]
    fn test_reset_population_reseeds() {
        let mut config = empty_config();
        config.bacteria.initial_count = 5;
        config.food.target = 7;
        let mut engine = Engine::new(config).unwrap();
        engine.add_food(Position::new(30.0, 30.0)).unwrap();
        engine.send_command(Command::ResetPopulation).unwrap();
        engine.step(0.01).unwrap();
        assert_eq!(engine.store().food_count(), 7);
        assert_eq!(engine.store().agent_count(), 5);
        assert_eq!(engine.metrics().living_agents(), 5);
    }

    #[test]
    fn test_snapshot_versions_and_agent_lookup() {
        let mut config = empty_config();
        config.snapshot.include_activations = true;
        let mut engine = Engine::new(config).unwrap();
        let handle = engine.snapshot_handle();
        let v0 = handle.version();
        let proto = prototype(&engine, Species::Bacteria, 100.0, 8.0);
        let id = engine
            .add_agent(Species::Bacteria, Position::new(200.0, 200.0), Some(&proto))
            .unwrap();
        engine.step(0.1).unwrap();
        assert_eq!(handle.version(), v0 + 1);

        let record = engine.agent(id).unwrap();
        let layers = record.activations.unwrap();
        assert_eq!(layers.len(), record.signature.len() - 1);
        for (x, y) in layers.last().unwrap().iter().zip(&record.outputs) {
            assert!((x - y).abs() < 1e-4);
        }
        assert_eq!(engine.agent_at(Position::new(203.0, 200.0)), Some(id));
        assert_eq!(engine.agent_at(Position::new(260.0, 200.0)), None);

        let snap = handle.latest();
        assert!(snap.find(id).unwrap().activations.is_some());
        assert!(snap.find(id).unwrap().observation.is_none());
    }

    #[test]
    fn test_prototype_capture_roundtrip_spawns_clone() {
        let mut config = empty_config();
        config.bacteria.initial_count = 1;
        let mut engine = Engine::new(config).unwrap();
        let original = engine.store().agents().next().unwrap();
        let bytes = Prototype::capture(original).to_bytes().unwrap();
        let original_params = original.brain.params().to_vec();

        let proto = Prototype::from_bytes(&bytes).unwrap();
        let id = engine
            .add_agent(Species::Bacteria, Position::new(400.0, 400.0), Some(&proto))
            .unwrap();
        assert_eq!(engine.store().agent(id).unwrap().brain.params(), original_params.as_slice());
    }
}
