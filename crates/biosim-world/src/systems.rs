//! Per-sub-step systems that change the population: interaction,
//! reproduction, death and collision. The engine runs them in that order.

use crate::actuator::{gain, prepare_reproduction};
use crate::entity::{Agent, EntityStore};
use crate::spatial::{Neighbour, NeighbourQuery, SpatialIndex};
use crate::substrate::Substrate;
use biosim_brain::Mutator;
use biosim_core::{
    DeathCause, EntityId, KindFilter, Position, Result, SimConfig, Species,
};
use rand::Rng;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Mutable world state the systems operate on
pub struct WorldMut<'a> {
    pub store: &'a mut EntityStore,
    pub index: &'a mut SpatialIndex,
    /// Query the index (true) or scan the store (false)
    pub use_index: bool,
}

impl WorldMut<'_> {
    pub fn neighbours(&self, center: Position, radius: f32, filter: KindFilter) -> Vec<Neighbour> {
        if self.use_index {
            self.index.overlapping(center, radius, filter)
        } else {
            self.store.overlapping(center, radius, filter)
        }
    }

    /// Take an agent out of queries without purging it
    pub fn hide(&mut self, id: EntityId) {
        self.index.remove(id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteractionReport {
    pub food_eaten: usize,
    pub hits: usize,
    pub kills: usize,
}

/// Eating. Each bacterium eats at most one overlapping food item (the
/// nearest), each predator strikes at most one overlapping bacterium.
pub fn interaction(world: &mut WorldMut<'_>, config: &SimConfig) -> InteractionReport {
    let mut report = InteractionReport::default();

    for id in world.store.live_ids() {
        let species = match world.store.agent(id) {
            Some(agent) if agent.is_alive() => agent.species,
            _ => continue,
        };
        match species {
            Species::Bacteria => {
                if eat_food(world, id) {
                    report.food_eaten += 1;
                }
            }
            Species::Predator => {
                if world.store.live_count(Species::Bacteria) <= config.bacteria.min_count {
                    continue;
                }
                if let Some(killed) = strike(world, id, config) {
                    report.hits += 1;
                    if killed {
                        report.kills += 1;
                    }
                }
            }
        }
    }
    report
}

fn eat_food(world: &mut WorldMut<'_>, id: EntityId) -> bool {
    let Some(agent) = world.store.agent(id) else {
        return false;
    };
    let (position, radius) = (agent.position, agent.radius);
    let target = nearest_overlapping(
        position,
        radius,
        world
            .neighbours(position, radius, KindFilter::FOOD)
            .into_iter()
            .filter_map(|n| world.store.food(n.id).map(|f| (f.id, f.position, f.radius))),
    );
    let Some(food_id) = target else {
        return false;
    };
    let Some(food) = world.store.remove_food(food_id) else {
        return false;
    };
    world.index.remove(food_id);
    if let Some(agent) = world.store.agent_mut(id) {
        agent.energy = gain(agent.energy, food.value, &agent.energy_params);
        agent.meals += 1;
        trace!(agent = %id, food = %food_id, energy = agent.energy, "food eaten");
    }
    true
}

/// Returns `Some(killed)` when the predator hit something
fn strike(world: &mut WorldMut<'_>, id: EntityId, config: &SimConfig) -> Option<bool> {
    let predator = world.store.agent(id)?;
    let (position, radius) = (predator.position, predator.radius);
    let prey_id = nearest_overlapping(
        position,
        radius,
        world
            .neighbours(position, radius, KindFilter::only(Species::Bacteria.kind()))
            .into_iter()
            .filter_map(|n| world.store.agent(n.id))
            .filter(|a| a.is_alive() && a.species == Species::Bacteria)
            .map(|a| (a.id, a.position, a.radius)),
    )?;

    let predation = &config.predator.predation;
    let prey = world.store.agent_mut(prey_id)?;
    prey.hits_taken += 1;
    if prey.hits_taken < predation.hits_to_kill {
        return Some(false);
    }
    let meal = predation.flat_gain + predation.efficiency * prey.energy;
    prey.mark_dead(DeathCause::Predation);
    world.hide(prey_id);

    let predator = world.store.agent_mut(id)?;
    predator.energy = gain(predator.energy, meal, &predator.energy_params);
    predator.meals += 1;
    debug!(predator = %id, prey = %prey_id, gain = meal, "prey killed");
    Some(true)
}

/// Closest candidate whose disc overlaps `(position, radius)`; ties go to the lowest id
fn nearest_overlapping<I>(position: Position, radius: f32, candidates: I) -> Option<EntityId>
where
    I: IntoIterator<Item = (EntityId, Position, f32)>,
{
    candidates
        .into_iter()
        .filter_map(|(id, p, r)| {
            let d = p.distance(&position);
            (d < radius + r).then_some((id, d))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(id, _)| id)
}

/// Whether the soft cap admits one more birth at population `n`
pub fn admits_birth<R: Rng + ?Sized>(n: usize, max: usize, soft_fraction: f32, rng: &mut R) -> bool {
    if n >= max {
        return false;
    }
    let soft = (soft_fraction * max as f32).floor() as usize;
    if n < soft {
        return true;
    }
    let p = (max - n) as f64 / (max - soft).max(1) as f64;
    rng.gen::<f64>() < p
}

/// Reproduce every eligible agent of `species` the caps allow.
///
/// Eligible agents go in order of energy (highest first) then id, so the
/// outcome depends only on state and the seeded RNG.
pub fn reproduction<R: Rng + ?Sized>(
    world: &mut WorldMut<'_>,
    config: &SimConfig,
    species: Species,
    substrate: &Substrate,
    rng: &mut R,
) -> Vec<EntityId> {
    let species_config = config.species(species);
    let mut eligible: Vec<(EntityId, f32)> = world
        .store
        .agents()
        .filter(|a| a.species == species && a.is_alive())
        .filter(|a| a.energy >= a.energy_params.split_energy)
        .map(|a| (a.id, a.energy))
        .collect();
    if eligible.is_empty() {
        return Vec::new();
    }
    eligible.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mutator = Mutator::new(species_config.mutation);
    let mut live = world.store.live_count(species);
    let mut born = Vec::new();
    for (parent_id, _) in eligible {
        if !admits_birth(
            live,
            species_config.max_count,
            species_config.reproduction.soft_cap_fraction,
            rng,
        ) {
            if live >= species_config.max_count {
                break;
            }
            continue;
        }
        match spawn_child(world, config, parent_id, &mutator, substrate, rng) {
            Ok(Some(child)) => {
                live += 1;
                born.push(child);
            }
            Ok(None) => {}
            Err(e) => debug!(parent = %parent_id, error = %e, "reproduction failed"),
        }
    }
    born
}

fn spawn_child<R: Rng + ?Sized>(
    world: &mut WorldMut<'_>,
    config: &SimConfig,
    parent_id: EntityId,
    mutator: &Mutator,
    substrate: &Substrate,
    rng: &mut R,
) -> Result<Option<EntityId>> {
    let Some(parent) = world.store.agent(parent_id) else {
        return Ok(None);
    };
    let repro = &config.species(parent.species).reproduction;
    let brain = mutator.offspring(&parent.brain, rng)?;
    let (parent_energy, child_energy) = prepare_reproduction(parent.energy, &parent.energy_params);

    let offset = Position::from_angle(rng.gen::<f32>() * std::f32::consts::TAU)
        .scale(parent.radius * repro.offset_fraction);
    let jitter = if repro.heading_jitter > 0.0 {
        rng.gen_range(-repro.heading_jitter..=repro.heading_jitter)
    } else {
        0.0
    };
    let mut velocity = Position::ORIGIN;
    let position = substrate.clamp(parent.position.add(offset), parent.radius, &mut velocity);
    let (species, heading, radius) = (parent.species, parent.heading + jitter, parent.radius);
    let (sensor, energy_params, generation) = (parent.sensor, parent.energy_params, parent.generation);

    let id = world.store.allocate_id();
    let mut child = Agent::new(
        id,
        species,
        position,
        heading,
        radius,
        child_energy,
        brain,
        sensor,
        energy_params,
    );
    child.generation = generation + 1;
    child.parent = Some(parent_id);
    let kind = child.kind();

    world.store.insert_agent(child);
    if world.use_index {
        world.index.insert(id, kind, position, radius);
    }
    if let Some(parent) = world.store.agent_mut(parent_id) {
        parent.energy = parent_energy;
        parent.offspring += 1;
    }
    trace!(parent = %parent_id, child = %id, energy = child_energy, "agent born");
    Ok(Some(id))
}

/// Queue agents that starved or grew too old.
///
/// A species is never marked below its `min_count` live agents: candidates
/// beyond that floor (highest energy first, then youngest, then highest id)
/// are spared and their energy is held at `death_energy`.
pub fn mark_deaths(world: &mut WorldMut<'_>, config: &SimConfig) -> usize {
    let mut marked = Vec::new();
    for species in Species::all() {
        let species_config = config.species(species);
        let mut candidates: Vec<(EntityId, f32, f32, DeathCause)> = world
            .store
            .agents()
            .filter(|a| a.species == species && a.is_alive())
            .filter_map(|a| death_cause(a, species_config.max_age).map(|c| (a.id, a.energy, a.age, c)))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(b.2.total_cmp(&a.2)).then(a.0.cmp(&b.0)));
        let allowed = world
            .store
            .live_count(species)
            .saturating_sub(species_config.min_count);

        let spared = candidates.len().saturating_sub(allowed);
        for (rank, (id, _, _, cause)) in candidates.into_iter().enumerate() {
            let Some(agent) = world.store.agent_mut(id) else {
                continue;
            };
            if rank < allowed {
                agent.mark_dead(cause);
                marked.push(id);
            } else {
                agent.energy = agent.energy.max(agent.energy_params.death_energy);
            }
        }
        if spared > 0 {
            trace!(%species, spared, floor = species_config.min_count, "death floor reached");
        }
    }
    for id in &marked {
        world.hide(*id);
    }
    marked.len()
}

fn death_cause(agent: &Agent, max_age: Option<f32>) -> Option<DeathCause> {
    if agent.energy <= agent.energy_params.death_energy {
        Some(DeathCause::Starvation)
    } else if max_age.is_some_and(|limit| agent.age >= limit) {
        Some(DeathCause::OldAge)
    } else {
        None
    }
}

/// Remove up to `budget` queued agents; returns what was purged.
///
/// Order: predation and culls first, then lowest energy, then oldest, then
/// lowest id.
pub fn purge_dead(world: &mut WorldMut<'_>, budget: usize) -> Vec<(EntityId, Species, DeathCause)> {
    let mut queued: Vec<&Agent> = world
        .store
        .agents()
        .filter(|a| a.death.is_some())
        .collect();
    queued.sort_by(|a, b| death_order(a, b));
    let victims: Vec<(EntityId, Species, DeathCause)> = queued
        .into_iter()
        .take(budget)
        .filter_map(|a| a.death.map(|cause| (a.id, a.species, cause)))
        .collect();

    for (id, _, _) in &victims {
        world.store.remove_agent(*id);
        world.index.remove(*id);
    }
    victims
}

fn death_order(a: &Agent, b: &Agent) -> Ordering {
    let deferred = |agent: &Agent| {
        !matches!(
            agent.death,
            Some(DeathCause::Predation) | Some(DeathCause::Culled)
        )
    };
    deferred(a)
        .cmp(&deferred(b))
        .then(a.energy.total_cmp(&b.energy))
        .then(b.age.total_cmp(&a.age))
        .then(a.id.cmp(&b.id))
}

/// Push overlapping agents apart (mass-weighted) and exchange an elastic
/// impulse along the contact normal, then keep everyone inside the substrate.
pub fn collisions(world: &mut WorldMut<'_>, substrate: &Substrate) -> usize {
    let mut contacts = 0;
    for id in world.store.live_ids() {
        let Some(a) = world.store.agent(id) else {
            continue;
        };
        let (pos_a, r_a) = (a.position, a.radius);
        let others: Vec<EntityId> = world
            .neighbours(pos_a, r_a, KindFilter::AGENTS)
            .into_iter()
            .map(|n| n.id)
            .filter(|other| *other > id)
            .collect();

        for other in others {
            if resolve_pair(world.store, id, other) {
                contacts += 1;
            }
        }
    }

    for agent in world.store.agents_mut().filter(|a| a.is_alive()) {
        let mut velocity = agent.velocity;
        agent.position = substrate.clamp(agent.position, agent.radius, &mut velocity);
        agent.velocity = velocity;
    }
    contacts
}

fn resolve_pair(store: &mut EntityStore, a_id: EntityId, b_id: EntityId) -> bool {
    let (Some(a), Some(b)) = (store.agent(a_id), store.agent(b_id)) else {
        return false;
    };
    if !a.is_alive() || !b.is_alive() {
        return false;
    }
    let delta = b.position.sub(a.position);
    let dist = delta.length();
    let overlap = a.radius + b.radius - dist;
    if overlap <= 0.0 {
        return false;
    }
    // coincident centres: separate along +x
    let normal = if dist > 1e-6 {
        delta.scale(1.0 / dist)
    } else {
        Position::new(1.0, 0.0)
    };
    let (m_a, m_b) = (a.mass(), b.mass());
    let total = m_a + m_b;

    // elastic exchange only when approaching
    let closing = b.velocity.sub(a.velocity).dot(normal);
    let impulse = if closing < 0.0 {
        -2.0 * closing / (1.0 / m_a + 1.0 / m_b)
    } else {
        0.0
    };

    if let Some(a) = store.agent_mut(a_id) {
        a.position = a.position.sub(normal.scale(overlap * m_b / total));
        a.velocity = a.velocity.sub(normal.scale(impulse / m_a));
    }
    if let Some(b) = store.agent_mut(b_id) {
        b.position = b.position.add(normal.scale(overlap * m_a / total));
        b.velocity = b.velocity.add(normal.scale(impulse / m_b));
    }
    true
}
