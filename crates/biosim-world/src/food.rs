//! Food placement and the replenishment controller.

use crate::entity::EntityStore;
use crate::spatial::NeighbourQuery;
use crate::substrate::Substrate;
use biosim_core::{EntityId, FoodConfig, KindFilter, Position};
use rand::Rng;
use tracing::trace;

/// Placement tries for one food item before giving up for this sub-step
const FOOD_ATTEMPTS: usize = 50;
/// Extra clearance kept between food items
const FOOD_MARGIN: f32 = 2.0;
/// Fraction of outstanding debt kept after every update
const DEBT_RETENTION: f32 = 0.99;

/// Keeps the food count near its target without sudden jumps.
///
/// A deficit accrues as "debt" proportional to `dt / replenish_interval`;
/// each whole unit of debt becomes one food item.
#[derive(Debug, Clone, Default)]
pub struct FoodController {
    debt: f32,
}

impl FoodController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debt(&self) -> f32 {
        self.debt
    }

    pub fn reset(&mut self) {
        self.debt = 0.0;
    }

    /// Spawn whatever the accumulated debt allows; returns the new ids
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        store: &mut EntityStore,
        config: &FoodConfig,
        substrate: &Substrate,
        dt: f32,
        rng: &mut R,
    ) -> Vec<EntityId> {
        let deficit = config.target as f32 - store.food_count() as f32;
        self.debt += deficit * dt / config.replenish_interval;

        let mut spawned = Vec::new();
        while self.debt >= 1.0 {
            match place_food(store, config, substrate, rng) {
                Some(id) => {
                    spawned.push(id);
                    self.debt -= 1.0;
                }
                None => break,
            }
        }
        self.debt = (self.debt * DEBT_RETENTION).max(0.0);
        if !spawned.is_empty() {
            trace!(count = spawned.len(), debt = self.debt, "food replenished");
        }
        spawned
    }
}

/// Add one food item at a random spot clear of other food
pub fn place_food<R: Rng + ?Sized>(
    store: &mut EntityStore,
    config: &FoodConfig,
    substrate: &Substrate,
    rng: &mut R,
) -> Option<EntityId> {
    let radius = random_radius(config.min_radius, config.max_radius, rng);
    let position = free_position(
        store,
        substrate,
        radius,
        FOOD_MARGIN,
        KindFilter::FOOD,
        FOOD_ATTEMPTS,
        rng,
    )?;
    Some(store.add_food(position, radius, config.value))
}

/// Random point where a disc of `radius` clears every entity matching
/// `filter` by `margin`, or `None` after `attempts` misses
pub fn free_position<Q, R>(
    query: &Q,
    substrate: &Substrate,
    radius: f32,
    margin: f32,
    filter: KindFilter,
    attempts: usize,
    rng: &mut R,
) -> Option<Position>
where
    Q: NeighbourQuery + ?Sized,
    R: Rng + ?Sized,
{
    (0..attempts).find_map(|_| {
        let p = substrate.random_point(radius, rng);
        let blocked = query
            .overlapping(p, radius + margin, filter)
            .iter()
            // touching at exactly the margin is allowed
            .any(|n| n.position.distance(&p) < n.radius + radius + margin);
        (!blocked).then_some(p)
    })
}

pub fn random_radius<R: Rng + ?Sized>(min: f32, max: f32, rng: &mut R) -> f32 {
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosim_core::WorldConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn world() -> Substrate {
        Substrate::from_config(&WorldConfig {
            width: 200.0,
            height: 200.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_debt_accumulates_gradually() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut store = EntityStore::new();
        let mut controller = FoodController::new();
        let config = FoodConfig {
            target: 10,
            replenish_interval: 1.0,
            ..Default::default()
        };

        // deficit 10 * dt 0.05 / 1.0 = 0.5 debt: nothing yet
        let spawned = controller.update(&mut store, &config, &world(), 0.05, &mut rng);
        assert!(spawned.is_empty());
        assert!(controller.debt() > 0.0);

        let spawned = controller.update(&mut store, &config, &world(), 0.1, &mut rng);
        assert_eq!(spawned.len(), 1);
        assert_eq!(store.food_count(), 1);
    }

    #[test]
    fn test_never_exceeds_target_from_surplus() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut store = EntityStore::new();
        let mut controller = FoodController::new();
        let config = FoodConfig {
            target: 0,
            ..Default::default()
        };
        store.add_food(Position::new(50.0, 50.0), 5.0, 1.0);
        let spawned = controller.update(&mut store, &config, &world(), 1.0, &mut rng);
        assert!(spawned.is_empty());
        assert_eq!(controller.debt(), 0.0);
    }

    #[test]
    fn test_food_does_not_overlap() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut store = EntityStore::new();
        let config = FoodConfig::default();
        for _ in 0..30 {
            place_food(&mut store, &config, &world(), &mut rng);
        }
        let foods: Vec<_> = store.foods().cloned().collect();
        assert!(!foods.is_empty());
        for (i, a) in foods.iter().enumerate() {
            for b in &foods[i + 1..] {
                assert!(a.position.distance(&b.position) >= a.radius + b.radius + FOOD_MARGIN - 1e-3);
            }
        }
    }
}
