//! Uniform-grid spatial hash for neighbourhood queries.

use biosim_core::{EntityId, EntityKind, KindFilter, Position};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

type Cell = (i32, i32);

/// An entity as seen through a proximity query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Position,
    pub radius: f32,
}

/// Source of "what is near this point" answers.
///
/// Implemented by [`SpatialIndex`] and by the entity store itself (a brute
/// force scan used when the index is disabled).
pub trait NeighbourQuery {
    /// Entities whose disc intersects the circle `(center, radius)`, ordered by id
    fn overlapping(&self, center: Position, radius: f32, filter: KindFilter) -> Vec<Neighbour>;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    cell: Cell,
    kind: EntityKind,
    position: Position,
    radius: f32,
}

/// Occupancy summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub entries: usize,
    pub occupied_cells: usize,
    pub mean_bucket: f32,
    pub max_bucket: usize,
    pub cell_size: f32,
}

/// Unbounded uniform grid keyed by cell coordinate. Each entity lives in the
/// bucket of the cell containing its centre.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f32,
    buckets: HashMap<Cell, Vec<EntityId>>,
    slots: HashMap<EntityId, Slot>,
    /// Largest radius inserted since the last clear, used to pad disc queries
    max_radius: f32,
}

impl SpatialIndex {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: sanitize_cell(cell_size),
            buckets: HashMap::new(),
            slots: HashMap::new(),
            max_radius: 0.0,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Change the cell size, re-bucketing every entry
    pub fn set_cell_size(&mut self, cell_size: f32) {
        let cell_size = sanitize_cell(cell_size);
        if cell_size == self.cell_size {
            return;
        }
        self.cell_size = cell_size;
        let mut entries: Vec<(EntityId, Slot)> = self.slots.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        self.buckets.clear();
        for (id, slot) in entries {
            self.insert(id, slot.kind, slot.position, slot.radius);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn position(&self, id: EntityId) -> Option<Position> {
        self.slots.get(&id).map(|s| s.position)
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.slots.clear();
        self.max_radius = 0.0;
    }

    /// Clear and re-insert a full set of entities
    pub fn rebuild<I>(&mut self, entities: I)
    where
        I: IntoIterator<Item = (EntityId, EntityKind, Position, f32)>,
    {
        self.clear();
        for (id, kind, position, radius) in entities {
            self.insert(id, kind, position, radius);
        }
    }

    /// Insert (or re-insert) an entity
    pub fn insert(&mut self, id: EntityId, kind: EntityKind, position: Position, radius: f32) {
        if self.slots.contains_key(&id) {
            self.remove(id);
        }
        let cell = self.cell_of(position);
        self.buckets.entry(cell).or_default().push(id);
        self.slots.insert(
            id,
            Slot {
                cell,
                kind,
                position,
                radius,
            },
        );
        if radius.is_finite() {
            self.max_radius = self.max_radius.max(radius);
        }
    }

    /// Relocate an entity; returns false when it is not indexed
    pub fn move_to(&mut self, id: EntityId, position: Position) -> bool {
        let new_cell = self.cell_of(position);
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        let old_cell = slot.cell;
        slot.position = position;
        slot.cell = new_cell;
        if old_cell != new_cell {
            remove_from_bucket(&mut self.buckets, old_cell, id);
            self.buckets.entry(new_cell).or_default().push(id);
        }
        true
    }

    /// Remove an entity; returns false when it was not indexed
    pub fn remove(&mut self, id: EntityId) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                remove_from_bucket(&mut self.buckets, slot.cell, id);
                true
            }
            None => false,
        }
    }

    /// Candidate ids from every cell touched by the circle's bounding box.
    ///
    /// The result may contain entities outside the circle; callers check the
    /// distance precisely (or use [`SpatialIndex::query_within`]). A
    /// non-finite point or radius yields an empty result.
    pub fn query_radius(&self, point: Position, radius: f32, filter: KindFilter) -> Vec<EntityId> {
        let mut out = Vec::new();
        self.for_each_candidate(point, radius, |id, slot| {
            if filter.matches(slot.kind) {
                out.push(id);
            }
        });
        out
    }

    /// Entities whose centre lies within `radius` of `point`
    pub fn query_within(&self, point: Position, radius: f32, filter: KindFilter) -> Vec<Neighbour> {
        let r2 = radius * radius;
        let mut out = Vec::new();
        self.for_each_candidate(point, radius, |id, slot| {
            if filter.matches(slot.kind) && slot.position.distance_sq(&point) <= r2 {
                out.push(Neighbour {
                    id,
                    kind: slot.kind,
                    position: slot.position,
                    radius: slot.radius,
                });
            }
        });
        out
    }

    pub fn stats(&self) -> IndexStats {
        let occupied = self.buckets.values().filter(|b| !b.is_empty()).count();
        IndexStats {
            entries: self.slots.len(),
            occupied_cells: occupied,
            mean_bucket: if occupied > 0 {
                self.slots.len() as f32 / occupied as f32
            } else {
                0.0
            },
            max_bucket: self.buckets.values().map(Vec::len).max().unwrap_or(0),
            cell_size: self.cell_size,
        }
    }

    fn cell_of(&self, position: Position) -> Cell {
        // `as` saturates, so far-away or non-finite positions still land in a cell
        (
            (position.x / self.cell_size).floor() as i32,
            (position.y / self.cell_size).floor() as i32,
        )
    }

    fn for_each_candidate(&self, point: Position, radius: f32, mut visit: impl FnMut(EntityId, &Slot)) {
        if !point.is_finite() || !radius.is_finite() || radius < 0.0 {
            return;
        }
        // widen slightly so rounding never drops a boundary cell
        let reach = radius + radius * 1e-5 + 1e-4;
        let (x0, y0) = self.cell_of(Position::new(point.x - reach, point.y - reach));
        let (x1, y1) = self.cell_of(Position::new(point.x + reach, point.y + reach));
        // `None` when the box has more cells than a usize can count
        let span = (x1 as i64 - x0 as i64 + 1)
            .checked_mul(y1 as i64 - y0 as i64 + 1)
            .and_then(|cells| usize::try_from(cells).ok());

        let mut emit = |cell: &Cell| {
            if let Some(bucket) = self.buckets.get(cell) {
                for id in bucket {
                    if let Some(slot) = self.slots.get(id) {
                        visit(*id, slot);
                    }
                }
            }
        };

        if span.map_or(true, |cells| cells > self.buckets.len()) {
            // Huge query: walk the occupied cells instead of the box
            let mut cells: Vec<&Cell> = self
                .buckets
                .keys()
                .filter(|(cx, cy)| *cx >= x0 && *cx <= x1 && *cy >= y0 && *cy <= y1)
                .collect();
            cells.sort();
            for cell in cells {
                emit(cell);
            }
        } else {
            for cx in x0..=x1 {
                for cy in y0..=y1 {
                    emit(&(cx, cy));
                }
            }
        }
    }
}

impl NeighbourQuery for SpatialIndex {
    fn overlapping(&self, center: Position, radius: f32, filter: KindFilter) -> Vec<Neighbour> {
        let mut hits: Vec<Neighbour> = self
            .query_within(center, radius + self.max_radius, filter)
            .into_iter()
            .filter(|n| n.position.distance(&center) <= radius + n.radius)
            .collect();
        hits.sort_by_key(|n| n.id);
        hits
    }
}

fn remove_from_bucket(buckets: &mut HashMap<Cell, Vec<EntityId>>, cell: Cell, id: EntityId) {
    if let Some(bucket) = buckets.get_mut(&cell) {
        if let Some(i) = bucket.iter().position(|e| *e == id) {
            bucket.swap_remove(i);
        }
        if bucket.is_empty() {
            buckets.remove(&cell);
        }
    }
}

fn sanitize_cell(cell_size: f32) -> f32 {
    if cell_size.is_finite() && cell_size > 0.0 {
        cell_size
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn index_with(cell: f32, points: &[(f32, f32)]) -> SpatialIndex {
        let mut index = SpatialIndex::new(cell);
        index.rebuild(
            points
                .iter()
                .enumerate()
                .map(|(i, &(x, y))| (EntityId(i as u64), EntityKind::Food, Position::new(x, y), 1.0)),
        );
        index
    }

    #[test]
    fn test_query_only_returns_nearby() {
        let index = index_with(10.0, &[(0.0, 0.0), (50.0, 50.0)]);
        let hits = index.query_within(Position::ORIGIN, 5.0, KindFilter::ALL);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, EntityId(0));

        let candidates = index.query_radius(Position::ORIGIN, 5.0, KindFilter::ALL);
        assert!(candidates.contains(&EntityId(0)));
        assert!(!candidates.contains(&EntityId(1)));
    }

    #[test]
    fn test_non_finite_query_is_empty() {
        let index = index_with(10.0, &[(0.0, 0.0)]);
        assert!(index.query_radius(Position::new(f32::NAN, 0.0), 5.0, KindFilter::ALL).is_empty());
        assert!(index.query_radius(Position::ORIGIN, f32::INFINITY, KindFilter::ALL).is_empty());
        assert!(index.query_within(Position::ORIGIN, f32::NAN, KindFilter::ALL).is_empty());
    }

    #[test]
    fn test_saturated_cells_fall_back_to_occupied_walk() {
        // every coordinate saturates the cell range, so the query box spans ~2^64 cells
        let index = index_with(1e-9, &[(10.0, 10.0)]);
        let hits = index.query_within(Position::new(10.0, 10.0), 120.0, KindFilter::ALL);
        assert_eq!(hits.len(), 1);

        let index = index_with(10.0, &[(0.0, 0.0), (1e6, -1e6)]);
        let hits = index.query_within(Position::ORIGIN, 1e30, KindFilter::ALL);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_move_and_remove() {
        let mut index = index_with(10.0, &[(0.0, 0.0)]);
        assert!(index.move_to(EntityId(0), Position::new(95.0, 95.0)));
        assert!(index.query_within(Position::ORIGIN, 5.0, KindFilter::ALL).is_empty());
        assert_eq!(
            index.query_within(Position::new(95.0, 95.0), 1.0, KindFilter::ALL).len(),
            1
        );
        assert!(index.remove(EntityId(0)));
        assert!(!index.remove(EntityId(0)));
        assert!(!index.move_to(EntityId(0), Position::ORIGIN));
        assert!(index.is_empty());
        assert_eq!(index.stats().occupied_cells, 0);
    }

    #[test]
    fn test_kind_filter() {
        let mut index = SpatialIndex::new(10.0);
        index.insert(EntityId(1), EntityKind::Food, Position::ORIGIN, 1.0);
        index.insert(EntityId(2), EntityKind::Bacteria, Position::new(1.0, 0.0), 1.0);
        let food = index.query_within(Position::ORIGIN, 5.0, KindFilter::FOOD);
        assert_eq!(food.len(), 1);
        assert_eq!(food[0].kind, EntityKind::Food);
        assert_eq!(index.query_within(Position::ORIGIN, 5.0, KindFilter::AGENTS).len(), 1);
    }

    #[test]
    fn test_overlapping_accounts_for_radius() {
        let mut index = SpatialIndex::new(4.0);
        index.insert(EntityId(1), EntityKind::Bacteria, Position::new(20.0, 0.0), 12.0);
        // centre is 20 away but the disc reaches to 8
        let hits = index.overlapping(Position::ORIGIN, 9.0, KindFilter::ALL);
        assert_eq!(hits.len(), 1);
        assert!(index.overlapping(Position::ORIGIN, 7.0, KindFilter::ALL).is_empty());
    }

    #[test]
    fn test_stats_and_cell_size_change() {
        let mut index = index_with(10.0, &[(1.0, 1.0), (2.0, 2.0), (55.0, 5.0)]);
        let stats = index.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.occupied_cells, 2);
        assert_eq!(stats.max_bucket, 2);
        assert_eq!(stats.mean_bucket, 1.5);

        index.set_cell_size(100.0);
        assert_eq!(index.stats().occupied_cells, 1);
        assert_eq!(index.query_within(Position::ORIGIN, 60.0, KindFilter::ALL).len(), 3);
    }

    #[test]
    fn test_negative_coordinates() {
        let index = index_with(10.0, &[(-15.0, -3.0), (3.0, 3.0)]);
        let hits = index.query_within(Position::new(-14.0, -2.0), 2.0, KindFilter::ALL);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, EntityId(0));
    }

    proptest! {
        #[test]
        fn prop_query_matches_brute_force(
            cell in 0.5f32..200.0,
            points in prop::collection::vec((-500.0f32..500.0, -500.0f32..500.0), 0..60),
            qx in -500.0f32..500.0,
            qy in -500.0f32..500.0,
            radius in 0.0f32..300.0,
        ) {
            let index = index_with(cell, &points);
            let center = Position::new(qx, qy);
            let mut got: Vec<u64> = index
                .query_within(center, radius, KindFilter::ALL)
                .into_iter()
                .map(|n| n.id.0)
                .collect();
            got.sort();
            let expected: Vec<u64> = points
                .iter()
                .enumerate()
                .filter(|(_, &(x, y))| Position::new(x, y).distance_sq(&center) <= radius * radius)
                .map(|(i, _)| i as u64)
                .collect();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn prop_moves_keep_index_consistent(
            moves in prop::collection::vec((0u64..10, -300.0f32..300.0, -300.0f32..300.0), 0..80),
        ) {
            let mut index = SpatialIndex::new(17.0);
            let mut truth: HashMap<u64, Position> = HashMap::new();
            for id in 0..10u64 {
                index.insert(EntityId(id), EntityKind::Bacteria, Position::ORIGIN, 1.0);
                truth.insert(id, Position::ORIGIN);
            }
            for (id, x, y) in moves {
                index.move_to(EntityId(id), Position::new(x, y));
                truth.insert(id, Position::new(x, y));
            }
            for (id, pos) in truth {
                let hits = index.query_within(pos, 0.0, KindFilter::ALL);
                prop_assert!(hits.iter().any(|n| n.id == EntityId(id)));
            }
            prop_assert_eq!(index.len(), 10);
        }
    }
}
