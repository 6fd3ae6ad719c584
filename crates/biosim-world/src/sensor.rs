//! Retina: a fan of rays cast from the front of an agent.

use crate::spatial::{Neighbour, NeighbourQuery};
use biosim_core::{EntityId, EntityKind, Position, SensorConfig, SensorEncoding};

/// Nearest hit along one ray
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub id: EntityId,
    pub kind: EntityKind,
    pub distance: f32,
}

/// Where the retina sits and which entity owns it
#[derive(Debug, Clone, Copy)]
pub struct Eye {
    pub owner: EntityId,
    pub position: Position,
    pub heading: f32,
    pub body_radius: f32,
}

impl Eye {
    /// Rays start on the body's rim, straight ahead
    pub fn origin(&self) -> Position {
        self.position
            .add(Position::from_angle(self.heading).scale(self.body_radius))
    }
}

/// Angles of every ray relative to the heading, evenly spread across the FOV
pub fn ray_angles(config: &SensorConfig) -> Vec<f32> {
    let n = config.ray_count;
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![0.0];
    }
    let fov = config.fov_degrees.to_radians();
    let half = fov * 0.5;
    (0..n)
        .map(|i| -half + i as f32 / (n - 1) as f32 * fov)
        .collect()
}

/// Distance along a unit ray to the first point of a disc, if any.
/// A ray starting inside the disc hits it at distance 0.
pub fn ray_disc(origin: Position, dir: Position, center: Position, radius: f32) -> Option<f32> {
    let oc = origin.sub(center);
    let c = oc.dot(oc) - radius * radius;
    if c <= 0.0 {
        return Some(0.0);
    }
    let b = oc.dot(dir);
    if b > 0.0 {
        // pointing away and outside
        return None;
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let t = -b - disc.sqrt();
    (t >= 0.0).then_some(t)
}

/// Cast every ray and return the nearest hit per ray and per visible kind.
///
/// The outer vector has one entry per ray; the inner one follows
/// `config.filter().kinds()` order.
pub fn cast<Q: NeighbourQuery + ?Sized>(
    query: &Q,
    eye: &Eye,
    config: &SensorConfig,
) -> Vec<Vec<Option<RayHit>>> {
    let filter = config.filter();
    let kinds = filter.kinds();
    let angles = ray_angles(config);
    let origin = eye.origin();
    let range = config.vision_radius;

    let candidates: Vec<Neighbour> = if kinds.is_empty() {
        Vec::new()
    } else {
        query
            .overlapping(origin, range, filter)
            .into_iter()
            .filter(|n| n.id != eye.owner)
            .collect()
    };

    angles
        .iter()
        .map(|angle| {
            let dir = Position::from_angle(eye.heading + angle);
            let mut nearest: Vec<Option<RayHit>> = vec![None; kinds.len()];
            // candidates are in id order, so strict < keeps the lowest id on ties
            for n in &candidates {
                let Some(slot) = kinds.iter().position(|k| *k == n.kind) else {
                    continue;
                };
                if let Some(t) = ray_disc(origin, dir, n.position, n.radius) {
                    if t <= range && nearest[slot].map_or(true, |h| t < h.distance) {
                        nearest[slot] = Some(RayHit {
                            id: n.id,
                            kind: n.kind,
                            distance: t,
                        });
                    }
                }
            }
            nearest
        })
        .collect()
}

/// Build the observation vector for one agent
pub fn sense<Q: NeighbourQuery + ?Sized>(query: &Q, eye: &Eye, config: &SensorConfig) -> Vec<f32> {
    let range = config.vision_radius;
    let rays = cast(query, eye, config);
    let mut out = Vec::with_capacity(config.output_width());
    for per_kind in rays {
        match config.encoding {
            SensorEncoding::Proximity => {
                let hit = closest(&per_kind);
                out.push(hit.map_or(0.0, |h| proximity(h.distance, range)));
            }
            SensorEncoding::DistanceKind => match closest(&per_kind) {
                Some(h) => {
                    out.push(h.distance / range);
                    out.push(h.kind.sensor_code());
                }
                None => {
                    out.push(1.0);
                    out.push(0.0);
                }
            },
            SensorEncoding::PerKind => {
                for hit in per_kind {
                    out.push(hit.map_or(0.0, |h| proximity(h.distance, range)));
                }
            }
        }
    }
    out
}

fn closest(hits: &[Option<RayHit>]) -> Option<RayHit> {
    hits.iter()
        .flatten()
        .copied()
        .min_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)))
}

fn proximity(distance: f32, range: f32) -> f32 {
    ((range - distance) / range).clamp(0.0, 1.0)
}
