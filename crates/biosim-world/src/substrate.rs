//! The 2D substrate agents live on.

use biosim_core::{Position, SubstrateShape, WorldConfig};
use rand::Rng;

/// Velocity kept after bouncing off a rectangular wall (sign flipped)
const RECT_RESTITUTION: f32 = 0.5;
/// Multiple of the outward radial velocity removed at a circular wall
const CIRCLE_DAMPING: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Substrate {
    pub shape: SubstrateShape,
    pub width: f32,
    pub height: f32,
    pub radius: f32,
}

impl Substrate {
    pub fn from_config(config: &WorldConfig) -> Self {
        Self {
            shape: config.shape,
            width: config.width,
            height: config.height,
            radius: config.radius,
        }
    }

    pub fn center(&self) -> Position {
        Position::new(self.width * 0.5, self.height * 0.5)
    }

    /// Whether a disc of radius `r` at `p` lies fully inside
    pub fn contains(&self, p: Position, r: f32) -> bool {
        match self.shape {
            SubstrateShape::Rectangular => {
                p.x >= r && p.y >= r && p.x <= self.width - r && p.y <= self.height - r
            }
            SubstrateShape::Circular => p.distance(&self.center()) + r <= self.radius,
        }
    }

    /// Push a disc back inside and apply the wall response to `velocity`
    pub fn clamp(&self, p: Position, r: f32, velocity: &mut Position) -> Position {
        match self.shape {
            SubstrateShape::Rectangular => {
                let mut out = p;
                let (lo_x, hi_x) = axis_bounds(self.width, r);
                let (lo_y, hi_y) = axis_bounds(self.height, r);
                if out.x < lo_x || out.x > hi_x {
                    out.x = out.x.clamp(lo_x, hi_x);
                    velocity.x *= -RECT_RESTITUTION;
                }
                if out.y < lo_y || out.y > hi_y {
                    out.y = out.y.clamp(lo_y, hi_y);
                    velocity.y *= -RECT_RESTITUTION;
                }
                out
            }
            SubstrateShape::Circular => {
                let center = self.center();
                let offset = p.sub(center);
                let dist = offset.length();
                let limit = (self.radius - r).max(0.0);
                if dist <= limit {
                    return p;
                }
                if dist <= f32::EPSILON {
                    return center;
                }
                let normal = offset.scale(1.0 / dist);
                let outward = velocity.dot(normal);
                if outward > 0.0 {
                    *velocity = velocity.sub(normal.scale(outward * CIRCLE_DAMPING));
                }
                center.add(normal.scale(limit))
            }
        }
    }

    /// Uniform random position where a disc of radius `r` fits
    pub fn random_point<R: Rng + ?Sized>(&self, r: f32, rng: &mut R) -> Position {
        match self.shape {
            SubstrateShape::Rectangular => {
                let (lo_x, hi_x) = axis_bounds(self.width, r);
                let (lo_y, hi_y) = axis_bounds(self.height, r);
                Position::new(sample_range(rng, lo_x, hi_x), sample_range(rng, lo_y, hi_y))
            }
            SubstrateShape::Circular => {
                let limit = (self.radius - r).max(0.0);
                let angle = rng.gen::<f32>() * std::f32::consts::TAU;
                let dist = rng.gen::<f32>().sqrt() * limit;
                self.center().add(Position::from_angle(angle).scale(dist))
            }
        }
    }
}

/// Allowed centre range along one axis; collapses to the middle when the disc
/// is wider than the axis
fn axis_bounds(extent: f32, r: f32) -> (f32, f32) {
    if extent >= 2.0 * r {
        (r, extent - r)
    } else {
        (extent * 0.5, extent * 0.5)
    }
}

fn sample_range<R: Rng + ?Sized>(rng: &mut R, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}
