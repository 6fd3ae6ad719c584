//! Headless ecological simulation: a bounded substrate populated by food,
//! bacteria and predators, each agent steered by its own neural controller.
//!
//! [`Engine`] owns the world and advances it with [`Engine::step`]. Other
//! threads talk to it through a [`CommandSender`] and read published
//! [`WorldSnapshot`]s through a [`SnapshotHandle`].

pub mod actuator;
pub mod command;
pub mod engine;
pub mod entity;
pub mod food;
pub mod prototype;
pub mod sensor;
pub mod snapshot;
pub mod spatial;
pub mod substrate;
pub mod systems;

pub use command::{Command, CommandQueue, CommandSender};
pub use engine::Engine;
pub use entity::{Agent, EntityStore, Food};
pub use prototype::Prototype;
pub use snapshot::{AgentRecord, FoodRecord, SnapshotHandle, WorldSnapshot};
pub use spatial::{IndexStats, Neighbour, NeighbourQuery, SpatialIndex};
pub use substrate::Substrate;
