//! Neural controllers for BioSim agents.
//!
//! A controller is a small fully-connected feedforward network whose shape
//! is identified by its [`Signature`]. Controllers are:
//! - Data-oriented: one flat parameter buffer per agent
//! - Mutable: point and structural mutation across generations
//! - Batchable: agents sharing a signature are evaluated together, each with its own weights

pub mod network;
pub mod mutation;
pub mod batch;
pub mod validation;

pub use network::{NeuralNet, Signature};
pub use mutation::{MutationReport, Mutator};
pub use batch::{forward_batch, group_by_signature};
pub use validation::validate_controller;
