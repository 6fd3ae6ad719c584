//! Portable agent templates for importing trained or hand-made controllers.

use crate::entity::Agent;
use biosim_brain::{validate_controller, NeuralNet, Signature};
use biosim_core::{Error, Result, SensorConfig, Species, ACTION_WIDTH};
use serde::{Deserialize, Serialize};

/// Everything needed to spawn an agent with a known controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    pub species: Species,
    /// Layer widths of the controller
    pub signature: Vec<usize>,
    /// Flat controller parameters, see [`NeuralNet`]
    pub params: Vec<f32>,
    /// Sensor the controller was built for
    pub sensor: SensorConfig,
    pub energy: f32,
    pub radius: f32,
    /// Initial heading; random when absent
    pub heading: Option<f32>,
}

impl Prototype {
    /// Build a prototype, rejecting inconsistent dimensions up front
    pub fn new(
        species: Species,
        brain: &NeuralNet,
        sensor: SensorConfig,
        energy: f32,
        radius: f32,
    ) -> Result<Self> {
        let prototype = Self {
            species,
            signature: brain.signature().widths().to_vec(),
            params: brain.params().to_vec(),
            sensor,
            energy,
            radius,
            heading: None,
        };
        prototype.controller()?;
        Ok(prototype)
    }

    /// Snapshot a live agent
    pub fn capture(agent: &Agent) -> Self {
        Self {
            species: agent.species,
            signature: agent.brain.signature().widths().to_vec(),
            params: agent.brain.params().to_vec(),
            sensor: agent.sensor,
            energy: agent.energy,
            radius: agent.radius,
            heading: Some(agent.heading),
        }
    }

    pub fn with_heading(mut self, heading: f32) -> Self {
        self.heading = Some(heading);
        self
    }

    /// Rebuild and check the controller this prototype describes
    pub fn controller(&self) -> Result<NeuralNet> {
        if !(self.energy.is_finite() && self.energy >= 0.0) {
            return Err(Error::invalid_parameter("prototype.energy", "must be finite and non-negative"));
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::invalid_parameter("prototype.radius", "must be positive"));
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() {
                return Err(Error::invalid_parameter("prototype.heading", "must be finite"));
            }
        }
        let net = NeuralNet::from_parts(Signature::new(self.signature.clone())?, self.params.clone())?;
        validate_controller(&net, self.sensor.output_width(), ACTION_WIDTH)?;
        Ok(net)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let prototype: Prototype = bincode::deserialize(bytes)?;
        prototype.controller()?;
        Ok(prototype)
    }
}
