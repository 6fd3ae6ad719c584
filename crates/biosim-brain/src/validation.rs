//! Validation for controllers arriving from outside the engine.

use crate::network::NeuralNet;
use biosim_core::{Error, Result};

/// Check that an imported controller fits an agent's sensor and actuators
pub fn validate_controller(net: &NeuralNet, input_width: usize, output_width: usize) -> Result<()> {
    if net.params().len() != net.signature().param_count() {
        return Err(Error::Architecture(format!(
            "signature {} needs {} parameters, blob has {}",
            net.signature(),
            net.signature().param_count(),
            net.params().len()
        )));
    }
    if net.input_width() != input_width {
        return Err(Error::Architecture(format!(
            "controller input width {} does not match sensor width {}",
            net.input_width(),
            input_width
        )));
    }
    if net.output_width() != output_width {
        return Err(Error::Architecture(format!(
            "controller output width {} does not match action width {}",
            net.output_width(),
            output_width
        )));
    }
    if net.params().iter().any(|p| !p.is_finite()) {
        return Err(Error::Architecture(
            "controller contains non-finite parameters".to_string(),
        ));
    }
    Ok(())
}
