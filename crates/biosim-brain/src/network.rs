//! Feedforward controller with a flat parameter buffer.
//!
//! A network is fully described by its [`Signature`] (ordered layer widths)
//! and one contiguous `Vec<f32>` holding, for every layer in order, the
//! weights (`out × in`, row-major) followed by the biases (`out`). Hidden
//! layers use `tanh`, the output layer is linear.

use biosim_core::{Error, Result};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scale of freshly grown incoming weights (divided by `sqrt(fan_in)`)
const GROWTH_STD: f32 = 0.1;

/// Ordered layer widths, input first and output last.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(Vec<usize>);

impl Signature {
    pub fn new(widths: Vec<usize>) -> Result<Self> {
        if widths.len() < 2 {
            return Err(Error::Architecture(format!(
                "a network needs at least an input and an output layer, got {:?}",
                widths
            )));
        }
        if widths.iter().any(|&w| w == 0) {
            return Err(Error::Architecture(format!(
                "layer widths must be non-zero, got {:?}",
                widths
            )));
        }
        Ok(Self(widths))
    }

    pub fn widths(&self) -> &[usize] {
        &self.0
    }

    pub fn input_width(&self) -> usize {
        self.0[0]
    }

    pub fn output_width(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    pub fn hidden(&self) -> &[usize] {
        &self.0[1..self.0.len() - 1]
    }

    /// Number of weight layers (connections between consecutive widths)
    pub fn layer_count(&self) -> usize {
        self.0.len() - 1
    }

    /// Total number of weights and biases this architecture requires
    pub fn param_count(&self) -> usize {
        self.0.windows(2).map(|w| w[0] * w[1] + w[1]).sum()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|w| w.to_string()).collect();
        f.write_str(&parts.join("-"))
    }
}

/// Weights of one layer, detached from the flat buffer for reshaping
struct LayerParams {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralNet {
    signature: Signature,
    params: Vec<f32>,
}

impl NeuralNet {
    /// Random initialisation: weights ~ N(0, init_std / sqrt(fan_in)), biases
    /// with half that deviation.
    pub fn random<R: Rng + ?Sized>(signature: Signature, init_std: f32, rng: &mut R) -> Self {
        let mut params = Vec::with_capacity(signature.param_count());
        for pair in signature.widths().windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let std = init_std / (fan_in as f32).sqrt();
            for _ in 0..fan_in * fan_out {
                params.push(gaussian(rng, std));
            }
            for _ in 0..fan_out {
                params.push(gaussian(rng, std * 0.5));
            }
        }
        Self { signature, params }
    }

    /// Build from an existing parameter buffer, checking its length
    pub fn from_parts(signature: Signature, params: Vec<f32>) -> Result<Self> {
        let expected = signature.param_count();
        if params.len() != expected {
            return Err(Error::Architecture(format!(
                "signature {} needs {} parameters, got {}",
                signature,
                expected,
                params.len()
            )));
        }
        if params.iter().any(|p| !p.is_finite()) {
            return Err(Error::Architecture(
                "parameter buffer contains non-finite values".to_string(),
            ));
        }
        Ok(Self { signature, params })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn input_width(&self) -> usize {
        self.signature.input_width()
    }

    pub fn output_width(&self) -> usize {
        self.signature.output_width()
    }

    /// Offset of each layer's weights in the flat buffer
    pub(crate) fn layer_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.signature.layer_count());
        let mut offset = 0;
        for pair in self.signature.widths().windows(2) {
            offsets.push(offset);
            offset += pair[0] * pair[1] + pair[1];
        }
        offsets
    }

    /// Evaluate the network on one observation vector
    pub fn forward(&self, inputs: &[f32]) -> Result<Vec<f32>> {
        let mut layers = self.activations(inputs)?;
        Ok(layers.pop().unwrap_or_default())
    }

    /// Post-activation values of every non-input layer, in order
    pub fn activations(&self, inputs: &[f32]) -> Result<Vec<Vec<f32>>> {
        if inputs.len() != self.input_width() {
            return Err(Error::Architecture(format!(
                "input width {} does not match network input {}",
                inputs.len(),
                self.input_width()
            )));
        }

        let widths = self.signature.widths();
        let last = self.signature.layer_count() - 1;
        let mut layers = Vec::with_capacity(self.signature.layer_count());
        let mut current = inputs.to_vec();
        for (l, offset) in self.layer_offsets().into_iter().enumerate() {
            let (n_in, n_out) = (widths[l], widths[l + 1]);
            let weights = &self.params[offset..offset + n_in * n_out];
            let biases = &self.params[offset + n_in * n_out..offset + n_in * n_out + n_out];
            let mut next = Vec::with_capacity(n_out);
            for o in 0..n_out {
                let row = &weights[o * n_in..(o + 1) * n_in];
                let mut sum = biases[o];
                for (w, x) in row.iter().zip(&current) {
                    sum += w * x;
                }
                next.push(if l == last { sum } else { sum.tanh() });
            }
            layers.push(next.clone());
            current = next;
        }
        Ok(layers)
    }

    /// Change the input width, keeping weights for surviving inputs.
    /// New input weights ~ N(0, 0.1 / sqrt(new_width)).
    pub fn resize_input<R: Rng + ?Sized>(&mut self, new_width: usize, rng: &mut R) -> Result<()> {
        if new_width == 0 {
            return Err(Error::Architecture("input width must be non-zero".to_string()));
        }
        if new_width == self.input_width() {
            return Ok(());
        }
        let mut layers = self.split_layers();
        let first = &mut layers[0];
        let std = GROWTH_STD / (new_width as f32).sqrt();
        first.weights = regrow_columns(first, new_width, |_| gaussian(rng, std));
        first.inputs = new_width;

        let mut widths = self.signature.widths().to_vec();
        widths[0] = new_width;
        self.rebuild(Signature::new(widths)?, layers);
        Ok(())
    }

    /// Change the width of hidden layer `index` (0 = first hidden layer).
    ///
    /// Surviving neurons keep their weights. Grown neurons get incoming
    /// weights ~ N(0, 0.1 / sqrt(fan_in)), zero bias and outgoing weights
    /// ~ N(0, 0.1).
    pub fn resize_hidden<R: Rng + ?Sized>(
        &mut self,
        index: usize,
        new_width: usize,
        rng: &mut R,
    ) -> Result<()> {
        let hidden = self.signature.hidden().len();
        if index >= hidden {
            return Err(Error::Architecture(format!(
                "hidden layer {} out of range ({} hidden layers)",
                index, hidden
            )));
        }
        if new_width == 0 {
            return Err(Error::Architecture("hidden width must be non-zero".to_string()));
        }
        let old_width = self.signature.widths()[index + 1];
        if new_width == old_width {
            return Ok(());
        }

        let mut layers = self.split_layers();

        // incoming: rows change
        let incoming = &mut layers[index];
        let fan_in = incoming.inputs;
        let keep = old_width.min(new_width);
        let std = GROWTH_STD / (fan_in as f32).sqrt();
        incoming.weights.truncate(keep * fan_in);
        incoming.biases.truncate(keep);
        for _ in keep..new_width {
            for _ in 0..fan_in {
                incoming.weights.push(gaussian(rng, std));
            }
            incoming.biases.push(0.0);
        }
        incoming.outputs = new_width;

        // outgoing: columns change
        let outgoing = &mut layers[index + 1];
        outgoing.weights = regrow_columns(outgoing, new_width, |_| gaussian(rng, GROWTH_STD));
        outgoing.inputs = new_width;

        let mut widths = self.signature.widths().to_vec();
        widths[index + 1] = new_width;
        self.rebuild(Signature::new(widths)?, layers);
        Ok(())
    }

    fn split_layers(&self) -> Vec<LayerParams> {
        let widths = self.signature.widths();
        self.layer_offsets()
            .into_iter()
            .enumerate()
            .map(|(l, offset)| {
                let (inputs, outputs) = (widths[l], widths[l + 1]);
                let split = offset + inputs * outputs;
                LayerParams {
                    inputs,
                    outputs,
                    weights: self.params[offset..split].to_vec(),
                    biases: self.params[split..split + outputs].to_vec(),
                }
            })
            .collect()
    }

    fn rebuild(&mut self, signature: Signature, layers: Vec<LayerParams>) {
        let mut params = Vec::with_capacity(signature.param_count());
        for layer in layers {
            debug_assert_eq!(layer.weights.len(), layer.inputs * layer.outputs);
            params.extend(layer.weights);
            params.extend(layer.biases);
        }
        self.signature = signature;
        self.params = params;
    }
}

/// Rebuild a row-major weight matrix with a different column count
fn regrow_columns(
    layer: &LayerParams,
    new_inputs: usize,
    mut fresh: impl FnMut(usize) -> f32,
) -> Vec<f32> {
    let mut weights = Vec::with_capacity(layer.outputs * new_inputs);
    for o in 0..layer.outputs {
        let row = &layer.weights[o * layer.inputs..(o + 1) * layer.inputs];
        for i in 0..new_inputs {
            weights.push(if i < layer.inputs { row[i] } else { fresh(i) });
        }
    }
    weights
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R, std: f32) -> f32 {
    let z: f32 = rng.sample(StandardNormal);
    z * std
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sig(widths: &[usize]) -> Signature {
        Signature::new(widths.to_vec()).unwrap()
    }

    #[test]
    fn test_signature_param_count() {
        let s = sig(&[3, 4, 2]);
        assert_eq!(s.param_count(), 3 * 4 + 4 + 4 * 2 + 2);
        assert_eq!(s.hidden(), &[4]);
        assert_eq!(s.to_string(), "3-4-2");
        assert!(Signature::new(vec![3]).is_err());
        assert!(Signature::new(vec![3, 0, 2]).is_err());
    }

    #[test]
    fn test_forward_known_values() {
        // 2 -> 1 linear: y = 0.5*a - 1.0*b + 0.25
        let net = NeuralNet::from_parts(sig(&[2, 1]), vec![0.5, -1.0, 0.25]).unwrap();
        let out = net.forward(&[2.0, 1.0]).unwrap();
        assert_eq!(out, vec![0.25]);
    }

    #[test]
    fn test_hidden_layer_uses_tanh() {
        // 1 -> 1 (tanh) -> 1 (linear), all weights 1, biases 0
        let net = NeuralNet::from_parts(sig(&[1, 1, 1]), vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        let out = net.forward(&[0.5]).unwrap();
        assert!((out[0] - 0.5f32.tanh()).abs() < 1e-6);

        let acts = net.activations(&[0.5]).unwrap();
        assert_eq!(acts.len(), 2);
        assert_eq!(acts[1], out);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = NeuralNet::random(sig(&[4, 3, 2]), 1.0, &mut rng);
        assert!(net.forward(&[0.0; 3]).is_err());
        assert_eq!(net.forward(&[0.0; 4]).unwrap().len(), 2);
    }

    #[test]
    fn test_from_parts_validates_length() {
        assert!(NeuralNet::from_parts(sig(&[2, 1]), vec![0.0; 2]).is_err());
        assert!(NeuralNet::from_parts(sig(&[2, 1]), vec![0.0, f32::NAN, 0.0]).is_err());
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = NeuralNet::random(sig(&[5, 4, 2]), 1.0, &mut ChaCha8Rng::seed_from_u64(9));
        let b = NeuralNet::random(sig(&[5, 4, 2]), 1.0, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
        assert_eq!(a.params().len(), a.signature().param_count());
    }

    #[test]
    fn test_resize_input_preserves_existing_weights() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut net = NeuralNet::random(sig(&[2, 3, 2]), 1.0, &mut rng);
        let before = net.clone();

        net.resize_input(4, &mut rng).unwrap();
        assert_eq!(net.input_width(), 4);
        assert_eq!(net.params().len(), net.signature().param_count());
        for o in 0..3 {
            for i in 0..2 {
                assert_eq!(net.params()[o * 4 + i], before.params()[o * 2 + i]);
            }
        }
        // later layers untouched
        let tail = before.params().len() - (3 * 2 + 3);
        assert_eq!(
            &net.params()[net.params().len() - tail..],
            &before.params()[before.params().len() - tail..]
        );

        net.resize_input(1, &mut rng).unwrap();
        assert_eq!(net.input_width(), 1);
        assert_eq!(net.params()[0], before.params()[0]);
        assert!(net.forward(&[1.0]).is_ok());
    }

    #[test]
    fn test_resize_hidden_grow_and_shrink() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut net = NeuralNet::random(sig(&[3, 4, 4, 2]), 1.0, &mut rng);
        let before = net.clone();

        net.resize_hidden(0, 6, &mut rng).unwrap();
        assert_eq!(net.signature().widths(), &[3, 6, 4, 2]);
        assert_eq!(net.params().len(), net.signature().param_count());
        // first 4 neurons keep their incoming weights
        assert_eq!(&net.params()[..12], &before.params()[..12]);
        // grown neurons start with zero bias
        assert_eq!(net.params()[18 + 4], 0.0);
        assert_eq!(net.params()[18 + 5], 0.0);

        net.resize_hidden(1, 2, &mut rng).unwrap();
        assert_eq!(net.signature().widths(), &[3, 6, 2, 2]);
        assert!(net.forward(&[0.1, 0.2, 0.3]).is_ok());
        assert!(net.resize_hidden(2, 3, &mut rng).is_err());
    }
}
