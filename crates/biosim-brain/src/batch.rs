//! Grouped inference for controllers that share an architecture.
//!
//! Agents are grouped by [`Signature`]; each group is evaluated as one
//! stacked computation. Stacking is a layout change only: row `b` of every
//! tensor holds agent `b`'s own weights and inputs, so the result is the same
//! as calling [`NeuralNet::forward`] on each agent.

use crate::network::{NeuralNet, Signature};
use biosim_core::{Error, Result};
use ndarray::{Array2, Array3, Axis};
use std::collections::BTreeMap;

/// Group keys by controller signature. Groups come out in signature order and
/// keys keep their input order within a group.
pub fn group_by_signature<'a, K, I>(items: I) -> BTreeMap<Signature, Vec<K>>
where
    I: IntoIterator<Item = (K, &'a NeuralNet)>,
{
    let mut groups: BTreeMap<Signature, Vec<K>> = BTreeMap::new();
    for (key, net) in items {
        groups.entry(net.signature().clone()).or_default().push(key);
    }
    groups
}

/// Evaluate `nets[b]` on `inputs[b]` for every `b` in one stacked pass.
///
/// All networks must share one signature and every input row must match its
/// input width.
pub fn forward_batch(nets: &[&NeuralNet], inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
    if nets.len() != inputs.len() {
        return Err(Error::Architecture(format!(
            "batch has {} networks but {} input rows",
            nets.len(),
            inputs.len()
        )));
    }
    let Some(first) = nets.first() else {
        return Ok(Vec::new());
    };
    let signature = first.signature();
    if let Some(odd) = nets.iter().find(|n| n.signature() != signature) {
        return Err(Error::Architecture(format!(
            "mixed signatures in one batch: {} and {}",
            signature,
            odd.signature()
        )));
    }
    let batch = nets.len();
    let n_in = signature.input_width();
    if let Some(row) = inputs.iter().find(|row| row.len() != n_in) {
        return Err(Error::Architecture(format!(
            "input width {} does not match network input {}",
            row.len(),
            n_in
        )));
    }

    let mut activations = Array2::from_shape_vec(
        (batch, n_in),
        inputs.iter().flat_map(|row| row.iter().copied()).collect(),
    )
    .map_err(shape_error)?;

    let widths = signature.widths();
    let offsets = first.layer_offsets();
    let last = signature.layer_count() - 1;
    for (l, &offset) in offsets.iter().enumerate() {
        let (fan_in, fan_out) = (widths[l], widths[l + 1]);
        let w_len = fan_in * fan_out;

        // [batch, out, in] and [batch, out], one slice per agent
        let weights = Array3::from_shape_vec(
            (batch, fan_out, fan_in),
            nets.iter()
                .flat_map(|n| n.params()[offset..offset + w_len].iter().copied())
                .collect(),
        )
        .map_err(shape_error)?;
        let biases = Array2::from_shape_vec(
            (batch, fan_out),
            nets.iter()
                .flat_map(|n| n.params()[offset + w_len..offset + w_len + fan_out].iter().copied())
                .collect(),
        )
        .map_err(shape_error)?;

        let mut next = Array2::<f32>::zeros((batch, fan_out));
        for (b, mut row) in next.axis_iter_mut(Axis(0)).enumerate() {
            let y = weights.index_axis(Axis(0), b).dot(&activations.row(b)) + biases.row(b);
            row.assign(&y);
        }
        if l != last {
            next.mapv_inplace(f32::tanh);
        }
        activations = next;
    }

    Ok(activations.outer_iter().map(|row| row.to_vec()).collect())
}

fn shape_error(err: ndarray::ShapeError) -> Error {
    Error::Architecture(format!("batch tensor shape: {}", err))
}
