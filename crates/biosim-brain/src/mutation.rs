//! Mutation operators for controllers.

use crate::network::NeuralNet;
use biosim_core::{MutationConfig, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::trace;

/// What a single mutation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReport {
    /// Number of weights/biases perturbed
    pub perturbed: usize,
    /// `(hidden layer, old width, new width)` when the architecture changed
    pub resized: Option<(usize, usize, usize)>,
}

pub struct Mutator {
    config: MutationConfig,
}

impl Mutator {
    pub fn new(config: MutationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    /// Clone `parent` and mutate the copy
    pub fn offspring<R: Rng + ?Sized>(&self, parent: &NeuralNet, rng: &mut R) -> Result<NeuralNet> {
        let mut child = parent.clone();
        self.mutate(&mut child, rng)?;
        Ok(child)
    }

    /// Mutate a controller in place.
    ///
    /// Every parameter is perturbed with probability `rate` by N(0, magnitude).
    /// With probability `structural_rate` one hidden layer then gains or loses
    /// one or two neurons; input and output widths never change.
    pub fn mutate<R: Rng + ?Sized>(&self, net: &mut NeuralNet, rng: &mut R) -> Result<MutationReport> {
        let mut report = MutationReport::default();

        if self.config.rate > 0.0 && self.config.magnitude > 0.0 {
            // magnitude is validated non-negative and finite
            if let Ok(noise) = Normal::new(0.0f32, self.config.magnitude) {
                for p in net.params_mut() {
                    if rng.gen::<f32>() < self.config.rate {
                        *p += noise.sample(rng);
                        report.perturbed += 1;
                    }
                }
            }
        }

        if self.config.structural_rate > 0.0 && rng.gen::<f32>() < self.config.structural_rate {
            report.resized = self.mutate_structure(net, rng)?;
        }

        Ok(report)
    }

    fn mutate_structure<R: Rng + ?Sized>(
        &self,
        net: &mut NeuralNet,
        rng: &mut R,
    ) -> Result<Option<(usize, usize, usize)>> {
        let hidden = net.signature().hidden().to_vec();
        if hidden.is_empty() {
            return Ok(None);
        }
        let layer = rng.gen_range(0..hidden.len());
        let old = hidden[layer];
        let delta = [-2i64, -1, 1, 2][rng.gen_range(0..4)];
        let new = (old as i64 + delta).clamp(1, (old * 2) as i64) as usize;
        if new == old {
            return Ok(None);
        }
        net.resize_hidden(layer, new, rng)?;
        trace!(layer, old, new, "hidden layer resized");
        Ok(Some((layer, old, new)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Signature;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn net(rng: &mut ChaCha8Rng) -> NeuralNet {
        NeuralNet::random(Signature::new(vec![6, 5, 2]).unwrap(), 1.0, rng)
    }

    #[test]
    fn test_zero_rate_is_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let parent = net(&mut rng);
        let mutator = Mutator::new(MutationConfig {
            rate: 0.0,
            magnitude: 1.0,
            structural_rate: 0.0,
        });
        let child = mutator.offspring(&parent, &mut rng).unwrap();
        assert_eq!(child, parent);
    }

    #[test]
    fn test_full_rate_perturbs_everything() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut child = net(&mut rng);
        let parent = child.clone();
        let mutator = Mutator::new(MutationConfig {
            rate: 1.0,
            magnitude: 0.5,
            structural_rate: 0.0,
        });
        let report = mutator.mutate(&mut child, &mut rng).unwrap();
        assert_eq!(report.perturbed, parent.params().len());
        assert_eq!(child.signature(), parent.signature());
        assert_ne!(child.params(), parent.params());
    }

    #[test]
    fn test_structural_mutation_keeps_io_widths() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mutator = Mutator::new(MutationConfig {
            rate: 0.0,
            magnitude: 0.0,
            structural_rate: 1.0,
        });
        let mut child = net(&mut rng);
        for _ in 0..20 {
            mutator.mutate(&mut child, &mut rng).unwrap();
            assert_eq!(child.input_width(), 6);
            assert_eq!(child.output_width(), 2);
            assert!(child.signature().hidden()[0] >= 1);
            assert_eq!(child.params().len(), child.signature().param_count());
        }
    }

    #[test]
    fn test_structural_mutation_without_hidden_layers() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut child = NeuralNet::random(Signature::new(vec![3, 2]).unwrap(), 1.0, &mut rng);
        let mutator = Mutator::new(MutationConfig {
            rate: 0.0,
            magnitude: 0.0,
            structural_rate: 1.0,
        });
        let report = mutator.mutate(&mut child, &mut rng).unwrap();
        assert_eq!(report.resized, None);
    }
}
