//! Configuration types for the simulation.
//!
//! Every field can be changed while the simulation runs, either by swapping a
//! whole [`SimConfig`] or through [`SimConfig::with_parameter`] with a dotted
//! path such as `"bacteria.energy.split_energy"`. Changes are validated up
//! front and never clamped.

use crate::error::{Error, Result};
use crate::types::{KindFilter, Species};
use serde::{Deserialize, Serialize};

/// Number of controller outputs every agent produces: throttle, steering.
pub const ACTION_WIDTH: usize = 2;

/// Smallest accepted spatial grid cell edge
pub const MIN_CELL_SIZE: f32 = 1.0;

/// Shape of the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateShape {
    Rectangular,
    Circular,
}

/// World (substrate) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub shape: SubstrateShape,
    /// Width of the rectangular substrate (also the bounding box of the circle)
    pub width: f32,
    /// Height of the rectangular substrate
    pub height: f32,
    /// Radius of the circular substrate, centred on the bounding box
    pub radius: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            shape: SubstrateShape::Rectangular,
            width: 1000.0,
            height: 700.0,
            radius: 400.0,
        }
    }
}

/// Step subdivision and per-step limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Number of equal sub-steps one `step(dt)` is divided into
    pub substeps: u32,
    /// Maximum number of agents purged in a single step
    pub max_deaths_per_step: usize,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            substeps: 1,
            max_deaths_per_step: 1,
        }
    }
}

/// Performance switches. None of them change results except
/// `sensor_frame_skip`, which trades sensor freshness for speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Use the uniform grid for neighbourhood queries (brute force otherwise)
    pub use_spatial_index: bool,
    /// Maintain the grid incrementally instead of rebuilding it every sub-step
    pub reuse_spatial_index: bool,
    /// Edge length of a grid cell, at least [`MIN_CELL_SIZE`]
    pub cell_size: f32,
    /// Honour each sensor's `frame_skip`
    pub sensor_frame_skip: bool,
    /// Group agents by controller signature and evaluate each group in one call
    pub batched_inference: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            use_spatial_index: true,
            reuse_spatial_index: true,
            cell_size: 36.0,
            sensor_frame_skip: true,
            batched_inference: true,
        }
    }
}

/// Food configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoodConfig {
    /// Food count seeded on reset and maintained by replenishment
    pub target: usize,
    pub min_radius: f32,
    pub max_radius: f32,
    /// Energy granted when eaten
    pub value: f32,
    /// Run the built-in replenishment controller
    pub replenish: bool,
    /// Seconds of simulated time to close a deficit of one food item
    pub replenish_interval: f32,
}

impl Default for FoodConfig {
    fn default() -> Self {
        Self {
            target: 50,
            min_radius: 4.5,
            max_radius: 5.0,
            value: 25.0,
            replenish: true,
            replenish_interval: 0.1,
        }
    }
}

/// Energy budget parameters, refreshed into every agent each step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub initial_energy: f32,
    pub energy_cap: f32,
    pub death_energy: f32,
    pub split_energy: f32,
    /// Energy per second spent standing still
    pub v0_cost: f32,
    /// Energy per second spent at or above `vmax_ref`
    pub vmax_cost: f32,
    /// Speed at which the cost saturates
    pub vmax_ref: f32,
    /// Energy destroyed by each reproduction event
    pub reproduction_cost: f32,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            initial_energy: 100.0,
            energy_cap: 1000.0,
            death_energy: 50.0,
            split_energy: 150.0,
            v0_cost: 0.01,
            vmax_cost: 5.0,
            vmax_ref: 300.0,
            reproduction_cost: 0.0,
        }
    }
}

/// Locomotion limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocomotionConfig {
    pub max_speed: f32,
    /// Radians per second at full steering
    pub max_turn: f32,
    /// Map throttle to [-1, 1] instead of [0, 1]
    pub allow_reverse: bool,
}

impl Default for LocomotionConfig {
    fn default() -> Self {
        Self {
            max_speed: 300.0,
            max_turn: std::f32::consts::PI,
            allow_reverse: false,
        }
    }
}

/// How each ray is encoded in the observation vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorEncoding {
    /// One value per ray: proximity of the nearest hit in [0, 1], 0 when nothing is seen
    Proximity,
    /// Two values per ray: normalized distance (1 when nothing is seen) and a kind code (0 when nothing is seen)
    DistanceKind,
    /// One proximity value per ray and per visible kind
    PerKind,
}

/// Retina configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub ray_count: usize,
    pub fov_degrees: f32,
    pub vision_radius: f32,
    pub see_food: bool,
    pub see_bacteria: bool,
    pub see_predators: bool,
    /// Steps between sensor refreshes; 0 senses every step
    pub frame_skip: u32,
    pub encoding: SensorEncoding,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ray_count: 18,
            fov_degrees: 180.0,
            vision_radius: 120.0,
            see_food: true,
            see_bacteria: false,
            see_predators: false,
            frame_skip: 0,
            encoding: SensorEncoding::DistanceKind,
        }
    }
}

impl SensorConfig {
    pub fn filter(&self) -> KindFilter {
        KindFilter {
            food: self.see_food,
            bacteria: self.see_bacteria,
            predators: self.see_predators,
        }
    }

    pub fn fields_per_ray(&self) -> usize {
        match self.encoding {
            SensorEncoding::Proximity => 1,
            SensorEncoding::DistanceKind => 2,
            SensorEncoding::PerKind => self.filter().count(),
        }
    }

    /// Width of the observation vector this configuration produces
    pub fn output_width(&self) -> usize {
        self.ray_count * self.fields_per_ray()
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        check(prefix, "ray_count", self.ray_count >= 1, "must be at least 1")?;
        check(
            prefix,
            "fov_degrees",
            self.fov_degrees.is_finite() && self.fov_degrees >= 1.0 && self.fov_degrees <= 360.0,
            "must be within [1, 360]",
        )?;
        check(
            prefix,
            "vision_radius",
            positive(self.vision_radius),
            "must be positive",
        )?;
        if self.encoding == SensorEncoding::PerKind {
            check(
                prefix,
                "encoding",
                self.filter().count() > 0,
                "per_kind encoding needs at least one visible kind",
            )?;
        }
        Ok(())
    }
}

/// Controller architecture for newly created agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Widths of the hidden layers; input and output widths are implied
    pub hidden_layers: Vec<usize>,
    /// Standard deviation scale of the initial weights
    pub init_std: f32,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![20, 20, 20, 20],
            init_std: 1.0,
        }
    }
}

/// Mutation applied to a child's controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Probability that each weight/bias is perturbed
    pub rate: f32,
    /// Standard deviation of the perturbation
    pub magnitude: f32,
    /// Probability of a hidden-layer resize per reproduction
    pub structural_rate: f32,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            rate: 0.05,
            magnitude: 0.08,
            structural_rate: 0.0,
        }
    }
}

/// Reproduction placement and the soft population cap
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReproductionConfig {
    /// Child is placed this many parent radii away from the parent's centre
    pub offset_fraction: f32,
    /// Maximum deviation (radians) of the child's heading from the parent's
    pub heading_jitter: f32,
    /// Fraction of `max_count` above which reproduction becomes probabilistic
    pub soft_cap_fraction: f32,
}

impl Default for ReproductionConfig {
    fn default() -> Self {
        Self {
            offset_fraction: 0.5,
            heading_jitter: 0.5,
            soft_cap_fraction: 0.8,
        }
    }
}

/// Predator feeding rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredationConfig {
    pub flat_gain: f32,
    /// Fraction of the prey's energy transferred to the predator
    pub efficiency: f32,
    /// Overlapping sub-steps needed before the prey dies
    pub hits_to_kill: u32,
}

impl Default for PredationConfig {
    fn default() -> Self {
        Self {
            flat_gain: 0.0,
            efficiency: 0.7,
            hits_to_kill: 1,
        }
    }
}

/// Everything specific to one species
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesConfig {
    pub enabled: bool,
    pub initial_count: usize,
    pub min_radius: f32,
    pub max_radius: f32,
    /// Predators stop eating this species once it falls to this count
    pub min_count: usize,
    /// Hard ceiling for reproduction
    pub max_count: usize,
    /// Seconds of simulated time before an agent dies of old age
    pub max_age: Option<f32>,
    pub energy: EnergyConfig,
    pub locomotion: LocomotionConfig,
    pub sensor: SensorConfig,
    pub brain: BrainConfig,
    pub mutation: MutationConfig,
    pub reproduction: ReproductionConfig,
    pub predation: PredationConfig,
}

impl Default for SpeciesConfig {
    fn default() -> Self {
        Self::bacteria()
    }
}

impl SpeciesConfig {
    pub fn bacteria() -> Self {
        Self {
            enabled: true,
            initial_count: 150,
            min_radius: 6.0,
            max_radius: 12.0,
            min_count: 10,
            max_count: 300,
            max_age: None,
            energy: EnergyConfig::default(),
            locomotion: LocomotionConfig::default(),
            sensor: SensorConfig::default(),
            brain: BrainConfig::default(),
            mutation: MutationConfig::default(),
            reproduction: ReproductionConfig::default(),
            predation: PredationConfig::default(),
        }
    }

    pub fn predator() -> Self {
        Self {
            enabled: false,
            initial_count: 0,
            min_radius: 10.0,
            max_radius: 18.0,
            min_count: 0,
            max_count: 100,
            sensor: SensorConfig {
                see_bacteria: true,
                ..SensorConfig::default()
            },
            brain: BrainConfig {
                hidden_layers: vec![16, 8],
                init_std: 1.0,
            },
            ..Self::bacteria()
        }
    }

    /// Full layer-width list for a fresh controller of this species
    pub fn layer_widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.brain.hidden_layers.len() + 2);
        widths.push(self.sensor.output_width());
        widths.extend(self.brain.hidden_layers.iter().copied());
        widths.push(ACTION_WIDTH);
        widths
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        check(prefix, "min_radius", positive(self.min_radius), "must be positive")?;
        check(
            prefix,
            "max_radius",
            self.max_radius.is_finite() && self.max_radius >= self.min_radius,
            "must be >= min_radius",
        )?;
        check(
            prefix,
            "min_count",
            self.min_count <= self.max_count,
            "must not exceed max_count",
        )?;
        if let Some(max_age) = self.max_age {
            check(prefix, "max_age", positive(max_age), "must be positive")?;
        }

        let e = &self.energy;
        let energy = format!("{prefix}.energy");
        check(&energy, "energy_cap", positive(e.energy_cap), "must be positive")?;
        check(
            &energy,
            "death_energy",
            e.death_energy.is_finite() && e.death_energy >= 0.0,
            "must be non-negative",
        )?;
        check(
            &energy,
            "split_energy",
            e.split_energy.is_finite()
                && e.split_energy > e.death_energy
                && e.split_energy <= e.energy_cap,
            "must lie in (death_energy, energy_cap]",
        )?;
        check(
            &energy,
            "initial_energy",
            e.initial_energy.is_finite()
                && e.initial_energy >= 0.0
                && e.initial_energy <= e.energy_cap,
            "must lie in [0, energy_cap]",
        )?;
        check(&energy, "v0_cost", non_negative(e.v0_cost), "must be non-negative")?;
        check(&energy, "vmax_cost", non_negative(e.vmax_cost), "must be non-negative")?;
        check(&energy, "vmax_ref", positive(e.vmax_ref), "must be positive")?;
        check(
            &energy,
            "reproduction_cost",
            non_negative(e.reproduction_cost),
            "must be non-negative",
        )?;

        let loco = format!("{prefix}.locomotion");
        check(&loco, "max_speed", non_negative(self.locomotion.max_speed), "must be non-negative")?;
        check(&loco, "max_turn", non_negative(self.locomotion.max_turn), "must be non-negative")?;

        self.sensor.validate(&format!("{prefix}.sensor"))?;

        let brain = format!("{prefix}.brain");
        check(
            &brain,
            "hidden_layers",
            self.brain.hidden_layers.iter().all(|&w| w >= 1),
            "hidden layer widths must be at least 1",
        )?;
        check(&brain, "init_std", non_negative(self.brain.init_std), "must be non-negative")?;

        let mutation = format!("{prefix}.mutation");
        check(&mutation, "rate", unit(self.mutation.rate), "must be within [0, 1]")?;
        check(&mutation, "magnitude", non_negative(self.mutation.magnitude), "must be non-negative")?;
        check(
            &mutation,
            "structural_rate",
            unit(self.mutation.structural_rate),
            "must be within [0, 1]",
        )?;

        let repro = format!("{prefix}.reproduction");
        check(
            &repro,
            "offset_fraction",
            non_negative(self.reproduction.offset_fraction),
            "must be non-negative",
        )?;
        check(
            &repro,
            "heading_jitter",
            non_negative(self.reproduction.heading_jitter),
            "must be non-negative",
        )?;
        check(
            &repro,
            "soft_cap_fraction",
            unit(self.reproduction.soft_cap_fraction),
            "must be within [0, 1]",
        )?;

        let predation = format!("{prefix}.predation");
        check(&predation, "flat_gain", non_negative(self.predation.flat_gain), "must be non-negative")?;
        check(&predation, "efficiency", unit(self.predation.efficiency), "must be within [0, 1]")?;
        check(&predation, "hits_to_kill", self.predation.hits_to_kill >= 1, "must be at least 1")?;
        Ok(())
    }
}

/// Bounded command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub queue_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// What published snapshots carry besides positions and energy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub include_observations: bool,
    pub include_activations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Steps between structured population summaries; 0 disables them
    pub metrics_interval: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            metrics_interval: 600,
        }
    }
}

/// Complete simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub world: WorldConfig,
    pub step: StepConfig,
    pub performance: PerformanceConfig,
    pub food: FoodConfig,
    pub bacteria: SpeciesConfig,
    pub predator: SpeciesConfig,
    pub commands: CommandConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            world: WorldConfig::default(),
            step: StepConfig::default(),
            performance: PerformanceConfig::default(),
            food: FoodConfig::default(),
            bacteria: SpeciesConfig::bacteria(),
            predator: SpeciesConfig::predator(),
            commands: CommandConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn species(&self, species: Species) -> &SpeciesConfig {
        match species {
            Species::Bacteria => &self.bacteria,
            Species::Predator => &self.predator,
        }
    }

    pub fn species_mut(&mut self, species: Species) -> &mut SpeciesConfig {
        match species {
            Species::Bacteria => &mut self.bacteria,
            Species::Predator => &mut self.predator,
        }
    }

    /// Check every range and cross-field constraint
    pub fn validate(&self) -> Result<()> {
        let w = &self.world;
        check("world", "width", positive(w.width), "must be positive")?;
        check("world", "height", positive(w.height), "must be positive")?;
        if w.shape == SubstrateShape::Circular {
            check("world", "radius", positive(w.radius), "must be positive")?;
        }

        check("step", "substeps", self.step.substeps >= 1, "must be at least 1")?;

        check(
            "performance",
            "cell_size",
            self.performance.cell_size.is_finite() && self.performance.cell_size >= MIN_CELL_SIZE,
            "must be at least 1",
        )?;

        let f = &self.food;
        check("food", "min_radius", positive(f.min_radius), "must be positive")?;
        check(
            "food",
            "max_radius",
            f.max_radius.is_finite() && f.max_radius >= f.min_radius,
            "must be >= min_radius",
        )?;
        check("food", "value", non_negative(f.value), "must be non-negative")?;
        check(
            "food",
            "replenish_interval",
            positive(f.replenish_interval),
            "must be positive",
        )?;

        check(
            "commands",
            "queue_capacity",
            self.commands.queue_capacity >= 1,
            "must be at least 1",
        )?;

        self.bacteria.validate("bacteria")?;
        self.predator.validate("predator")?;
        Ok(())
    }

    /// Return a copy with one field replaced, addressed by dotted path.
    ///
    /// The value must deserialize into the field's type and the resulting
    /// configuration must validate; otherwise `self` is left as it was and a
    /// descriptive error is returned.
    pub fn with_parameter(&self, path: &str, value: serde_json::Value) -> Result<SimConfig> {
        if path.is_empty() {
            return Err(Error::invalid_parameter(path, "empty parameter path"));
        }
        let mut root = serde_json::to_value(self)?;
        let pointer = format!("/{}", path.replace('.', "/"));
        let slot = root
            .pointer_mut(&pointer)
            .ok_or_else(|| Error::invalid_parameter(path, "unknown parameter"))?;
        *slot = value;

        let updated: SimConfig = serde_json::from_value(root)
            .map_err(|e| Error::invalid_parameter(path, e.to_string()))?;
        updated.validate()?;
        Ok(updated)
    }
}

fn check(prefix: &str, field: &str, ok: bool, reason: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_parameter(format!("{prefix}.{field}"), reason))
    }
}

fn positive(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

fn non_negative(v: f32) -> bool {
    v.is_finite() && v >= 0.0
}

fn unit(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.bacteria.enabled);
        assert!(!config.predator.enabled);
        assert_eq!(config.step.max_deaths_per_step, 1);
    }

    #[test]
    fn test_layer_widths_follow_sensor() {
        let config = SimConfig::default();
        let widths = config.bacteria.layer_widths();
        assert_eq!(widths.first(), Some(&36)); // 18 rays x (distance, kind)
        assert_eq!(widths.last(), Some(&ACTION_WIDTH));
        assert_eq!(widths.len(), 6);
    }

    #[test]
    fn test_sensor_width_by_encoding() {
        let mut sensor = SensorConfig::default();
        sensor.encoding = SensorEncoding::Proximity;
        assert_eq!(sensor.output_width(), 18);
        sensor.encoding = SensorEncoding::PerKind;
        sensor.see_predators = true;
        assert_eq!(sensor.output_width(), 36);
    }

    #[test]
    fn test_with_parameter_sets_nested_field() {
        let config = SimConfig::default();
        let updated = config
            .with_parameter("bacteria.energy.split_energy", json!(200.0))
            .unwrap();
        assert_eq!(updated.bacteria.energy.split_energy, 200.0);
        // original untouched
        assert_eq!(config.bacteria.energy.split_energy, 150.0);
    }

    #[test]
    fn test_with_parameter_rejects_unknown_path() {
        let config = SimConfig::default();
        let err = config
            .with_parameter("bacteria.energy.nonexistent", json!(1.0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_with_parameter_rejects_out_of_range() {
        let config = SimConfig::default();
        let err = config
            .with_parameter("bacteria.energy.split_energy", json!(10.0))
            .unwrap_err();
        match err {
            Error::InvalidParameter { path, .. } => {
                assert_eq!(path, "bacteria.energy.split_energy")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cell_size_has_a_floor() {
        let config = SimConfig::default();
        let err = config
            .with_parameter("performance.cell_size", json!(1e-9))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref path, .. } if path == "performance.cell_size"));
        assert!(config
            .with_parameter("performance.cell_size", json!(MIN_CELL_SIZE))
            .is_ok());
    }

    #[test]
    fn test_with_parameter_rejects_wrong_type() {
        let config = SimConfig::default();
        assert!(config
            .with_parameter("performance.batched_inference", json!("yes"))
            .is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SimConfig =
            serde_json::from_str(r#"{"seed": 7, "food": {"target": 3}}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.food.target, 3);
        assert_eq!(config.food.value, FoodConfig::default().value);
        assert_eq!(config.predator, SpeciesConfig::predator());
    }
}
