use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::models::{
    model_base::{ActionSpaceKind, ActionSpec, ObservationSpec},
    ppo::default_ppo::SimpleActorCritic,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default = "default_cpu")]
    pub device: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_n_env")]
    pub n_env: usize,
    pub model: ModelConfig,
    #[serde(default)]
    pub network: SimpleActorCritic,
}

/// Loss weights and clip ranges are read at every training call, so they can be annealed between calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub clip_epsilon: f64,
    pub clip_value_loss: f64,
    pub value_loss_weight: f64,
    pub entropy_loss_weight: f64,
    pub learning_rate: f64,
    /// max gradient norm, None disables clipping
    pub grad_clip: Option<f64>,
    pub gamma: f64,
    pub lambda: f64,
    pub steps_per_rollout: i64,
    pub updates: i64,
    pub optim_epochs: i64,
    pub batch_size: i64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            clip_epsilon: 0.2,
            clip_value_loss: 0.2,
            value_loss_weight: 0.5,
            entropy_loss_weight: 0.01,
            learning_rate: 3e-4,
            grad_clip: Some(0.5),
            gamma: 0.99,
            lambda: 0.95,
            steps_per_rollout: 64,
            updates: 200,
            optim_epochs: 4,
            batch_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    Ppo,
    SupervisedLearning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_mode")]
    pub mode: ModelMode,
    pub action_space: ActionSpaceKind,
    pub action_sizes: Vec<i64>,
    /// 0 means the model has no vector observation
    #[serde(default)]
    pub vector_observation_size: i64,
    /// [height, width, channels] per visual observation
    #[serde(default)]
    pub visual_observations: Vec<[i64; 3]>,
    #[serde(default)]
    pub use_input_normalization: bool,
    #[serde(default = "default_true")]
    pub training_enabled: bool,
}

fn default_cpu() -> String {
    "cpu".to_string()
}

fn default_n_env() -> usize {
    16
}

fn default_mode() -> ModelMode {
    ModelMode::Ppo
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    pub fn observation_spec(&self) -> ObservationSpec {
        ObservationSpec {
            vector_size: (self.vector_observation_size > 0).then_some(self.vector_observation_size),
            visual_shapes: self.visual_observations.clone(),
        }
    }

    pub fn action_spec(&self) -> ActionSpec {
        ActionSpec { kind: self.action_space, sizes: self.action_sizes.clone() }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.action_sizes.is_empty() {
            bail!("action_sizes must name at least one branch");
        }
        if self.action_sizes.iter().any(|size| *size <= 0) {
            bail!("action sizes must be positive, got {:?}", self.action_sizes);
        }
        if self.action_space == ActionSpaceKind::Continuous && self.action_sizes.len() != 1 {
            bail!("continuous action spaces have a single branch, got {:?}", self.action_sizes);
        }
        if self.vector_observation_size < 0 {
            bail!("vector_observation_size can not be negative");
        }
        if self.vector_observation_size == 0 && self.visual_observations.is_empty() {
            bail!("the model needs a vector observation or at least one visual observation");
        }
        Ok(())
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.clip_epsilon < 0. || self.clip_value_loss < 0. {
            bail!("clip ranges must not be negative");
        }
        if self.learning_rate <= 0. {
            bail!("learning rate must be positive");
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.lambda) {
            bail!("gamma and lambda must be in [0, 1]");
        }
        if self.batch_size <= 0 || self.optim_epochs <= 0 || self.steps_per_rollout <= 0 {
            bail!("batch size, epochs and rollout length must be positive");
        }
        Ok(())
    }
}

impl Configuration {
    pub fn load_configuration(config_file: &Path) -> anyhow::Result<Configuration> {
        let mut file = File::open(config_file).with_context(|| format!("Error opening file {}", config_file.display()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Error reading contents of {}", config_file.display()))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Configuration> {
        let config: Configuration = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.model.validate()?;
        self.hyperparameters.validate()?;
        if self.model.mode == ModelMode::Ppo
            && self.model.action_space == ActionSpaceKind::Continuous
            && !self.network.learn_log_variance
        {
            bail!("continuous PPO needs learn_log_variance, the policy has to be stochastic");
        }
        Ok(())
    }

    pub fn device(&self) -> tch::Device {
        if self.device.to_lowercase() == "cuda" {
            tch::Device::cuda_if_available()
        } else {
            tch::Device::Cpu
        }
    }
}
