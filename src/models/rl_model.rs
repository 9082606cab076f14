use anyhow::bail;
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info, trace, warn};

use crate::{
    algorithms::{
        ppo::ppo_learn::{PPOLearner, PPOTerms, TrainStats},
        sl::sl_learn::{continuous_imitation_loss, discrete_imitation_loss, SLLearner},
    },
    config::{Configuration, Hyperparameters, ModelConfig, ModelMode},
    models::{
        distributions::{branch_log_probs_and_entropy, masked_branches, DiagGaussian, MaskedCategorical},
        model_base::{ActionSpaceKind, ActionSpec, ActorCriticNetwork, NetworkBuilder, NetworkOutput, Observation, ObservationSpec, PolicyHead},
        normalizer::RunningNormalizer,
    },
    tch_utils::{dbg_funcs::tensor_summary, sampling::Sampler},
};

/// One PPO training batch. All tensors share the batch dimension.
pub struct PPOBatch<'a> {
    pub observation: Observation<'a>,
    /// [batch, dims] for continuous, [batch, branches] of (float encoded) indices for discrete
    pub actions: &'a Tensor,
    /// log probs recorded when the actions were taken, same shape as `actions`
    pub old_log_probs: &'a Tensor,
    pub target_values: &'a Tensor,
    pub old_values: &'a Tensor,
    pub advantages: &'a Tensor,
    pub masks: Option<&'a [Tensor]>,
}

/// State shared by both modes: parameters, network, normalizer, and the action sampler.
struct PolicyCore {
    vs: nn::VarStore,
    network: Box<dyn ActorCriticNetwork>,
    normalizer: Option<RunningNormalizer>,
    observation_spec: ObservationSpec,
    action_spec: ActionSpec,
    sampler: Sampler,
}

impl PolicyCore {
    fn new(model: &ModelConfig, builder: &dyn NetworkBuilder, device: Device, sampler: Sampler) -> Self {
        let observation_spec = model.observation_spec();
        let action_spec = model.action_spec();
        let normalizer = match (model.use_input_normalization, observation_spec.vector_size) {
            (true, Some(size)) => Some(RunningNormalizer::new(size, device)),
            (true, None) => {
                warn!("use_input_normalization is turned off because the model has no vector observation");
                None
            }
            (false, _) => None,
        };
        let vs = nn::VarStore::new(device);
        let network = builder.build(&vs.root(), &observation_spec, &action_spec);
        Self { vs, network, normalizer, observation_spec, action_spec, sampler }
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn check_observation(&self, obs: &Observation) {
        if self.observation_spec.has_vector() {
            assert!(obs.vector.is_some(), "Must Have vector observation inputs!");
        }
        assert_eq!(
            obs.visual.len(),
            self.observation_spec.visual_shapes.len(),
            "Must Have visual observation inputs! expected {}, got {}",
            self.observation_spec.visual_shapes.len(),
            obs.visual.len()
        );
    }

    /// network forward on normalized vector obs, using the statistics as they are before this call
    fn forward(&self, obs: &Observation) -> NetworkOutput {
        self.check_observation(obs);
        let vector_obs = obs.vector.filter(|_| self.observation_spec.has_vector()).map(|vec_obs| match &self.normalizer {
            Some(norm) => norm.normalize(vec_obs),
            None => vec_obs.shallow_clone(),
        });
        self.network.forward(vector_obs.as_ref(), obs.visual)
    }

    /// true when a forward pass on a single zero observation yields a log variance
    fn emits_log_variance(&self) -> bool {
        let device = self.device();
        let vector_obs = self.observation_spec.vector_size.map(|size| Tensor::zeros([1, size], (Kind::Float, device)));
        let visual_obs: Vec<Tensor> = self
            .observation_spec
            .visual_shapes
            .iter()
            .map(|&[height, width, channels]| Tensor::zeros([1, height, width, channels], (Kind::Float, device)))
            .collect();
        let output = tch::no_grad(|| self.network.forward(vector_obs.as_ref(), &visual_obs));
        matches!(output.policy, PolicyHead::Continuous { log_variance: Some(_), .. })
    }

    fn masks_or_ones(&self, masks: Option<&[Tensor]>, batch_size: i64) -> Vec<Tensor> {
        match masks {
            Some(masks) => {
                assert_eq!(masks.len(), self.action_spec.num_branches(), "one action mask is needed per discrete branch");
                masks.iter().map(|mask| mask.to_device(self.device()).to_kind(Kind::Float)).collect()
            }
            None => self
                .action_spec
                .sizes
                .iter()
                .map(|&size| Tensor::ones([batch_size, size], (Kind::Float, self.device())))
                .collect(),
        }
    }

    fn discrete_dists(&self, logits: &[Tensor], masks: Option<&[Tensor]>, batch_size: i64) -> Vec<MaskedCategorical> {
        masked_branches(logits, &self.masks_or_ones(masks, batch_size))
    }

    /// one index per branch, [batch, branches] Int64
    fn sample_discrete(&mut self, dists: &[MaskedCategorical]) -> Tensor {
        let actions: Vec<Tensor> = dists.iter().map(|dist| dist.sample(&mut self.sampler)).collect();
        Tensor::cat(&actions, 1)
    }

    fn update_normalizer(&mut self, obs: &Observation) {
        if let (Some(norm), Some(vec_obs)) = (self.normalizer.as_mut(), obs.vector) {
            norm.update(vec_obs);
        }
    }
}

fn require_log_variance(log_variance: Option<Tensor>) -> Tensor {
    match log_variance {
        Some(log_var) => log_var,
        None => panic!("continuous PPO needs a network with a log variance head"),
    }
}

/// Actor-critic model trained with PPO.
pub struct PpoModel {
    core: PolicyCore,
    hyperparameters: Hyperparameters,
    learner: Option<PPOLearner>,
}

impl PpoModel {
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    /// clip ranges and loss weights are read on every `train_batch`, so they can be scheduled
    pub fn hyperparameters_mut(&mut self) -> &mut Hyperparameters {
        &mut self.hyperparameters
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.hyperparameters.learning_rate = learning_rate;
        if let Some(learner) = self.learner.as_mut() {
            learner.set_learning_rate(learning_rate);
        }
    }

    pub fn normalizer(&self) -> Option<&RunningNormalizer> {
        self.core.normalizer.as_ref()
    }

    /// for restoring saved statistics with `RunningNormalizer::load_state`
    pub fn normalizer_mut(&mut self) -> Option<&mut RunningNormalizer> {
        self.core.normalizer.as_mut()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.core.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.core.vs
    }

    pub fn action_spec(&self) -> &ActionSpec {
        &self.core.action_spec
    }

    pub fn training_enabled(&self) -> bool {
        self.learner.is_some()
    }

    /// state values, [batch]
    pub fn evaluate_value(&self, obs: Observation) -> Tensor {
        tch::no_grad(|| self.core.forward(&obs).value.view([-1]))
    }

    /// Samples actions and returns (actions, log probs of those actions).
    /// Continuous: both [batch, dims]. Discrete: both [batch, branches], actions are float encoded indices.
    /// Folds the vector observations into the running normalizer after the actions are computed.
    pub fn evaluate_action(&mut self, obs: Observation, masks: Option<&[Tensor]>) -> (Tensor, Tensor) {
        let (actions, log_probs) = tch::no_grad(|| {
            let output = self.core.forward(&obs);
            match output.policy {
                PolicyHead::Continuous { mean, log_variance } => {
                    let dist = DiagGaussian::new(mean, require_log_variance(log_variance));
                    let actions = dist.sample(&mut self.core.sampler);
                    let log_probs = dist.log_prob(&actions);
                    (actions, log_probs)
                }
                PolicyHead::Discrete(logits) => {
                    let dists = self.core.discrete_dists(&logits, masks, obs.batch_size());
                    let actions = self.core.sample_discrete(&dists);
                    let (log_probs, _) = branch_log_probs_and_entropy(&dists, &actions);
                    (actions.to_kind(Kind::Float), log_probs)
                }
            }
        });
        self.core.update_normalizer(&obs);
        trace!("{}", tensor_summary("actions", &actions));
        (actions, log_probs)
    }

    /// Log probs of the given actions under the current policy. Leaves the normalizer untouched.
    pub fn evaluate_probability(&self, obs: Observation, actions: &Tensor, masks: Option<&[Tensor]>) -> Tensor {
        tch::no_grad(|| {
            let output = self.core.forward(&obs);
            match output.policy {
                PolicyHead::Continuous { mean, log_variance } => {
                    DiagGaussian::new(mean, require_log_variance(log_variance)).log_prob(actions)
                }
                PolicyHead::Discrete(logits) => {
                    let dists = self.core.discrete_dists(&logits, masks, obs.batch_size());
                    branch_log_probs_and_entropy(&dists, &actions.round()).0
                }
            }
        })
    }

    /// One optimizer step on the PPO loss of `batch`.
    pub fn train_batch(&mut self, batch: PPOBatch) -> TrainStats {
        let learner = match self.learner.as_mut() {
            Some(learner) => learner,
            None => panic!("The model needs to be initialized with training enabled to use train_batch()"),
        };
        let output = self.core.forward(&batch.observation);
        let (new_log_probs, entropy) = match output.policy {
            PolicyHead::Continuous { mean, log_variance } => {
                let dist = DiagGaussian::new(mean, require_log_variance(log_variance));
                (dist.log_prob(batch.actions), dist.entropy())
            }
            PolicyHead::Discrete(logits) => {
                let dists = self.core.discrete_dists(&logits, batch.masks, batch.observation.batch_size());
                // actions come back from the environment as floats
                branch_log_probs_and_entropy(&dists, &batch.actions.round())
            }
        };

        let stats = learner.step(
            &self.hyperparameters,
            PPOTerms {
                new_log_probs: &new_log_probs,
                old_log_probs: batch.old_log_probs,
                new_values: &output.value,
                old_values: batch.old_values,
                target_values: batch.target_values,
                advantages: batch.advantages,
                entropy: &entropy,
            },
        );
        debug!(
            "ppo batch: loss {:.5}, value loss {:.5}, policy loss {:.5}, entropy {:.5}, clip frac {:.3}, kl {:.5}",
            stats.total_loss, stats.value_loss, stats.policy_loss, stats.entropy, stats.clip_fraction, stats.approx_kl
        );
        stats
    }
}

/// The same network trained to imitate demonstrated actions.
pub struct SupervisedModel {
    core: PolicyCore,
    learner: Option<SLLearner>,
}

impl SupervisedModel {
    pub fn normalizer(&self) -> Option<&RunningNormalizer> {
        self.core.normalizer.as_ref()
    }

    /// for restoring saved statistics with `RunningNormalizer::load_state`
    pub fn normalizer_mut(&mut self) -> Option<&mut RunningNormalizer> {
        self.core.normalizer.as_mut()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.core.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.core.vs
    }

    pub fn action_spec(&self) -> &ActionSpec {
        &self.core.action_spec
    }

    pub fn training_enabled(&self) -> bool {
        self.learner.is_some()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        if let Some(learner) = self.learner.as_mut() {
            learner.set_learning_rate(learning_rate);
        }
    }

    /// Continuous: (mean action, variance if the network learns one). Discrete: (sampled masked actions, None).
    pub fn evaluate_action(&mut self, obs: Observation, masks: Option<&[Tensor]>) -> (Tensor, Option<Tensor>) {
        let result = tch::no_grad(|| {
            let output = self.core.forward(&obs);
            match output.policy {
                PolicyHead::Continuous { mean, log_variance } => (mean, log_variance.map(|log_var| log_var.exp())),
                PolicyHead::Discrete(logits) => {
                    let dists = self.core.discrete_dists(&logits, masks, obs.batch_size());
                    (self.core.sample_discrete(&dists).to_kind(Kind::Float), None)
                }
            }
        });
        self.core.update_normalizer(&obs);
        result
    }

    /// One optimizer step toward the demonstrated `actions`, returns the loss before the step.
    pub fn train_batch(&mut self, obs: Observation, actions: &Tensor, masks: Option<&[Tensor]>) -> f64 {
        let learner = match self.learner.as_mut() {
            Some(learner) => learner,
            None => panic!("The model needs to be initialized with training enabled to use train_batch()"),
        };
        let output = self.core.forward(&obs);
        let loss = match output.policy {
            PolicyHead::Continuous { mean, log_variance } => {
                continuous_imitation_loss(actions, &mean, log_variance.as_ref())
            }
            PolicyHead::Discrete(logits) => {
                let dists = self.core.discrete_dists(&logits, masks, obs.batch_size());
                discrete_imitation_loss(&dists, &actions.round())
            }
        };
        let loss = learner.step(&loss);
        debug!("supervised batch: loss {:.5}", loss);
        loss
    }
}

/// A model fixed to one training mode at initialization. Each variant only exposes the calls valid in its mode.
pub enum RLModel {
    Ppo(PpoModel),
    SupervisedLearning(SupervisedModel),
}

impl RLModel {
    pub fn initialize(
        model: &ModelConfig,
        hyperparameters: &Hyperparameters,
        builder: &dyn NetworkBuilder,
        device: Device,
        sampler: Sampler,
    ) -> anyhow::Result<RLModel> {
        model.validate()?;
        let core = PolicyCore::new(model, builder, device, sampler);
        if model.mode == ModelMode::Ppo
            && model.action_space == ActionSpaceKind::Continuous
            && !core.emits_log_variance()
        {
            bail!("continuous PPO needs a network with a log variance head, the policy has to be stochastic");
        }
        let n_params: usize = core.vs.trainable_variables().iter().map(|var| var.numel()).sum();
        info!(
            "initialized {:?} model: {:?} actions {:?}, {} trainable parameters, normalization {}, training {}",
            model.mode,
            model.action_space,
            model.action_sizes,
            n_params,
            core.normalizer.is_some(),
            model.training_enabled,
        );

        Ok(match model.mode {
            ModelMode::Ppo => {
                let learner = if model.training_enabled {
                    Some(PPOLearner::new(&core.vs, hyperparameters.learning_rate, hyperparameters.grad_clip)?)
                } else {
                    None
                };
                RLModel::Ppo(PpoModel { core, hyperparameters: hyperparameters.clone(), learner })
            }
            ModelMode::SupervisedLearning => {
                let learner = if model.training_enabled {
                    Some(SLLearner::new(&core.vs, hyperparameters.learning_rate, hyperparameters.grad_clip)?)
                } else {
                    None
                };
                RLModel::SupervisedLearning(SupervisedModel { core, learner })
            }
        })
    }

    /// Seeds parameter init and the action sampler from `config.seed` and builds the default network.
    pub fn from_configuration(config: &Configuration) -> anyhow::Result<RLModel> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);
        RLModel::initialize(
            &config.model,
            &config.hyperparameters,
            &config.network,
            config.device(),
            Sampler::seeded(config.seed),
        )
    }

    pub fn mode(&self) -> ModelMode {
        match self {
            RLModel::Ppo(_) => ModelMode::Ppo,
            RLModel::SupervisedLearning(_) => ModelMode::SupervisedLearning,
        }
    }

    pub fn ppo(&mut self) -> &mut PpoModel {
        match self {
            RLModel::Ppo(model) => model,
            RLModel::SupervisedLearning(_) => panic!("This method is for PPO mode only"),
        }
    }

    pub fn supervised(&mut self) -> &mut SupervisedModel {
        match self {
            RLModel::SupervisedLearning(model) => model,
            RLModel::Ppo(_) => panic!("This method is for supervised learning mode only"),
        }
    }
}
