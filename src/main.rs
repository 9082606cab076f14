use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use itertools::izip;
use tch::{Device, Kind, Tensor};
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

use ppo_model::{
    algorithms::{common_utils::GAECalc, ppo::ppo_learn::TrainStats},
    config::{Configuration, ModelMode},
    models::{
        model_base::{ActionSpaceKind, Observation},
        rl_model::{PPOBatch, PpoModel, RLModel, SupervisedModel},
    },
    vec_gym_env::VecTargetEnv,
};

const LOG_EVERY: i64 = 10;
const OBS_SIZE: i64 = VecTargetEnv::OBSERVATION_SIZE;

#[derive(Debug, Parser)]
struct Cli {
    #[arg(short = 'v', long, action = clap::ArgAction::Count, help = "Increase verbosity level (-v = DEBUG, -vv = TRACE)")]
    verbose: u8,

    #[arg(short, long, default_value = "config.json", help = "Path to the json configuration")]
    config: PathBuf,
}

/// running episode reward bookkeeping across all envs
#[derive(Default)]
struct EpisodeTracker {
    sum_rewards: Vec<f64>,
    total_rewards: f64,
    total_episodes: f64,
}

impl EpisodeTracker {
    fn new(n_env: usize) -> Self {
        Self { sum_rewards: vec![0.; n_env], ..Default::default() }
    }

    fn record(&mut self, reward: &Tensor, is_done: &Tensor) -> anyhow::Result<()> {
        let rews = Vec::<f32>::try_from(reward)?;
        let dones = Vec::<f32>::try_from(is_done)?;
        for (rew_sum, rew, done) in izip!(self.sum_rewards.iter_mut(), &rews, &dones) {
            *rew_sum += *rew as f64;
            if *done > 0.5 {
                self.total_rewards += *rew_sum;
                self.total_episodes += 1.;
                *rew_sum = 0.;
            }
        }
        Ok(())
    }

    /// mean reward of the episodes finished since the last call
    fn take_mean(&mut self) -> f64 {
        let mean = self.total_rewards / self.total_episodes.max(1.);
        self.total_rewards = 0.;
        self.total_episodes = 0.;
        mean
    }
}

fn masks_arg(masks: &[Tensor]) -> Option<&[Tensor]> {
    (!masks.is_empty()).then_some(masks)
}

fn train_ppo(model: &mut PpoModel, env: &mut VecTargetEnv, config: &Configuration, style: &ProgressStyle) -> anyhow::Result<()> {
    let hp = config.hyperparameters.clone();
    let n_env = env.n_env() as i64;
    let n_steps = hp.steps_per_rollout;
    let train_size = n_steps * n_env;
    let width = model.action_spec().action_width();
    let discrete = model.action_spec().kind == ActionSpaceKind::Discrete;
    let gae = GAECalc::new(Some(hp.gamma), Some(hp.lambda));

    let multi_prog_bar_total = MultiProgress::new();
    let total_prog_bar = multi_prog_bar_total.add(ProgressBar::new(hp.updates as u64).with_style(style.clone()));
    total_prog_bar.set_message("updates");
    let mut tracker = EpisodeTracker::new(n_env as usize);
    let mut total_steps = 0i64;
    let mut stats = Vec::new();
    let mut obs = env.reset();

    for update_index in 0..hp.updates {
        total_prog_bar.inc(1);
        let s_states = Tensor::zeros([n_steps + 1, n_env, OBS_SIZE], (Kind::Float, Device::Cpu));
        let s_rewards = Tensor::zeros([n_steps, n_env], (Kind::Float, Device::Cpu));
        let dones_f = Tensor::zeros([n_steps, n_env], (Kind::Float, Device::Cpu));
        let s_actions = Tensor::zeros([n_steps, n_env, width], (Kind::Float, Device::Cpu));
        let s_log_probs = Tensor::zeros([n_steps, n_env, width], (Kind::Float, Device::Cpu));
        let s_masks: Vec<Tensor> = if discrete {
            env.action_sizes().iter().map(|&k| Tensor::zeros([n_steps, n_env, k], (Kind::Float, Device::Cpu))).collect()
        } else {
            Vec::new()
        };
        s_states.get(0).copy_(&obs);

        for s in 0..n_steps {
            let masks = env.action_masks();
            let (actions, log_probs) = model.evaluate_action(Observation::vector(&obs), masks_arg(&masks));
            let step = env.step(&actions, Device::Cpu);
            tracker.record(&step.reward, &step.is_done)?;

            s_actions.get(s).copy_(&actions);
            s_log_probs.get(s).copy_(&log_probs);
            s_rewards.get(s).copy_(&step.reward);
            dones_f.get(s).copy_(&step.is_done);
            s_states.get(s + 1).copy_(&step.obs);
            for (store, mask) in s_masks.iter().zip(&masks) {
                store.get(s).copy_(mask);
            }
            obs = step.obs;
        }
        total_steps += train_size;

        // compute gae
        let vals = model
            .evaluate_value(Observation::vector(&s_states.view([-1, OBS_SIZE])))
            .to_device(Device::Cpu)
            .view([n_steps + 1, n_env]);
        let adv = gae.calc(&s_rewards, &dones_f, &vals);
        let old_values = vals.narrow(0, 0, n_steps).reshape([train_size]);
        let target_vals = adv.view([train_size]) + &old_values;
        let advantages = adv.view([train_size]);
        // norm advantages
        let advantages = (&advantages - advantages.mean(Kind::Float)) / (advantages.std(true) + 1e-8);

        let learn_states = s_states.narrow(0, 0, n_steps).reshape([train_size, OBS_SIZE]);
        let actions = s_actions.view([train_size, width]);
        let old_log_probs = s_log_probs.view([train_size, width]);
        let masks: Vec<Tensor> = s_masks.iter().map(|mask| mask.view([train_size, -1])).collect();

        let prog_bar = multi_prog_bar_total.add(ProgressBar::new(hp.optim_epochs as u64).with_style(style.clone()));
        prog_bar.set_message("doing epochs");
        for _epoch in 0..hp.optim_epochs {
            prog_bar.inc(1);
            let batch_indexes = Tensor::randperm(train_size, (Kind::Int64, Device::Cpu));
            for batch_start_index in (0..train_size).step_by(hp.batch_size as usize) {
                let len = hp.batch_size.min(train_size - batch_start_index);
                let buffer_indexes = batch_indexes.narrow(0, batch_start_index, len);
                let states = learn_states.index_select(0, &buffer_indexes);
                let batch_masks: Vec<Tensor> = masks.iter().map(|mask| mask.index_select(0, &buffer_indexes)).collect();
                stats.push(model.train_batch(PPOBatch {
                    observation: Observation::vector(&states),
                    actions: &actions.index_select(0, &buffer_indexes),
                    old_log_probs: &old_log_probs.index_select(0, &buffer_indexes),
                    target_values: &target_vals.index_select(0, &buffer_indexes),
                    old_values: &old_values.index_select(0, &buffer_indexes),
                    advantages: &advantages.index_select(0, &buffer_indexes),
                    masks: masks_arg(&batch_masks),
                }));
            }
        }
        prog_bar.finish_and_clear();

        if update_index % LOG_EVERY == 0 || update_index == hp.updates - 1 {
            let avg = TrainStats::mean(&stats);
            info!(
                "update idx: {}, total steps: {}, episode rewards: {:.3}, clip frac avg: {:.3}, kl div avg: {:.5}, ent: {:.4}, loss: {:.4}, act loss: {:.4}, val loss: {:.4}",
                update_index,
                total_steps,
                tracker.take_mean(),
                avg.clip_fraction,
                avg.approx_kl,
                avg.entropy,
                avg.total_loss,
                avg.policy_loss,
                avg.value_loss,
            );
            stats.clear();
        }
    }
    total_prog_bar.finish_and_clear();
    Ok(())
}

/// Imitates the scripted target-seeking policy on the states the model itself visits.
fn train_supervised(
    model: &mut SupervisedModel,
    env: &mut VecTargetEnv,
    config: &Configuration,
    style: &ProgressStyle,
) -> anyhow::Result<()> {
    let hp = &config.hyperparameters;
    let total_prog_bar = ProgressBar::new(hp.updates as u64).with_style(style.clone());
    total_prog_bar.set_message("updates");
    let mut tracker = EpisodeTracker::new(env.n_env());
    let mut losses = Vec::new();
    let mut obs = env.reset();

    for update_index in 0..hp.updates {
        total_prog_bar.inc(1);
        for _ in 0..hp.steps_per_rollout {
            let masks = env.action_masks();
            let expert_actions = env.expert_actions();
            let (actions, _) = model.evaluate_action(Observation::vector(&obs), masks_arg(&masks));
            losses.push(model.train_batch(Observation::vector(&obs), &expert_actions, masks_arg(&masks)));
            let step = env.step(&actions, Device::Cpu);
            tracker.record(&step.reward, &step.is_done)?;
            obs = step.obs;
        }

        if update_index % LOG_EVERY == 0 || update_index == hp.updates - 1 {
            let loss = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
            info!("update idx: {}, episode rewards: {:.3}, imitation loss: {:.5}", update_index, tracker.take_mean(), loss);
            losses.clear();
        }
    }
    total_prog_bar.finish_and_clear();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbosity = cli.verbose.saturating_add(3).clamp(1, 5);
    let level = Level::from_str(verbosity.to_string().as_str())?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();
    info!("Logging initialized at level: {}", level);

    let mut config = Configuration::load_configuration(&cli.config)?;
    let discrete = config.model.action_space == ActionSpaceKind::Discrete;
    let mut env = VecTargetEnv::new(config.n_env, discrete, config.seed);
    // the toy env dictates the model's input and output sizes
    config.model.action_sizes = env.action_sizes();
    config.model.vector_observation_size = OBS_SIZE;
    config.model.visual_observations.clear();
    info!("action sizes: {:?}", config.model.action_sizes);
    info!("observation space: {:?}", env.observation_space());

    let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} [{per_sec}]")?;
    let mut model = RLModel::from_configuration(&config)?;
    match model.mode() {
        ModelMode::Ppo => train_ppo(model.ppo(), &mut env, &config, &style),
        ModelMode::SupervisedLearning => train_supervised(model.supervised(), &mut env, &config, &style),
    }
}
