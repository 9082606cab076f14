use tch::{nn::{self, Optimizer, OptimizerConfig}, Kind, Tensor};

use crate::{algorithms::common_utils::optimizer_step, config::Hyperparameters};

/// Loss terms of one training batch, plus clip fraction and approximate KL.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainStats {
    pub total_loss: f64,
    pub value_loss: f64,
    pub policy_loss: f64,
    pub entropy: f64,
    pub clip_fraction: f64,
    pub approx_kl: f64,
}

impl TrainStats {
    pub fn mean(stats: &[TrainStats]) -> TrainStats {
        if stats.is_empty() {
            return TrainStats::default();
        }
        let n = stats.len() as f64;
        let sum = stats.iter().fold(TrainStats::default(), |acc, s| TrainStats {
            total_loss: acc.total_loss + s.total_loss,
            value_loss: acc.value_loss + s.value_loss,
            policy_loss: acc.policy_loss + s.policy_loss,
            entropy: acc.entropy + s.entropy,
            clip_fraction: acc.clip_fraction + s.clip_fraction,
            approx_kl: acc.approx_kl + s.approx_kl,
        });
        TrainStats {
            total_loss: sum.total_loss / n,
            value_loss: sum.value_loss / n,
            policy_loss: sum.policy_loss / n,
            entropy: sum.entropy / n,
            clip_fraction: sum.clip_fraction / n,
            approx_kl: sum.approx_kl / n,
        }
    }
}

/// Tensors the PPO objective is built from. Log probs are [batch, n] (per branch or per dimension),
/// values and advantages are [batch] or [batch, 1].
pub struct PPOTerms<'a> {
    pub new_log_probs: &'a Tensor,
    pub old_log_probs: &'a Tensor,
    pub new_values: &'a Tensor,
    pub old_values: &'a Tensor,
    pub target_values: &'a Tensor,
    pub advantages: &'a Tensor,
    pub entropy: &'a Tensor,
}

/// mean(max((v - t)², (v_old + clip(v - v_old, -c, c) - t)²))
pub fn value_loss(new_values: &Tensor, old_values: &Tensor, target_values: &Tensor, clip_value_loss: f64) -> Tensor {
    let new_values = new_values.view([-1, 1]);
    let old_values = old_values.to_device(new_values.device()).view([-1, 1]);
    let target_values = target_values.to_device(new_values.device()).view([-1, 1]);
    let clipped_values = &old_values + (&new_values - &old_values).clamp(-clip_value_loss, clip_value_loss);
    let value_loss_1 = (&new_values - &target_values).pow_tensor_scalar(2);
    let value_loss_2 = (clipped_values - &target_values).pow_tensor_scalar(2);
    value_loss_1.max_other(&value_loss_2).mean(Kind::Float)
}

/// -mean(min(r * A, clip(r, 1 - eps, 1 + eps) * A)) with r = exp(new - old)
pub fn policy_loss(new_log_probs: &Tensor, old_log_probs: &Tensor, advantages: &Tensor, clip_epsilon: f64) -> Tensor {
    assert_eq!(
        new_log_probs.size(),
        old_log_probs.size(),
        "old log probs must have the same shape as the new ones"
    );
    let ratio = (new_log_probs - old_log_probs.to_device(new_log_probs.device())).exp();
    let advs = advantages.to_device(new_log_probs.device()).view([-1, 1]);
    let clip_ratio = ratio.clamp(1.0 - clip_epsilon, 1.0 + clip_epsilon);
    -((&ratio * &advs).min_other(&(&clip_ratio * &advs)).mean(Kind::Float))
}

pub struct PPOLearner {
    optimizer: Optimizer,
    grad_clip: Option<f64>,
}

impl PPOLearner {
    /// The optimizer covers every trainable variable of `vs`.
    pub fn new(vs: &nn::VarStore, learning_rate: f64, grad_clip: Option<f64>) -> anyhow::Result<Self> {
        let optimizer = nn::Adam::default().build(vs, learning_rate)?;
        Ok(Self { optimizer, grad_clip })
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_lr(learning_rate);
    }

    /// Builds the combined loss with the hyperparameters of this call and applies one optimizer step.
    pub fn step(&mut self, hyperparameters: &Hyperparameters, terms: PPOTerms) -> TrainStats {
        let value_loss = value_loss(terms.new_values, terms.old_values, terms.target_values, hyperparameters.clip_value_loss);
        let action_loss =
            policy_loss(terms.new_log_probs, terms.old_log_probs, terms.advantages, hyperparameters.clip_epsilon);
        let loss = &action_loss + &value_loss * hyperparameters.value_loss_weight
            - terms.entropy * hyperparameters.entropy_loss_weight;

        let (clip_fraction, approx_kl) = tch::no_grad(|| {
            let log_ratio = terms.new_log_probs - terms.old_log_probs.to_device(terms.new_log_probs.device());
            let ratio = log_ratio.exp();
            let clip_frac = (&ratio - 1.).abs().greater(hyperparameters.clip_epsilon).to_kind(Kind::Float).mean(Kind::Float);
            let kl = ((&ratio - 1.) - &log_ratio).mean(Kind::Float);
            (clip_frac.double_value(&[]), kl.double_value(&[]))
        });

        let stats = TrainStats {
            total_loss: loss.double_value(&[]),
            value_loss: value_loss.double_value(&[]),
            policy_loss: action_loss.double_value(&[]),
            entropy: terms.entropy.double_value(&[]),
            clip_fraction,
            approx_kl,
        };
        optimizer_step(&mut self.optimizer, &loss, self.grad_clip);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn full(n: i64, v: f64) -> Tensor {
        Tensor::full([n], v, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_value_loss_zero_when_all_values_agree() {
        let v = Tensor::from_slice(&[0.3f32, -1.2, 4.0]);
        let loss = value_loss(&v, &v, &v, 0.2);
        assert_eq!(loss.double_value(&[]), 0.0);
    }

    #[test]
    fn test_value_loss_is_pessimistic() {
        // new value jumps past the target, the clipped estimate is further away and wins the max
        let new_values = full(4, 1.0);
        let old_values = full(4, 0.0);
        let target = full(4, 1.0);
        let loss = value_loss(&new_values, &old_values, &target, 0.2);
        assert!((loss.double_value(&[]) - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_policy_loss_zero_without_advantage() {
        let new_lp = Tensor::from_slice(&[0.5f32, -2.0, 1.0, 3.0]).view([-1, 1]);
        let old_lp = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let loss = policy_loss(&new_lp, &old_lp, &full(4, 0.0), 0.2);
        assert_eq!(loss.double_value(&[]), 0.0);
    }

    #[test]
    fn test_policy_loss_saturates_past_clip() {
        let old_lp = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let advs = full(4, 1.0);
        let loss_at = |log_ratio: f64| {
            let new_lp = Tensor::full([4, 1], log_ratio, (Kind::Float, Device::Cpu));
            policy_loss(&new_lp, &old_lp, &advs, 0.2).double_value(&[])
        };
        // ratio e^0.5 and e^1.0 are both above 1.2, the clipped branch dominates the min
        assert!((loss_at(0.5) + 1.2).abs() < 1e-6);
        assert!((loss_at(1.0) + 1.2).abs() < 1e-6);
        // inside the trust region the unclipped ratio is used
        assert!((loss_at(0.1) + 0.1f64.exp()).abs() < 1e-5);
    }

    #[test]
    fn test_policy_loss_gradient_vanishes_when_clipped() {
        let new_lp = Tensor::full([4, 1], 1.0, (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let old_lp = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let loss = policy_loss(&new_lp, &old_lp, &full(4, 1.0), 0.2);
        loss.backward();
        assert_eq!(new_lp.grad().abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    #[should_panic(expected = "same shape")]
    fn test_policy_loss_rejects_flat_old_log_probs() {
        let new_lp = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let old_lp = Tensor::zeros([4], (Kind::Float, Device::Cpu));
        policy_loss(&new_lp, &old_lp, &full(4, 1.0), 0.2);
    }

    #[test]
    fn test_per_branch_log_probs_broadcast_advantage() {
        let new_lp = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        let loss = policy_loss(&new_lp, &new_lp, &Tensor::from_slice(&[1f32, 2., 3.]), 0.2);
        assert!((loss.double_value(&[]) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_learner_step_updates_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[1], nn::Init::Const(0.));
        let mut learner = PPOLearner::new(&vs, 0.1, None).unwrap();

        let new_values = (&w * 1.0).view([1, 1]).repeat([4, 1]);
        let zeros = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let entropy = Tensor::from(0f32);
        let hp = Hyperparameters::default();
        let stats = learner.step(
            &hp,
            PPOTerms {
                new_log_probs: &zeros,
                old_log_probs: &zeros,
                new_values: &new_values,
                old_values: &zeros,
                target_values: &full(4, 1.0),
                advantages: &full(4, 0.0),
                entropy: &entropy,
            },
        );
        assert!((stats.value_loss - 1.0).abs() < 1e-6);
        assert!((stats.total_loss - 0.5).abs() < 1e-6);
        assert_eq!(stats.clip_fraction, 0.0);
        // moved toward the target
        assert!(w.double_value(&[0]) > 0.0);
    }

    #[test]
    fn test_stats_mean() {
        let a = TrainStats { total_loss: 1.0, entropy: 2.0, ..Default::default() };
        let b = TrainStats { total_loss: 3.0, entropy: 0.0, ..Default::default() };
        let m = TrainStats::mean(&[a, b]);
        assert_eq!(m.total_loss, 2.0);
        assert_eq!(m.entropy, 1.0);
        assert_eq!(TrainStats::mean(&[]), TrainStats::default());
    }
}
