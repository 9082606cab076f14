use tch::{nn::{self, Optimizer, OptimizerConfig}, Kind, Tensor};

use crate::{algorithms::common_utils::optimizer_step, models::distributions::MaskedCategorical};

/// Σ_b mean cross entropy between one_hot(label_b) and the masked distribution of branch b.
/// `labels` is [batch, branches] with integer valued entries.
pub fn discrete_imitation_loss(dists: &[MaskedCategorical], labels: &Tensor) -> Tensor {
    dists
        .iter()
        .enumerate()
        .map(|(b, dist)| {
            let logits = dist.normalized_logits();
            let onehot = labels.select(1, b as i64).to_device(logits.device()).to_kind(Kind::Int64).one_hot(logits.size()[1]);
            let log_softmax = logits.log_softmax(-1, Kind::Float);
            (-(onehot.to_kind(Kind::Float) * log_softmax).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float))
                .mean(Kind::Float)
        })
        .reduce(|acc, loss| acc + loss)
        .unwrap_or_else(|| Tensor::from(0f32))
}

/// Gaussian negative log likelihood without the constant when a variance is available, else MSE.
pub fn continuous_imitation_loss(labels: &Tensor, mean: &Tensor, log_variance: Option<&Tensor>) -> Tensor {
    let labels = labels.to_device(mean.device());
    let sq_err = (&labels - mean).pow_tensor_scalar(2);
    match log_variance {
        Some(log_var) => (sq_err * 0.5 / log_var.exp() + log_var * 0.5).mean(Kind::Float),
        None => sq_err.mean(Kind::Float),
    }
}

pub struct SLLearner {
    optimizer: Optimizer,
    grad_clip: Option<f64>,
}

impl SLLearner {
    pub fn new(vs: &nn::VarStore, learning_rate: f64, grad_clip: Option<f64>) -> anyhow::Result<Self> {
        let optimizer = nn::Adam::default().build(vs, learning_rate)?;
        Ok(Self { optimizer, grad_clip })
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_lr(learning_rate);
    }

    pub fn step(&mut self, loss: &Tensor) -> f64 {
        let loss_value = loss.double_value(&[]);
        optimizer_step(&mut self.optimizer, loss, self.grad_clip);
        loss_value
    }
}
