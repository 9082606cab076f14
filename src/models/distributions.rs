use tch::{Kind, Tensor};

use crate::tch_utils::sampling::Sampler;

/// floor added inside logs and to the masked softmax denominator
pub const PROB_EPSILON: f64 = 1e-8;

const LOG_2PI: f64 = 1.8378770664093453; // ln(2π)

/// Diagonal gaussian over continuous actions, parameterized by mean and log variance.
pub struct DiagGaussian {
    mean: Tensor,
    log_variance: Tensor,
}

impl DiagGaussian {
    pub fn new(mean: Tensor, log_variance: Tensor) -> Self {
        Self { mean, log_variance }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn variance(&self) -> Tensor {
        self.log_variance.exp()
    }

    /// a = μ + σ * ε with fresh ε ~ N(0, 1) per element
    pub fn sample(&self, sampler: &mut Sampler) -> Tensor {
        let noise = sampler.standard_normal(&self.mean.size(), self.mean.device());
        &self.mean + self.variance().sqrt() * noise
    }

    /// per dimension log density, [batch, dims]
    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        let diff = actions.to_device(self.mean.device()) - &self.mean;
        (diff.pow_tensor_scalar(2) / self.variance() + &self.log_variance + LOG_2PI) * -0.5
    }

    /// 0.5 * (ln(2πe) + logσ²) averaged over dimensions then batch
    pub fn entropy(&self) -> Tensor {
        ((&self.log_variance + (LOG_2PI + 1.0)) * 0.5).mean(Kind::Float)
    }
}

/// Categorical over one discrete branch with invalid actions masked out before normalization.
pub struct MaskedCategorical {
    probs: Tensor,
}

impl MaskedCategorical {
    /// `logits` and `mask` are [batch, branch_size], mask is 1 for permitted actions
    pub fn new(logits: &Tensor, mask: &Tensor) -> Self {
        let raw_probs = logits.softmax(-1, Kind::Float) * mask.to_device(logits.device());
        // a fully masked row leaves every probability at ~0 instead of NaN
        let total = raw_probs.sum_dim_intlist([-1i64].as_slice(), true, Kind::Float) + PROB_EPSILON;
        Self { probs: raw_probs / total }
    }

    /// masked and normalized probabilities, [batch, branch_size]
    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    /// log of the normalized probabilities, floored by PROB_EPSILON
    pub fn normalized_logits(&self) -> Tensor {
        (&self.probs + PROB_EPSILON).log()
    }

    /// one index per row, [batch, 1] Int64. Zero probability entries are never drawn.
    pub fn sample(&self, sampler: &mut Sampler) -> Tensor {
        let batch_size = self.probs.size()[0];
        let branch_size = self.probs.size()[1];
        let cdf = self.probs.cumsum(1, Kind::Float);
        let total = cdf.narrow(1, branch_size - 1, 1);
        let point = sampler.uniform(&[batch_size, 1], self.probs.device()) * total;
        // number of cdf entries at or below the drawn point is the chosen index
        cdf.le_tensor(&point)
            .sum_dim_intlist([-1i64].as_slice(), true, Kind::Int64)
            .clamp_max(branch_size - 1)
    }

    /// log prob of the taken action indices ([batch] or [batch, 1]), returned as [batch, 1]
    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        let index = actions.to_device(self.probs.device()).to_kind(Kind::Int64).view([-1, 1]);
        self.normalized_logits().gather(1, &index, false)
    }

    /// -Σ p log p averaged over the batch
    pub fn entropy(&self) -> Tensor {
        let plogp = &self.probs * self.normalized_logits();
        (-plogp.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)).mean(Kind::Float)
    }
}

/// Masked distributions for every branch. Missing masks count as all ones.
pub fn masked_branches(logits: &[Tensor], masks: &[Tensor]) -> Vec<MaskedCategorical> {
    assert_eq!(logits.len(), masks.len(), "one action mask is needed per discrete branch");
    logits.iter().zip(masks).map(|(branch_logits, mask)| MaskedCategorical::new(branch_logits, mask)).collect()
}

/// Per branch log probs of `actions` ([batch, branches], integer valued) as [batch, branches],
/// plus the entropy summed across branches.
pub fn branch_log_probs_and_entropy(dists: &[MaskedCategorical], actions: &Tensor) -> (Tensor, Tensor) {
    let log_probs: Vec<Tensor> =
        dists.iter().enumerate().map(|(b, dist)| dist.log_prob(&actions.select(1, b as i64))).collect();
    let entropy = dists
        .iter()
        .map(MaskedCategorical::entropy)
        .reduce(|acc, ent| acc + ent)
        .unwrap_or_else(|| Tensor::from(0f32));
    (Tensor::cat(&log_probs, 1), entropy)
}
