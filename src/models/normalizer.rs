use tch::{Device, Kind, Tensor};

const NORMALIZED_CLIP: f64 = 5.0;

/// Running mean / variance over vector observations.
/// Variance is an accumulated moment, the effective variance is `variance / (step_count + 1)`.
pub struct RunningNormalizer {
    mean: Tensor,
    variance: Tensor,
    step_count: f64,
}

impl RunningNormalizer {
    pub fn new(size: i64, device: Device) -> Self {
        Self {
            mean: Tensor::zeros([size], (Kind::Float, device)),
            variance: Tensor::ones([size], (Kind::Float, device)),
            step_count: 0.,
        }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn variance(&self) -> &Tensor {
        &self.variance
    }

    pub fn step_count(&self) -> f64 {
        self.step_count
    }

    pub fn running_variance(&self) -> Tensor {
        &self.variance / (self.step_count + 1.)
    }

    /// clip((obs - mean) / sqrt(var / (step + 1)), -5, 5) using the current statistics
    pub fn normalize(&self, obs: &Tensor) -> Tensor {
        let obs = obs.to_device(self.mean.device());
        ((obs - &self.mean) / self.running_variance().sqrt()).clamp(-NORMALIZED_CLIP, NORMALIZED_CLIP)
    }

    /// Restores statistics saved from `mean()`, `variance()` and `step_count()`.
    pub fn load_state(&mut self, mean: &Tensor, variance: &Tensor, step_count: f64) {
        assert_eq!(mean.size(), self.mean.size(), "normalizer mean has the wrong size");
        assert_eq!(variance.size(), self.variance.size(), "normalizer variance has the wrong size");
        tch::no_grad(|| {
            self.mean.copy_(mean);
            self.variance.copy_(variance);
        });
        self.step_count = step_count;
    }

    /// fold one batch into the running statistics
    pub fn update(&mut self, obs: &Tensor) {
        tch::no_grad(|| {
            let obs = obs.to_device(self.mean.device()).to_kind(Kind::Float);
            let batch_mean = obs.mean_dim([0i64].as_slice(), false, Kind::Float);
            let new_mean = &self.mean + (&batch_mean - &self.mean) / (self.step_count + 1.);
            let new_variance = &self.variance + (&batch_mean - &new_mean) * (&batch_mean - &self.mean);
            self.mean.copy_(&new_mean);
            self.variance.copy_(&new_variance);
        });
        self.step_count += 1.;
    }
}
