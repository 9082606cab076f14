use tch::{nn::Optimizer, Kind, Tensor};

/// backward + step, clipping the global grad norm when `grad_clip` is set
pub fn optimizer_step(optimizer: &mut Optimizer, loss: &Tensor, grad_clip: Option<f64>) {
    match grad_clip {
        Some(max_norm) => optimizer.backward_step_clip_norm(loss, max_norm),
        None => optimizer.backward_step(loss),
    }
}

pub struct GAECalc {
    gamma: f64,
    lambda: f64,
}

impl GAECalc {
    pub fn new(gamma: Option<f64>, lambda: Option<f64>) -> Self {
        Self {
            gamma: gamma.unwrap_or(0.99),
            lambda: lambda.unwrap_or(0.95),
        }
    }

    /// `rewards` and `dones` are [steps, n_env], `vals` is [steps + 1, n_env] where the last row
    /// bootstraps from the state after the final step. `dones[t]` marks an episode ending at step t.
    pub fn calc(&self, rewards: &Tensor, dones: &Tensor, vals: &Tensor) -> Tensor {
        assert!(
            rewards.kind() == Kind::Float,
            "rewards in gae calc was not of type float"
        );
        assert!(
            dones.kind() == Kind::Float,
            "dones in gae calc was not of type float"
        );
        assert!(
            vals.kind() == Kind::Float,
            "vals in gae calc was not of type float"
        );
        let n_steps = rewards.size()[0];
        assert_eq!(vals.size()[0], n_steps + 1, "gae calc needs one bootstrap value past the last step");

        let adv = rewards.zeros_like();
        let mut last_gae_lam = rewards.get(0).zeros_like();
        for idx in (0..n_steps).rev() {
            let not_done = 1. - dones.get(idx);
            let pred_ret = rewards.get(idx) + self.gamma * vals.get(idx + 1) * &not_done;
            let delta = &pred_ret - &vals.get(idx);
            last_gae_lam = delta + self.gamma * self.lambda * not_done * last_gae_lam;
            adv.get(idx).copy_(&last_gae_lam);
        }

        adv
    }

    pub fn update_config(&mut self, gamma: Option<f64>, lambda: Option<f64>) {
        if let Some(gamma) = gamma {
            self.gamma = gamma;
        }
        if let Some(lambda) = lambda {
            self.lambda = lambda;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_gae_single_step_is_td_error() {
        let gae = GAECalc::new(Some(0.9), Some(0.95));
        let rewards = Tensor::from_slice(&[1.0f32, 2.0]).view([1, 2]);
        let dones = Tensor::from_slice(&[0.0f32, 1.0]).view([1, 2]);
        let vals = Tensor::from_slice(&[0.5f32, 0.5, 1.0, 1.0]).view([2, 2]);

        let adv = Vec::<f32>::try_from(&gae.calc(&rewards, &dones, &vals).flatten(0, -1)).unwrap();
        // env 0 bootstraps, env 1 ended
        assert!((adv[0] - (1.0 + 0.9 - 0.5)).abs() < 1e-6);
        assert!((adv[1] - (2.0 - 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_gae_stops_at_episode_boundary() {
        let mut gae = GAECalc::new(None, None);
        gae.update_config(Some(1.0), Some(1.0));
        let rewards = Tensor::ones([3, 1], (Kind::Float, Device::Cpu));
        let dones = Tensor::from_slice(&[0.0f32, 1.0, 0.0]).view([3, 1]);
        let vals = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));

        let adv = Vec::<f32>::try_from(&gae.calc(&rewards, &dones, &vals).flatten(0, -1)).unwrap();
        assert_eq!(adv, vec![2.0, 1.0, 1.0]);
    }
}
