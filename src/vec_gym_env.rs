// Vectorized toy environment: every agent moves on [-1, 1] toward a random target.
use itertools::izip;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tch::{Device, Kind, Tensor};

const MOVE_SPEED: f32 = 0.1;
const TARGET_RADIUS: f32 = 0.05;
const TARGET_BONUS: f32 = 1.0;
const MAX_EPISODE_STEPS: usize = 50;

#[derive(Debug)]
pub struct Step {
    pub obs: Tensor,
    pub reward: Tensor,
    pub is_done: Tensor,
}

pub struct VecTargetEnv {
    positions: Vec<f32>,
    targets: Vec<f32>,
    steps: Vec<usize>,
    discrete: bool,
    rng: SmallRng,
}

fn random_position(rng: &mut SmallRng) -> f32 {
    rng.gen_range(-1.0..1.0)
}

impl VecTargetEnv {
    /// [position, target, target - position]
    pub const OBSERVATION_SIZE: i64 = 3;

    /// `discrete` picks a single 3-way branch (left, stay, right) over a 1-d continuous action.
    pub fn new(n_env: usize, discrete: bool, seed: u64) -> VecTargetEnv {
        let mut rng = SmallRng::seed_from_u64(seed);
        let positions = (0..n_env).map(|_| random_position(&mut rng)).collect();
        let targets = (0..n_env).map(|_| random_position(&mut rng)).collect();
        VecTargetEnv { positions, targets, steps: vec![0; n_env], discrete, rng }
    }

    pub fn n_env(&self) -> usize {
        self.positions.len()
    }

    pub fn action_sizes(&self) -> Vec<i64> {
        if self.discrete {
            vec![3]
        } else {
            vec![1]
        }
    }

    /// space is of size [[n_env, observation_size]]
    pub fn observation_space(&self) -> [i64; 2] {
        [self.n_env() as i64, Self::OBSERVATION_SIZE]
    }

    pub fn reset(&mut self) -> Tensor {
        for (pos, target, steps) in izip!(self.positions.iter_mut(), self.targets.iter_mut(), self.steps.iter_mut()) {
            *pos = random_position(&mut self.rng);
            *target = random_position(&mut self.rng);
            *steps = 0;
        }
        self.observation()
    }

    fn observation(&self) -> Tensor {
        let mut obs = Vec::with_capacity(self.n_env() * Self::OBSERVATION_SIZE as usize);
        for (pos, target) in izip!(&self.positions, &self.targets) {
            obs.extend([*pos, *target, target - pos]);
        }
        Tensor::from_slice(&obs).view(self.observation_space())
    }

    /// One [n_env, 3] mask for the discrete branch; moving past an edge is forbidden. Empty for continuous.
    pub fn action_masks(&self) -> Vec<Tensor> {
        if !self.discrete {
            return Vec::new();
        }
        let mut masks = Vec::with_capacity(self.n_env() * 3);
        for pos in &self.positions {
            let left = if *pos - MOVE_SPEED < -1.0 { 0f32 } else { 1. };
            let right = if *pos + MOVE_SPEED > 1.0 { 0f32 } else { 1. };
            masks.extend([left, 1., right]);
        }
        vec![Tensor::from_slice(&masks).view([self.n_env() as i64, 3])]
    }

    /// Scripted policy heading straight for the target, in the same encoding `step` takes.
    pub fn expert_actions(&self) -> Tensor {
        let acts: Vec<f32> = izip!(&self.positions, &self.targets)
            .map(|(pos, target)| {
                let diff = target - pos;
                if self.discrete {
                    if diff.abs() < TARGET_RADIUS {
                        1.
                    } else if diff < 0. {
                        0.
                    } else {
                        2.
                    }
                } else {
                    (diff / MOVE_SPEED).clamp(-1., 1.)
                }
            })
            .collect();
        Tensor::from_slice(&acts).view([self.n_env() as i64, 1])
    }

    /// `actions` is [n_env, 1]. Finished agents are reset in place, so `obs` is always the next
    /// observation to act on.
    pub fn step(&mut self, actions: &Tensor, device: Device) -> Step {
        let actions = actions.to_device(Device::Cpu).to_kind(Kind::Float);
        let n_env = self.n_env();
        let mut rewards = Vec::with_capacity(n_env);
        let mut dones = Vec::with_capacity(n_env);

        for (idx, pos, target, steps) in
            izip!(0..n_env, self.positions.iter_mut(), self.targets.iter_mut(), self.steps.iter_mut())
        {
            let act = actions.double_value(&[idx as i64, 0]) as f32;
            let delta = if self.discrete { (act.round() - 1.) * MOVE_SPEED } else { act.clamp(-1., 1.) * MOVE_SPEED };
            *pos = (*pos + delta).clamp(-1., 1.);
            *steps += 1;

            let distance = (*target - *pos).abs();
            let reached = distance < TARGET_RADIUS;
            let reward = if reached { TARGET_BONUS } else { -distance };
            let done = reached || *steps >= MAX_EPISODE_STEPS;
            if done {
                *pos = random_position(&mut self.rng);
                *target = random_position(&mut self.rng);
                *steps = 0;
            }
            rewards.push(reward);
            dones.push(done as i32 as f32);
        }

        Step {
            obs: self.observation().to_device(device),
            reward: Tensor::from_slice(&rewards).to_device(device),
            is_done: Tensor::from_slice(&dones).to_device(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_layout() {
        let mut env = VecTargetEnv::new(4, false, 0);
        let obs = env.reset();
        assert_eq!(obs.size(), vec![4, 3]);
        let diff = obs.select(1, 1) - obs.select(1, 0) - obs.select(1, 2);
        assert!(diff.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_masks_forbid_leaving_the_line() {
        let mut env = VecTargetEnv::new(2, true, 0);
        env.positions = vec![-1.0, 0.95];
        let masks = env.action_masks();
        assert_eq!(masks.len(), 1);
        let mask = Vec::<f32>::try_from(&masks[0].flatten(0, -1)).unwrap();
        assert_eq!(mask, vec![0., 1., 1., 1., 1., 0.]);
        assert!(VecTargetEnv::new(2, false, 0).action_masks().is_empty());
    }

    #[test]
    fn test_expert_reaches_target() {
        let mut env = VecTargetEnv::new(8, false, 3);
        env.reset();
        // the line is 2 long, so every agent arrives within 20 steps
        let mut reached = Tensor::zeros([8], (Kind::Float, Device::Cpu));
        for _ in 0..21 {
            let acts = env.expert_actions();
            let step = env.step(&acts, Device::Cpu);
            reached = reached.max_other(&step.reward.eq(TARGET_BONUS as f64).to_kind(Kind::Float));
        }
        assert_eq!(reached.sum(Kind::Float).double_value(&[]), 8.);
    }

    #[test]
    fn test_episode_times_out() {
        let mut env = VecTargetEnv::new(1, true, 1);
        env.positions = vec![-1.0];
        env.targets = vec![1.0];
        let stay = Tensor::ones([1, 1], (Kind::Float, Device::Cpu));
        for _ in 0..MAX_EPISODE_STEPS - 1 {
            let step = env.step(&stay, Device::Cpu);
            assert_eq!(step.is_done.double_value(&[0]), 0.);
        }
        let step = env.step(&stay, Device::Cpu);
        assert_eq!(step.is_done.double_value(&[0]), 1.);
    }
}
