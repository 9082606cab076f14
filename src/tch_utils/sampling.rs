use rand::{distributions::Standard, rngs::SmallRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tch::{Device, Tensor};

/// Source of randomness for action sampling. Owned by the model so tests can seed it.
pub struct Sampler {
    rng: SmallRng,
}

impl Sampler {
    pub fn seeded(seed: u64) -> Self {
        Self { rng: SmallRng::seed_from_u64(seed) }
    }

    /// N(0, 1) noise of the given shape
    pub fn standard_normal(&mut self, shape: &[i64], device: Device) -> Tensor {
        let numel = shape.iter().product::<i64>() as usize;
        let noise: Vec<f32> = (&mut self.rng).sample_iter(StandardNormal).take(numel).collect();
        Tensor::from_slice(&noise).view(shape).to_device(device)
    }

    /// U[0, 1) noise of the given shape
    pub fn uniform(&mut self, shape: &[i64], device: Device) -> Tensor {
        let numel = shape.iter().product::<i64>() as usize;
        let noise: Vec<f32> = (&mut self.rng).sample_iter(Standard).take(numel).collect();
        Tensor::from_slice(&noise).view(shape).to_device(device)
    }
}
