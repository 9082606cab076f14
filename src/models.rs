pub mod model_base;
pub mod ppo;
pub mod distributions;
pub mod normalizer;
pub mod rl_model;
