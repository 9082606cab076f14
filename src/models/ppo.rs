pub mod default_ppo;
