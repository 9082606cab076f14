pub mod ppo_learn;
