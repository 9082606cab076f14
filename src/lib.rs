pub mod models;
pub mod algorithms;

/* Proximal Policy Optimization (PPO) actor-critic model with a supervised learning mode.

   Proximal Policy Optimization Algorithms, Schulman et al. 2017
   https://arxiv.org/abs/1707.06347

   See https://spinningup.openai.com/en/latest/algorithms/ppo.html for a
   reference python implementation.
*/
pub mod config;
pub mod tch_utils;
pub mod vec_gym_env;
