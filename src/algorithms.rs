pub mod common_utils;
pub mod ppo;
pub mod sl;
