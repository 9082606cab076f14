pub mod dbg_funcs;
pub mod sampling;
