pub mod sl_learn;
