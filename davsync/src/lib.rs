pub mod config;
pub mod journal;
pub mod paths;
pub mod propagator;
pub mod transfer;
