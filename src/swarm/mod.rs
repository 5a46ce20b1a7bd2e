//! Swarm Controller (§4.7): ramps virtual users per a [`LoadShape`] and
//! rolls up per-endpoint statistics.

pub mod controller;
pub mod load_shape;
pub mod stats;
pub mod worker;

pub use controller::{SwarmController, SwarmResult};
pub use load_shape::{from_load_config, LoadShape, Tick};
pub use stats::EndpointAggregates;
