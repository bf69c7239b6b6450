// src/config/mod.rs
pub mod engine;
pub mod sources;

pub use engine::{load_engine_config_default, load_engine_config_from, EngineConfig};
pub use sources::{default_seed, load_sources_default, load_sources_from};
