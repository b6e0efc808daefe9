//! Orchestration core for planforge: the streaming control loop around a
//! slow, non-deterministic plan generator, plus the ephemeral cache,
//! progress estimation, and the shared status read path.

pub mod cache;
pub mod events;
pub mod generator;
pub mod orchestrator;
pub mod progress;
pub mod status;
