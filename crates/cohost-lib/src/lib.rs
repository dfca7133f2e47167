//! cohost-lib: AI co-host engine.
//!
//! Context, response generation, speech synthesis, caching, device playback,
//! the orchestrating state machine, and the HTTP control API.
//! Depends on cohost-core for pure types and text/audio processing.

pub mod audio_cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod response_cache;
pub mod retry;
pub mod server;
pub mod synth;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;

// Re-export cohost-core for convenience
pub use cohost_core;
