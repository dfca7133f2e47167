//! cohost-core: Pure types, text preparation and PCM processing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod audio;
pub mod text_prep;
pub mod types;
