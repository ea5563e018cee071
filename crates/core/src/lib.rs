//! Core crate for the synclip lip-sync synthesis pipeline.

pub mod assembler;
pub mod backend;
pub mod compositor;
pub mod config;
pub mod detect;
pub mod error;
pub mod inference;
pub mod locator;
pub mod logging;
pub mod mel;
pub mod pipeline;
pub mod resize;
pub mod sequencer;
pub mod types;
