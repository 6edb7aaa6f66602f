//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - MLS excitation generation ([`signal`])
//! - Fast Hadamard transform correlation ([`hadamard`])
//! - Handle-based excitation module ([`module`])
//! - Capture/playback device seams ([`device`])
//! - Round recorder ([`recorder`])
//! - WAV encode/decode helpers ([`wav`])
//! - Simulated acoustic path for tests and demos ([`simulated`])
//! - Local output via cpal ([`playback`], `cpal` feature)

pub mod device;
pub mod hadamard;
pub mod module;
#[cfg(feature = "cpal")]
pub mod playback;
pub mod recorder;
pub mod signal;
pub mod simulated;
pub mod wav;
