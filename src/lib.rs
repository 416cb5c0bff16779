//! Outflow Library
//!
//! Real-time audio output pipeline: lock-free buffering, downmix,
//! live equalizer and transport control under a hardware-driven callback.

#![allow(dead_code, unused_mut)]

pub mod audio;
