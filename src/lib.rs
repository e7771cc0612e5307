//! nvoc - privilege-separated NVIDIA GPU overclocking
//!
//! Bounded power limit, clock offset and fan writes through a single
//! privileged gateway, plus a closed-loop fan curve controller driven by
//! periodic telemetry.
//!
//! # Modules
//!
//! - [`cli`]: Command-line interface definitions
//! - [`commands`]: Command handlers
//! - [`config`]: Configuration system
//! - [`domain`]: Domain models with validation
//! - [`error`]: Error types
//! - [`ipc`]: Messages across the privilege boundary
//! - [`nvml`]: NVML abstraction layer
//! - [`services`]: Gateway, validator, sampler, fan controller and profiles

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod nvml;
pub mod services;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{AppError, Result};
