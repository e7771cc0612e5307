//! Service layer
//!
//! The validator, sampler and fan controller are the unprivileged core;
//! the gateway is the only service that writes to hardware. Profiles and
//! the boot apply sit on top of them.

pub mod boot;
pub mod fan_controller;
pub mod gateway;
pub mod profile_store;
pub mod sampler;
pub mod validator;

pub use boot::{apply_default, BootOutcome};
pub use fan_controller::{FanControlLoop, FanController, FanTuning};
pub use gateway::{ApplyGateway, ApplyReport, GatewayConfig};
pub use profile_store::ProfileStore;
pub use sampler::{Sampler, StopSignal, TelemetryFeed};
