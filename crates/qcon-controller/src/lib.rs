#![forbid(unsafe_code)]

//! Fleet controller for ephemeral firmware emulator instances.
//!
//! Each instance is a firmware emulator process paired with a companion runtime process, both
//! bound to freshly allocated loopback ports. The controller admits launches up to a fixed limit,
//! proxies client WebSockets into running instances, reaps instances that stop pinging, and can
//! supervise a test harness run against a live instance.

pub mod alloc;
pub mod boot;
pub mod config;
pub mod controller;
pub mod error;
pub mod instance;
pub mod metrics;
pub mod platform;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod testrun;
pub mod tunnel;

pub use config::ControllerConfig;
pub use controller::{Controller, LaunchRequest, Launched, IDLE_TIMEOUT};
pub use error::{ControllerError, InstanceError, StartupError};
pub use instance::EmulatorInstance;
pub use platform::Platform;
pub use server::{start_server, ServerHandle};
