//! Firmware orchestration core for a soil-monitoring sensor mesh:
//! role selection, sensor acquisition, mesh relay, cloud forwarding
//! and the duty-cycle scheduling around them. Hardware collaborators
//! sit behind the traits in `hardware` and `sensors`; `sim` provides
//! host implementations so the whole device runs as a process.

pub mod cloud;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod hardware;
pub mod mesh;
pub mod scheduler;
pub mod sensors;
pub mod sim;
pub mod telemetry;
