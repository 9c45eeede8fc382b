pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod monitoring;
pub mod topology;
pub mod utils;

// Re-exports
pub use config::{LabRequest, LabSettings};
pub use core::{Deployer, ResourceGraph, SimulatedCloud};
pub use errors::{LabError, LabResult};
pub use topology::{LabContext, LabOutput, LabPlan};
