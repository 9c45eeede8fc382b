pub mod credentials;
pub mod deployer;
pub mod gce;
pub mod graph;
pub mod provider;
pub mod readiness;
pub mod resources;
pub mod simulated;

pub use deployer::{Deployer, DeploymentOutputs, ResourceOutput};
pub use gce::GceClient;
pub use graph::{ResourceGraph, ResourceId};
pub use provider::{CloudProvider, GuestAttributes, InstanceTarget};
pub use readiness::{wait_for_guest_attribute, PollSettings, ReadinessCondition, ReadyMarker};
pub use simulated::{GuestScript, SimulatedCloud};
