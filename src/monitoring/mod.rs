pub mod progress;

pub use progress::{DeploymentProgress, InstanceState, StateRecord, TransitionError};
