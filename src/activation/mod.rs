pub mod machine;
pub mod registry;
pub mod resolver;

pub use machine::{ActivationMachine, ActivationPath, ActivationState, ActivationTimings};
pub use registry::{ActivationChange, ActivationRegistry};
