pub mod allocator;
pub mod buildspec;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod port;
pub mod registry;

pub use error::DeployError;
pub use orchestrator::{DeploySettings, DeploymentService};
