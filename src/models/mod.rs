pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod version;

pub use orchestrator::{LoadRequest, ModelDetails, Orchestrator, RecoveryReport, TrainRequest, Upload};
pub use registry::{ModelRecord, ModelRegistry, ModelStatus, Operation};
pub use schema::{Feature, Schema};
pub use store::ArtifactStore;
pub use version::{ArtifactVersion, Origin, VersionId};
