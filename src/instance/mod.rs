pub mod manager;
pub mod model;

pub use manager::{CreateInstance, InstanceService, OrphanContainer, RegisterExternal};
pub use model::InstanceInfo;
