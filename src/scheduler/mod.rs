//! Plan quotas and host placement.

pub mod quota;
pub mod selector;

pub use quota::{Plan, Quota};
pub use selector::{HostOverview, HostScheduler, SelectOptions, Strategy};
