pub mod hosts;
pub mod instances;

pub use hosts::HostSnapshot;
pub use instances::{InstanceFilter, InstanceStats, InstanceStore, InstanceUpdate};
