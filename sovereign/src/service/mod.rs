//! Per-service configuration.
//!
//! A [`ServiceDescriptor`] is built once, validated, and never mutated. The
//! [`ServiceTable`] is the explicit registry handed to the lifecycle
//! controller; nothing registers itself implicitly.

mod descriptor;
mod table;

pub use descriptor::{
    BuildOptions, DescriptorBuilder, GuestNetwork, HttpsCheck, KernelSource, ServiceDependency,
    ServiceDescriptor,
};
pub use table::ServiceTable;
