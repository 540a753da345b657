//! Capsule custom resources this controller reads and writes.
//!
//! Only the fields needed here are modelled, everything else is ignored on deserialization.

pub mod global_tenant_resource;
pub mod tenant;

pub use global_tenant_resource::{GlobalTenantResource, GlobalTenantResourceSpec, ResourceSpec};
pub use tenant::{OwnerKind, OwnerSpec, Tenant, TenantSpec};
