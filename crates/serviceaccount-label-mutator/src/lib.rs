//! A Kubernetes mutating admission webhook which adds labels to
//! ServiceAccounts.
//!
//! Two policies exist. A ServiceAccount labelled with
//! [`MANAGED_IDENTITY_NAME_LABEL`][policy::MANAGED_IDENTITY_NAME_LABEL] gets
//! the client ID of the named Azure user-assigned managed identity set as
//! [`WORKLOAD_IDENTITY_CLIENT_ID_LABEL`][policy::WORKLOAD_IDENTITY_CLIENT_ID_LABEL].
//! Optionally, a static trigger label can be echoed into another label. All
//! other objects are admitted unchanged.
pub mod cli;
pub mod context;
pub mod handler;
pub mod identity;
pub mod patch;
pub mod policy;
