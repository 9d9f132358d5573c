// src/workspace/mod.rs
//! Filesystem sandbox
//!
//! - **Sandbox**: path resolution, identifier validation, bounded copy
//! - **Manager**: per-user workspaces, materials, notebook provisioning
//! - **Bundle**: zipping many material files with per-item skip
//!
//! Nothing in here holds shared state; every call re-validates against the
//! filesystem as it is at that moment.

pub mod bundle;
pub mod manager;
pub mod sandbox;

// Re-export commonly used types
pub use bundle::{bundle_file_name, bundle_materials, Bundle, SkippedItem};
pub use manager::{Provisioned, WorkspaceManager};
pub use sandbox::{resolve, safe_copy, sanitize_component, validate_identifier};
