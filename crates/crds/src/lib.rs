//! DevServer CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the DevServer operator:
//! - `DevServer`: one user's development environment (namespaced)
//! - `DevServerFlavor`: a named resource template (cluster-scoped)
//! - `DevServerUser`: access and quota record for an identity (cluster-scoped)

pub mod devserver;
pub mod duration;
pub mod error;
pub mod flavor;
pub mod quantity;
pub mod time;
pub mod user;

pub use devserver::*;
pub use error::CrdError;
pub use flavor::*;
pub use user::*;

/// API group shared by all DevServer CRDs
pub const API_GROUP: &str = "devserver.io";

/// API version shared by all DevServer CRDs
pub const API_VERSION: &str = "v1";
