//! DevServer cluster client
//!
//! The Kubernetes API seam shared by the operator and SDK consumers.
//!
//! # Example
//!
//! ```no_run
//! use devserver_client::{ClusterClient, DevServers, NewDevServer, StatusPredicate, WatchOptions, watch_for_status};
//! use crds::DevServerPhase;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), devserver_client::ClientError> {
//! let client = Arc::new(ClusterClient::try_default().await?);
//! let devservers = DevServers::new(client.clone(), "dev-alice");
//!
//! let request = NewDevServer::new("scratch", "dev-alice", "alice", "ssh-ed25519 AAAA...")?
//!     .flavor("cpu-small")
//!     .time_to_live("4h");
//! devservers.create(request).await?;
//!
//! let running = watch_for_status(
//!     client.clone(),
//!     "dev-alice",
//!     "scratch",
//!     StatusPredicate::phase(DevServerPhase::Running),
//!     WatchOptions::default(),
//! )
//! .wait()
//! .await?;
//! # let _ = running;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Cluster seam**: `ClusterClientTrait` with a kube-backed implementation
//! - **Status watching**: cancellable subscriptions with timeout and reconnect
//! - **Exec and sync**: remote commands and tar-based workspace upload
//! - **Typed CRUD**: validated constructors for DevServers, flavors and users
//! - **test-util**: `MockClusterClient` for unit tests

pub mod client;
pub mod error;
pub mod exec;
pub mod models;
pub mod resources;
pub mod session;
pub mod status;
pub mod subset;
pub mod sync;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::ClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClientError;
pub use exec::{ExecCommand, exec_devserver};
pub use models::*;
pub use resources::{DevServers, Flavors, NewDevServer, Users};
pub use session::{DevServerGuard, with_devserver};
pub use status::{
    DevServerWatchSource, StatusEvent, StatusPredicate, StatusSubscription, WatchEventType,
    WatchOptions, watch_for_status,
};
pub use subset::is_subset;
pub use sync::sync_workspace;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, MockCounters, MockOp};
