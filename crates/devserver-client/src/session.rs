//! Scoped DevServer sessions
//!
//! `DevServerGuard::acquire` creates a DevServer and waits for it to run;
//! `release` deletes it. A guard dropped without `release` still schedules the
//! delete on the current runtime.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crate::resources::NewDevServer;
use crate::status::{DevServerWatchSource, StatusPredicate, WatchOptions, watch_for_status};
use crds::{DevServer, DevServerPhase};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// A running DevServer that is deleted when the guard is released or dropped
pub struct DevServerGuard<C: ClusterClientTrait + ?Sized + 'static> {
    client: Arc<C>,
    namespace: String,
    name: String,
    devserver: DevServer,
    released: bool,
}

impl<C: ClusterClientTrait + ?Sized + 'static> DevServerGuard<C> {
    /// Create the DevServer and wait until it is `Running`.
    ///
    /// If the wait fails the DevServer is deleted before the error is returned.
    pub async fn acquire<S>(
        client: Arc<C>,
        source: Arc<S>,
        request: NewDevServer,
        options: WatchOptions,
    ) -> Result<Self, ClientError>
    where
        S: DevServerWatchSource + ?Sized + 'static,
    {
        let namespace = request.namespace.clone();
        let name = request.name.clone();
        let devserver = request.build()?;
        client.create_devserver(&devserver).await?;

        let mut guard = Self {
            client,
            namespace: namespace.clone(),
            name: name.clone(),
            devserver,
            released: false,
        };

        let running = watch_for_status(
            source,
            &namespace,
            &name,
            StatusPredicate::phase(DevServerPhase::Running),
            options,
        )
        .wait()
        .await;

        match running {
            Ok(devserver) => {
                info!("DevServer {}/{} is running", namespace, name);
                guard.devserver = devserver;
                Ok(guard)
            }
            Err(err) => {
                if let Err(cleanup) = guard.delete().await {
                    warn!("Failed to clean up DevServer {}/{}: {}", namespace, name, cleanup);
                }
                Err(err)
            }
        }
    }

    /// The DevServer as last observed
    pub fn devserver(&self) -> &DevServer {
        &self.devserver
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn delete(&mut self) -> Result<(), ClientError> {
        self.released = true;
        match self.client.delete_devserver(&self.namespace, &self.name).await {
            Err(ClientError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Delete the DevServer.
    pub async fn release(mut self) -> Result<(), ClientError> {
        self.delete().await
    }
}

impl<C: ClusterClientTrait + ?Sized + 'static> Drop for DevServerGuard<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("DevServer {}/{} dropped outside a runtime, not deleted", self.namespace, self.name);
            return;
        };
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            if let Err(err) = client.delete_devserver(&namespace, &name).await {
                if !err.is_not_found() {
                    warn!("Failed to delete DevServer {}/{}: {}", namespace, name, err);
                }
            }
        });
    }
}

/// Run `f` against a fresh DevServer, deleting it afterwards.
pub async fn with_devserver<C, S, F, Fut, T>(
    client: Arc<C>,
    source: Arc<S>,
    request: NewDevServer,
    options: WatchOptions,
    f: F,
) -> Result<T, ClientError>
where
    C: ClusterClientTrait + ?Sized + 'static,
    S: DevServerWatchSource + ?Sized + 'static,
    F: FnOnce(DevServer) -> Fut,
    Fut: Future<Output = T>,
{
    let guard = DevServerGuard::acquire(client, source, request, options).await?;
    let output = f(guard.devserver().clone()).await;
    guard.release().await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClusterClient;
    use crds::DevServerStatus;
    use std::time::Duration;

    fn request() -> NewDevServer {
        NewDevServer::new("box", "dev", "alice", "ssh-ed25519 AAAA").unwrap()
    }

    fn options(timeout_ms: u64) -> WatchOptions {
        WatchOptions {
            timeout: Duration::from_millis(timeout_ms),
            max_reconnects: 1,
            reconnect_delay: Duration::from_millis(1),
        }
    }

    /// Mark the DevServer running once it shows up, as the operator would.
    fn run_operator(client: Arc<MockClusterClient>) {
        tokio::spawn(async move {
            for _ in 0..200 {
                if client.devserver("dev", "box").is_some() {
                    let status = DevServerStatus {
                        phase: DevServerPhase::Running,
                        ..Default::default()
                    };
                    let _ = client.patch_devserver_status("dev", "box", &status).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_with_devserver_deletes_afterwards() {
        let client = Arc::new(MockClusterClient::new());
        run_operator(client.clone());

        let phase = with_devserver(client.clone(), client.clone(), request(), options(2_000), |ds| async move {
            ds.phase()
        })
        .await
        .unwrap();

        assert_eq!(phase, DevServerPhase::Running);
        assert!(client.devserver("dev", "box").is_none());
    }

    #[tokio::test]
    async fn test_acquire_timeout_cleans_up() {
        let client = Arc::new(MockClusterClient::new());

        let result = DevServerGuard::acquire(client.clone(), client.clone(), request(), options(50)).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert!(client.devserver("dev", "box").is_none());
    }

    #[tokio::test]
    async fn test_dropped_guard_still_deletes() {
        let client = Arc::new(MockClusterClient::new());
        run_operator(client.clone());

        let guard = DevServerGuard::acquire(client.clone(), client.clone(), request(), options(2_000))
            .await
            .unwrap();
        drop(guard);

        for _ in 0..100 {
            if client.devserver("dev", "box").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("DevServer was not deleted after the guard was dropped");
    }
}
