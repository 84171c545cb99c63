//! Watch support for the mock, fed by the DevServer change broadcast

use super::MockClusterClient;
use crate::error::ClientError;
use crate::status::{DevServerWatchSource, StatusEvent, WatchEventType};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::ResourceExt;
use tokio::sync::broadcast::error::RecvError;

#[async_trait::async_trait]
impl DevServerWatchSource for MockClusterClient {
    async fn open(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatusEvent, ClientError>>, ClientError> {
        // Subscribe before reading so no change slips between relist and watch
        let rx = self.changes.subscribe();
        let current = self
            .devserver(namespace, name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServer {}/{}", namespace, name)))?;

        let namespace = namespace.to_string();
        let name = name.to_string();
        let updates = stream::unfold(rx, move |mut rx| {
            let namespace = namespace.clone();
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((event_type, ds))
                            if ds.namespace().as_deref() == Some(namespace.as_str())
                                && ds.name_any() == name =>
                        {
                            return Some((Ok(StatusEvent::new(event_type, ds)), rx));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(n)) => {
                            return Some((
                                Err(ClientError::Stream(format!("watch lagged by {} events", n))),
                                rx,
                            ));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        let initial = stream::once(async move { Ok(StatusEvent::new(WatchEventType::Synced, current)) });
        Ok(initial.chain(updates).boxed())
    }
}
