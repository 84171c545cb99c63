//! Kubernetes Event posting, gated by `postingEnabled`.

use devserver_client::{ClusterClientTrait, EventRecord};
use kube::Resource;
use std::sync::Arc;
use tracing::{debug, warn};

/// Publishes Events about operator resources when posting is enabled
#[derive(Clone)]
pub struct EventPublisher {
    client: Arc<dyn ClusterClientTrait>,
    enabled: bool,
}

impl EventPublisher {
    pub fn new(client: Arc<dyn ClusterClientTrait>, enabled: bool) -> Self {
        Self { client, enabled }
    }

    /// Post `event` about `object`. Failures are logged; an Event is never
    /// worth failing a reconciliation over.
    pub async fn publish<K>(&self, object: &K, event: EventRecord)
    where
        K: Resource<DynamicType = ()>,
    {
        if !self.enabled {
            debug!("Event posting disabled, dropping {} event", event.reason);
            return;
        }
        let reference = object.object_ref(&());
        if let Err(e) = self.client.publish_event(&reference, &event).await {
            warn!(
                "Failed to publish {} event for {}: {}",
                event.reason,
                reference.name.as_deref().unwrap_or_default(),
                e
            );
        }
    }
}
