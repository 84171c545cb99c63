//! Reconciliation dispatcher.
//!
//! Watch deltas are routed through a table keyed by (resource kind, event
//! type). Handlers run concurrently across keys up to the worker limit, but
//! at most one handler runs per resource key; deltas arriving meanwhile wait
//! in that key's queue and are handled in arrival order.

use crate::backoff::RequeueTracker;
use crate::error::ControllerError;
use crds::{DevServer, DevServerFlavor, DevServerUser};
use kube::ResourceExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Resource kinds the dispatcher routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DevServer,
    Flavor,
    User,
}

/// Watch event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// The object carried by a delta
#[derive(Debug, Clone)]
pub enum ResourceObject {
    DevServer(Box<DevServer>),
    Flavor(Box<DevServerFlavor>),
    User(Box<DevServerUser>),
}

/// Identity used to serialize handling
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?} {}", self.kind, self.name),
        }
    }
}

/// One watch notification
#[derive(Debug, Clone)]
pub struct Delta {
    pub event_type: EventType,
    pub object: ResourceObject,
}

impl Delta {
    pub fn devserver(event_type: EventType, devserver: DevServer) -> Self {
        Self {
            event_type,
            object: ResourceObject::DevServer(Box::new(devserver)),
        }
    }

    pub fn flavor(event_type: EventType, flavor: DevServerFlavor) -> Self {
        Self {
            event_type,
            object: ResourceObject::Flavor(Box::new(flavor)),
        }
    }

    pub fn user(event_type: EventType, user: DevServerUser) -> Self {
        Self {
            event_type,
            object: ResourceObject::User(Box::new(user)),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self.object {
            ResourceObject::DevServer(_) => ResourceKind::DevServer,
            ResourceObject::Flavor(_) => ResourceKind::Flavor,
            ResourceObject::User(_) => ResourceKind::User,
        }
    }

    pub fn key(&self) -> ResourceKey {
        let (namespace, name) = match &self.object {
            ResourceObject::DevServer(o) => (o.namespace(), o.name_any()),
            ResourceObject::Flavor(o) => (None, o.name_any()),
            ResourceObject::User(o) => (None, o.name_any()),
        };
        ResourceKey {
            kind: self.kind(),
            namespace,
            name,
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ControllerError>> + Send>>;

/// A delta handler
pub type Handler = Arc<dyn Fn(Delta) -> HandlerFuture + Send + Sync>;

/// Routes (kind, event type) to a handler, built once at startup
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<(ResourceKind, EventType), Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event type in `events`.
    pub fn on<F, Fut>(mut self, kind: ResourceKind, events: &[EventType], handler: F) -> Self
    where
        F: Fn(Delta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |delta: Delta| -> HandlerFuture { Box::pin(handler(delta)) });
        for event in events {
            self.handlers.insert((kind, *event), handler.clone());
        }
        self
    }

    pub fn get(&self, kind: ResourceKind, event: EventType) -> Option<&Handler> {
        self.handlers.get(&(kind, event))
    }
}

struct Inner {
    table: DispatchTable,
    workers: Semaphore,
    /// Keys with a handler in flight, and the deltas waiting behind it
    keys: Mutex<HashMap<ResourceKey, VecDeque<Delta>>>,
    requeue: RequeueTracker,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Bounded, per-key serialized delta processing
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(table: DispatchTable, worker_limit: usize, requeue: RequeueTracker, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                workers: Semaphore::new(worker_limit.max(1)),
                keys: Mutex::new(HashMap::new()),
                requeue,
                tasks: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Queue `delta` for handling.
    pub fn submit(&self, delta: Delta) {
        if self.inner.table.get(delta.kind(), delta.event_type).is_none() {
            debug!("No handler for {:?} {:?}, ignoring", delta.kind(), delta.event_type);
            return;
        }
        if self.inner.shutdown.is_cancelled() {
            debug!("Shutting down, dropping {:?} for {}", delta.event_type, delta.key());
            return;
        }

        let key = delta.key();
        {
            let mut keys = lock(&self.inner.keys);
            if let Some(queue) = keys.get_mut(&key) {
                // A newer delta of the same type supersedes the one still waiting
                match queue.back_mut() {
                    Some(last) if last.event_type == delta.event_type => *last = delta,
                    _ => queue.push_back(delta),
                }
                return;
            }
            keys.insert(key.clone(), VecDeque::new());
        }

        let dispatcher = self.clone();
        self.inner.tasks.spawn(async move { dispatcher.drive(key, delta).await });
    }

    /// Handle `first` and then whatever queued up behind it for `key`.
    async fn drive(&self, key: ResourceKey, first: Delta) {
        let mut next = Some(first);
        while let Some(delta) = next {
            match self.inner.workers.acquire().await {
                Ok(_permit) => self.handle(&key, delta).await,
                Err(_) => {
                    warn!("Worker pool closed, abandoning {}", key);
                    lock(&self.inner.keys).remove(&key);
                    return;
                }
            }

            next = {
                let mut keys = lock(&self.inner.keys);
                let queued = keys.get_mut(&key).and_then(VecDeque::pop_front);
                if queued.is_none() {
                    keys.remove(&key);
                }
                queued
            };
        }
    }

    async fn handle(&self, key: &ResourceKey, delta: Delta) {
        let Some(handler) = self.inner.table.get(delta.kind(), delta.event_type).cloned() else {
            return;
        };
        let retry_key = key.to_string();
        debug!("Handling {:?} for {}", delta.event_type, key);

        match handler(delta.clone()).await {
            Ok(()) => self.inner.requeue.reset(&retry_key),
            Err(e) if e.is_terminal() => {
                warn!("Giving up on {} until it changes: {}", key, e);
                self.inner.requeue.reset(&retry_key);
            }
            Err(e) => {
                let (delay, failures) = self.inner.requeue.record_failure(&retry_key);
                error!(
                    "Handling {} failed ({} consecutive), requeueing in {:?}: {}",
                    key, failures, delay, e
                );
                self.requeue_after(retry_key, delta, delay);
            }
        }
    }

    fn requeue_after(&self, retry_key: String, delta: Delta, delay: std::time::Duration) {
        let dispatcher = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = dispatcher.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // A later success for the key already covered this delta
                    if dispatcher.inner.requeue.error_count(&retry_key) > 0 {
                        dispatcher.submit(delta);
                    }
                }
            }
        });
    }

    /// Stop accepting deltas and wait for in-flight handlers to finish.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Dispatcher drained");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
