//! Watch-for-status subscriptions
//!
//! `watch_for_status` turns a DevServer watch into a cancellable sequence of
//! events that ends once a predicate matches. Every (re)connect starts with a
//! relist so nothing missed while disconnected is assumed replayable.

use crate::client::ClusterClient;
use crate::error::ClientError;
use crate::subset::is_subset;
use crds::{DevServer, DevServerPhase};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::Api;
use kube_runtime::watcher;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Kind of watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    /// Current state from the relist that starts every connection
    Synced,
    Added,
    Modified,
    Deleted,
}

/// An observed DevServer state
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub event_type: WatchEventType,
    pub object: DevServer,
}

impl StatusEvent {
    pub fn new(event_type: WatchEventType, object: DevServer) -> Self {
        Self { event_type, object }
    }
}

/// Source of DevServer watch connections
///
/// Each call to `open` is one connection. The stream must begin with the
/// object's current state and ends (or yields an error) when the connection drops.
#[async_trait::async_trait]
pub trait DevServerWatchSource: Send + Sync {
    async fn open(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatusEvent, ClientError>>, ClientError>;
}

#[async_trait::async_trait]
impl DevServerWatchSource for ClusterClient {
    async fn open(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatusEvent, ClientError>>, ClientError> {
        let api: Api<DevServer> = Api::namespaced(self.kube_client(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let events = watcher(api, config).filter_map(|item| async move {
            match item {
                Ok(watcher::Event::InitApply(obj)) => Some(Ok(StatusEvent::new(WatchEventType::Synced, obj))),
                Ok(watcher::Event::Apply(obj)) => Some(Ok(StatusEvent::new(WatchEventType::Modified, obj))),
                Ok(watcher::Event::Delete(obj)) => Some(Ok(StatusEvent::new(WatchEventType::Deleted, obj))),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(ClientError::Stream(e.to_string()))),
            }
        });
        Ok(events.boxed())
    }
}

/// Condition a DevServer must reach
#[derive(Clone)]
pub struct StatusPredicate(Arc<dyn Fn(&DevServer) -> bool + Send + Sync>);

impl StatusPredicate {
    pub fn new(f: impl Fn(&DevServer) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Status phase equals `phase`.
    pub fn phase(phase: DevServerPhase) -> Self {
        Self::new(move |ds| ds.phase() == phase)
    }

    /// Status contains every field of `expected`.
    pub fn status_subset(expected: serde_json::Value) -> Self {
        Self::new(move |ds| {
            ds.status
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok())
                .is_some_and(|actual| is_subset(&expected, &actual))
        })
    }

    pub fn matches(&self, devserver: &DevServer) -> bool {
        (self.0)(devserver)
    }
}

impl std::fmt::Debug for StatusPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StatusPredicate")
    }
}

/// Deadline and reconnect policy
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Overall deadline for the predicate to match
    pub timeout: Duration,
    /// Consecutive failed connections tolerated before giving up
    pub max_reconnects: u32,
    /// Pause between reconnects
    pub reconnect_delay: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_reconnects: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl WatchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Handle to a running status watch
///
/// Yields events until the predicate matches (then ends), or yields a single
/// `Timeout` / `Stream` error. Dropping or cancelling the handle aborts the
/// background task, which drops the watch connection.
pub struct StatusSubscription {
    rx: mpsc::Receiver<Result<StatusEvent, ClientError>>,
    task: JoinHandle<()>,
}

impl StatusSubscription {
    /// Next event, `None` once the watch has finished.
    pub async fn next_event(&mut self) -> Option<Result<StatusEvent, ClientError>> {
        self.rx.recv().await
    }

    /// Stop watching and close the connection.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.rx.close();
    }

    /// Drain the subscription and return the object that matched.
    pub async fn wait(mut self) -> Result<DevServer, ClientError> {
        let mut last = None;
        while let Some(item) = self.rx.recv().await {
            last = Some(item?.object);
        }
        last.ok_or_else(|| ClientError::Stream("watch ended without a matching event".to_string()))
    }
}

impl Stream for StatusSubscription {
    type Item = Result<StatusEvent, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch a DevServer until `predicate` holds.
pub fn watch_for_status<S>(
    source: Arc<S>,
    namespace: &str,
    name: &str,
    predicate: StatusPredicate,
    options: WatchOptions,
) -> StatusSubscription
where
    S: DevServerWatchSource + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let namespace = namespace.to_string();
    let name = name.to_string();
    let task = tokio::spawn(async move {
        run_watch(source, namespace, name, predicate, options, tx).await;
    });
    StatusSubscription { rx, task }
}

enum ConnectionOutcome {
    Matched,
    ReceiverGone,
    Terminal(ClientError),
    Dropped {
        error: Option<ClientError>,
        progressed: bool,
    },
}

async fn run_watch<S>(
    source: Arc<S>,
    namespace: String,
    name: String,
    predicate: StatusPredicate,
    options: WatchOptions,
    tx: mpsc::Sender<Result<StatusEvent, ClientError>>,
) where
    S: DevServerWatchSource + ?Sized,
{
    let deadline = Instant::now() + options.timeout;
    let mut failures = 0u32;

    loop {
        let connection = watch_connection(&*source, &namespace, &name, &predicate, &tx);
        let outcome = match tokio::time::timeout_at(deadline, connection).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let _ = tx
                    .send(Err(ClientError::Timeout(format!(
                        "DevServer {}/{} did not reach the requested status within {:?}",
                        namespace, name, options.timeout
                    ))))
                    .await;
                return;
            }
        };

        match outcome {
            ConnectionOutcome::Matched | ConnectionOutcome::ReceiverGone => return,
            ConnectionOutcome::Terminal(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
            ConnectionOutcome::Dropped { error, progressed } => {
                if progressed {
                    failures = 0;
                }
                if let Some(err) = error {
                    failures += 1;
                    warn!(
                        "Watch on DevServer {}/{} dropped ({}), attempt {}/{}",
                        namespace, name, err, failures, options.max_reconnects
                    );
                    if failures > options.max_reconnects {
                        let _ = tx
                            .send(Err(ClientError::Stream(format!(
                                "watch on DevServer {}/{} failed after {} reconnect attempts: {}",
                                namespace, name, options.max_reconnects, err
                            ))))
                            .await;
                        return;
                    }
                } else {
                    debug!("Watch on DevServer {}/{} ended, reconnecting", namespace, name);
                }

                let _ = tokio::time::timeout_at(deadline, tokio::time::sleep(options.reconnect_delay)).await;
            }
        }
    }
}

async fn watch_connection<S>(
    source: &S,
    namespace: &str,
    name: &str,
    predicate: &StatusPredicate,
    tx: &mpsc::Sender<Result<StatusEvent, ClientError>>,
) -> ConnectionOutcome
where
    S: DevServerWatchSource + ?Sized,
{
    let mut stream = match source.open(namespace, name).await {
        Ok(stream) => stream,
        Err(err) if err.is_not_found() => return ConnectionOutcome::Terminal(err),
        Err(err) => {
            return ConnectionOutcome::Dropped {
                error: Some(err),
                progressed: false,
            };
        }
    };

    let mut progressed = false;
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                return ConnectionOutcome::Dropped {
                    error: Some(err),
                    progressed,
                };
            }
        };
        progressed = true;

        let deleted = event.event_type == WatchEventType::Deleted;
        let matched = !deleted && predicate.matches(&event.object);
        if tx.send(Ok(event)).await.is_err() {
            return ConnectionOutcome::ReceiverGone;
        }
        if matched {
            return ConnectionOutcome::Matched;
        }
        if deleted {
            return ConnectionOutcome::Terminal(ClientError::NotFound(format!(
                "DevServer {}/{} was deleted while waiting",
                namespace, name
            )));
        }
    }

    ConnectionOutcome::Dropped {
        error: None,
        progressed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{DevServerSpec, DevServerStatus};
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Connection = Result<Vec<Result<StatusEvent, ClientError>>, ClientError>;

    /// Replays one scripted connection per `open`; hangs once the script runs out.
    struct ScriptedSource {
        connections: Mutex<VecDeque<Connection>>,
        opened: Mutex<u32>,
    }

    impl ScriptedSource {
        fn new(connections: Vec<Connection>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                opened: Mutex::new(0),
            })
        }

        fn opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl DevServerWatchSource for ScriptedSource {
        async fn open(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<BoxStream<'static, Result<StatusEvent, ClientError>>, ClientError> {
            *self.opened.lock().unwrap() += 1;
            let next = self.connections.lock().unwrap().pop_front();
            match next {
                Some(Ok(events)) => Ok(stream::iter(events).boxed()),
                Some(Err(err)) => Err(err),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn devserver(phase: DevServerPhase) -> DevServer {
        let mut ds = DevServer::new("box", DevServerSpec::default());
        ds.metadata.namespace = Some("dev".to_string());
        ds.status = Some(DevServerStatus {
            phase,
            ..Default::default()
        });
        ds
    }

    fn event(event_type: WatchEventType, phase: DevServerPhase) -> Result<StatusEvent, ClientError> {
        Ok(StatusEvent::new(event_type, devserver(phase)))
    }

    fn fast(timeout_ms: u64, max_reconnects: u32) -> WatchOptions {
        WatchOptions {
            timeout: Duration::from_millis(timeout_ms),
            max_reconnects,
            reconnect_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_ends_when_predicate_matches() {
        let source = ScriptedSource::new(vec![Ok(vec![
            event(WatchEventType::Synced, DevServerPhase::Pending),
            event(WatchEventType::Modified, DevServerPhase::Running),
            event(WatchEventType::Modified, DevServerPhase::Failed),
        ])]);

        let mut sub = watch_for_status(
            source,
            "dev",
            "box",
            StatusPredicate::phase(DevServerPhase::Running),
            fast(1_000, 0),
        );

        let first = sub.next_event().await.unwrap().unwrap();
        assert_eq!(first.event_type, WatchEventType::Synced);
        let second = sub.next_event().await.unwrap().unwrap();
        assert_eq!(second.object.phase(), DevServerPhase::Running);
        assert!(sub.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnects_with_relist() {
        let source = ScriptedSource::new(vec![
            Ok(vec![
                event(WatchEventType::Synced, DevServerPhase::Pending),
                Err(ClientError::Transient("connection reset".to_string())),
            ]),
            Ok(vec![event(WatchEventType::Synced, DevServerPhase::Running)]),
        ]);

        let sub = watch_for_status(
            source.clone(),
            "dev",
            "box",
            StatusPredicate::status_subset(serde_json::json!({"phase": "Running"})),
            fast(1_000, 1),
        );

        let ds = sub.wait().await.unwrap();
        assert_eq!(ds.phase(), DevServerPhase::Running);
        assert_eq!(source.opened(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let source = ScriptedSource::new(vec![Ok(vec![event(
            WatchEventType::Synced,
            DevServerPhase::Pending,
        )])]);

        let sub = watch_for_status(
            source,
            "dev",
            "box",
            StatusPredicate::phase(DevServerPhase::Running),
            fast(50, 3),
        );

        assert!(matches!(sub.wait().await, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stream_error_after_reconnect_budget() {
        let source = ScriptedSource::new(vec![
            Err(ClientError::Transient("down".to_string())),
            Err(ClientError::Transient("down".to_string())),
            Err(ClientError::Transient("down".to_string())),
        ]);

        let sub = watch_for_status(
            source.clone(),
            "dev",
            "box",
            StatusPredicate::phase(DevServerPhase::Running),
            fast(5_000, 2),
        );

        assert!(matches!(sub.wait().await, Err(ClientError::Stream(_))));
        assert_eq!(source.opened(), 3);
    }

    #[tokio::test]
    async fn test_deleted_while_waiting() {
        let source = ScriptedSource::new(vec![Ok(vec![
            event(WatchEventType::Synced, DevServerPhase::Pending),
            event(WatchEventType::Deleted, DevServerPhase::Pending),
        ])]);

        let sub = watch_for_status(
            source,
            "dev",
            "box",
            StatusPredicate::phase(DevServerPhase::Running),
            fast(1_000, 0),
        );

        assert!(matches!(sub.wait().await, Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_watch() {
        let source = ScriptedSource::new(vec![]);
        let mut sub = watch_for_status(
            source,
            "dev",
            "box",
            StatusPredicate::phase(DevServerPhase::Running),
            fast(10_000, 0),
        );

        sub.cancel();
        assert!(sub.next_event().await.is_none());
    }
}
