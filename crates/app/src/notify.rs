use std::{
    collections::HashMap,
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use axum::response::sse::Event;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, warn};

use jobboard_core::types::{Notification, NotificationKind};
use jobboard_storage::{Database, NewNotification, RepoError};

use crate::router::Clock;

const EVENT_NAME: &str = "notification";
const BROADCAST_BUFFER: usize = 256;

type Channels = Arc<RwLock<HashMap<String, broadcast::Sender<Arc<Notification>>>>>;

/// Per-user broadcast channels for live notification streams.
#[derive(Clone, Default)]
pub struct NotificationHub {
    channels: Channels,
    clients: Arc<AtomicUsize>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a stream for `user_id`. The connection is counted until the
    /// returned stream is dropped.
    pub async fn subscribe(&self, user_id: &str) -> NotificationStream {
        let receiver = {
            let mut channels = self.channels.write().await;
            channels
                .entry(user_id.to_string())
                .or_insert_with(|| broadcast::channel(BROADCAST_BUFFER).0)
                .subscribe()
        };

        let guard = ClientGuard::new(self.clients.clone(), self.channels.clone(), user_id);
        let user = user_id.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |result| match result {
            Ok(notification) => match serde_json::to_string(notification.as_ref()) {
                Ok(data) => Some(Ok(Event::default()
                    .id(notification.id.clone())
                    .event(EVENT_NAME)
                    .data(data))),
                Err(err) => {
                    warn!(
                        stage = "notify",
                        user_id = %user,
                        error = %err,
                        "failed to encode notification"
                    );
                    None
                }
            },
            Err(err) => {
                debug!(stage = "notify", user_id = %user, error = %err, "stream lagged");
                None
            }
        });

        NotificationStream {
            inner: Box::pin(live),
            _guard: guard,
        }
    }

    /// Sends to every open stream of the user. Returns how many received it.
    pub async fn publish(&self, notification: Notification) -> usize {
        let user_id = notification.user_id.clone();
        let sender = self.channels.read().await.get(&user_id).cloned();
        let Some(sender) = sender else {
            return 0;
        };

        match sender.send(Arc::new(notification)) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Every stream of this user is gone.
                prune_idle(&mut *self.channels.write().await, &user_id);
                0
            }
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// Persists notifications, then fans them out to the user's live streams.
#[derive(Clone)]
pub struct Notifier {
    database: Database,
    hub: NotificationHub,
    clock: Clock,
}

impl Notifier {
    pub fn new(database: Database, hub: NotificationHub, clock: Clock) -> Self {
        Self {
            database,
            hub,
            clock,
        }
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub async fn notify(
        &self,
        user_id: &str,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
        data: Value,
    ) -> Result<Notification, RepoError> {
        let notification = self
            .database
            .notifications()
            .insert(NewNotification {
                user_id: user_id.to_string(),
                kind,
                title: title.into(),
                body: body.into(),
                data,
                created_at: (self.clock)(),
            })
            .await?;

        counter!("notifications_sent_total", "kind" => kind.as_str()).increment(1);
        let delivered = self.hub.publish(notification.clone()).await;
        debug!(stage = "notify", %user_id, kind = kind.as_str(), delivered, "notification stored");
        Ok(notification)
    }
}

pub struct NotificationStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl Stream for NotificationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

/// Drops the user's channel once no stream is listening on it.
fn prune_idle(
    channels: &mut HashMap<String, broadcast::Sender<Arc<Notification>>>,
    user_id: &str,
) {
    if channels
        .get(user_id)
        .is_some_and(|sender| sender.receiver_count() == 0)
    {
        channels.remove(user_id);
    }
}

/// Counts one open stream. `NotificationStream` drops its receiver before
/// this guard, so the pruning check sees the final receiver count.
struct ClientGuard {
    clients: Arc<AtomicUsize>,
    channels: Channels,
    user_id: String,
}

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>, channels: Channels, user_id: &str) -> Self {
        let value = clients.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("notification_clients").set(value as f64);
        Self {
            clients,
            channels,
            user_id: user_id.to_string(),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let value = self.clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("notification_clients").set(value as f64);

        if let Ok(mut channels) = self.channels.try_write() {
            prune_idle(&mut channels, &self.user_id);
            return;
        }
        // The map is busy; prune once it frees up.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channels = self.channels.clone();
            let user_id = std::mem::take(&mut self.user_id);
            runtime.spawn(async move {
                prune_idle(&mut *channels.write().await, &user_id);
            });
        }
    }
}
