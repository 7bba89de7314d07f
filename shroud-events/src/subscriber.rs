use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use shroud_utils::spawn_with_shutdown;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{instrument, trace};

use crate::events::{ChannelKey, ResultEvent};

pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Identifier handed out for each registration
pub type ListenerId = u64;

struct Listener {
    channel: ChannelKey,
    sender: oneshot::Sender<ResultEvent>,
}

#[derive(Default)]
struct ListenerRegistry {
    listeners: DashMap<ListenerId, Listener>,
    next_id: AtomicU64,
}

/// Registry of single-shot listeners waiting on result channels.
///
/// Cloning is cheap and every clone shares the same registry. Events are not
/// buffered: an event published while nobody listens on its channel is
/// dropped, so callers subscribe before submitting the request that will
/// produce the event.
#[derive(Clone, Default)]
pub struct ResultListeners {
    inner: Arc<ListenerRegistry>,
}

impl ResultListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `channel`.
    ///
    /// The returned [`Subscription`] deregisters itself when dropped, whether
    /// or not an event was received.
    #[must_use]
    pub fn subscribe(&self, channel: ChannelKey) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        trace!(
            target = "shroud-events",
            event = "listener_registered",
            listener_id = id,
            channel = %channel,
            "Registered result listener"
        );
        self.inner.listeners.insert(
            id,
            Listener {
                channel: channel.clone(),
                sender,
            },
        );
        Subscription {
            id,
            channel,
            receiver: Some(receiver),
            registry: Arc::clone(&self.inner),
        }
    }

    /// Delivers `event` to every listener whose channel matches it.
    ///
    /// Each matching listener is removed before delivery, so a registration
    /// sees at most one event.
    ///
    /// # Returns
    /// The number of listeners that received the event
    pub fn publish(&self, event: &ResultEvent) -> usize {
        let matching = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.value().channel.matches(event))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        matching
            .into_iter()
            .filter_map(|id| self.inner.listeners.remove(&id))
            .filter_map(|(_, listener)| listener.sender.send(event.clone()).ok())
            .count()
    }

    /// Number of registrations still waiting for an event
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.listeners.is_empty()
    }

    /// Drops every pending registration; waiting subscriptions observe
    /// `SubscriberError::ChannelClosed`
    pub fn clear(&self) {
        self.inner.listeners.clear();
    }
}

/// A registration on a result channel, released on drop
pub struct Subscription {
    id: ListenerId,
    channel: ChannelKey,
    receiver: Option<oneshot::Receiver<ResultEvent>>,
    registry: Arc<ListenerRegistry>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub const fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    /// Waits until an event arrives on this channel
    ///
    /// # Errors
    ///
    /// Returns `SubscriberError::ChannelClosed` if the registration was
    /// dropped by the registry before an event arrived
    pub async fn recv(mut self) -> Result<ResultEvent> {
        let receiver = self.receiver.take().ok_or(SubscriberError::ChannelClosed {
            channel: self.channel.to_string(),
        })?;
        receiver.await.map_err(|_| SubscriberError::ChannelClosed {
            channel: self.channel.to_string(),
        })
    }

    /// Waits at most `timeout` for an event on this channel
    ///
    /// # Errors
    ///
    /// Returns `SubscriberError::ChannelTimeout` if the deadline passes first,
    /// or `SubscriberError::ChannelClosed` as for [`Subscription::recv`]
    pub async fn recv_timeout(self, timeout: Duration) -> Result<ResultEvent> {
        let channel = self.channel.to_string();
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(SubscriberError::ChannelTimeout { channel, timeout }),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registry.listeners.remove(&self.id).is_some() {
            trace!(
                target = "shroud-events",
                event = "listener_released",
                listener_id = self.id,
                channel = %self.channel,
                "Released result listener without an event"
            );
        }
    }
}

/// Single-shot wait on `channel`: subscribe, wait up to `timeout`, release
///
/// # Errors
///
/// See [`Subscription::recv_timeout`]
pub async fn await_result(
    listeners: &ResultListeners,
    channel: ChannelKey,
    timeout: Duration,
) -> Result<ResultEvent> {
    listeners.subscribe(channel).recv_timeout(timeout).await
}

/// Service that forwards incoming result events to registered listeners.
///
/// Events arrive on a `flume` channel fed by whatever observes the remote
/// system; the loop stops when that channel closes or when the shutdown
/// signal flips to `true`.
pub struct ResultEventSubscriber {
    /// Registry the events are dispatched to
    listeners: ResultListeners,
    /// Channel receiver for incoming result events
    event_receiver: flume::Receiver<ResultEvent>,
    /// Signal receiver for coordinating graceful shutdown of the service
    shutdown_signal: watch::Receiver<bool>,
}

impl ResultEventSubscriber {
    /// Constructor
    #[must_use]
    pub const fn new(
        listeners: ResultListeners,
        event_receiver: flume::Receiver<ResultEvent>,
        shutdown_signal: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listeners,
            event_receiver,
            shutdown_signal,
        }
    }

    /// Runs the dispatch loop on its own task.
    ///
    /// If the loop fails, `shutdown_sender` is flipped so sibling services
    /// stop too.
    #[must_use]
    pub fn spawn(
        self,
        shutdown_sender: watch::Sender<bool>,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        spawn_with_shutdown(self.run(), shutdown_sender)
    }

    /// Runs the dispatch loop until shutdown.
    ///
    /// Pending registrations are dropped on exit, which wakes their waiters
    /// with `SubscriberError::ChannelClosed`.
    ///
    /// # Errors
    ///
    /// Currently never fails; the `Result` lets it run under
    /// `shroud_utils::spawn_with_shutdown`.
    #[instrument(level = "info", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            target = "shroud-events",
            event = "result_event_subscriber_run",
            "Running result event subscriber"
        );
        loop {
            tokio::select! {
                event = self.event_receiver.recv_async() => {
                    match event {
                        Ok(event) => {
                            let delivered = self.listeners.publish(&event);
                            if delivered == 0 {
                                tracing::debug!(
                                    target = "shroud-events",
                                    event = "result_event_unclaimed",
                                    event_name = %event.event_name,
                                    computation_offset = ?event.computation_offset,
                                    "No listener registered for result event"
                                );
                            } else {
                                tracing::trace!(
                                    target = "shroud-events",
                                    event = "result_event_delivered",
                                    event_name = %event.event_name,
                                    delivered,
                                    "Delivered result event"
                                );
                            }
                        }
                        Err(_) => {
                            tracing::info!(
                                target = "shroud-events",
                                event = "result_event_channel_closed",
                                "Result event channel closed"
                            );
                            break;
                        }
                    }
                }
                shutdown_result = self.shutdown_signal.changed() => {
                    match shutdown_result {
                        Ok(()) => {
                            if *self.shutdown_signal.borrow() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                target = "shroud-events",
                                event = "shutdown_signal_error",
                                error = %e,
                                "Shutdown signal channel closed"
                            );
                            break;
                        }
                    }
                }
            }
        }
        self.listeners.clear();
        tracing::info!(
            target = "shroud-events",
            event = "result_event_subscriber_finished",
            "Result event subscriber finished"
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("No result on channel `{channel}` within {timeout:?}")]
    ChannelTimeout { channel: String, timeout: Duration },
    #[error("Result channel `{channel}` closed before an event arrived")]
    ChannelClosed { channel: String },
}
