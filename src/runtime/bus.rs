//! Typed publish/subscribe bus
//!
//! `publish` pushes onto an unbounded intake queue and returns. A dispatcher
//! task drains the intake in order and spawns one task per subscribed handler
//! per event, so a slow or failing handler never holds up the others.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::message::Message;

/// Discriminant used to route events to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A line arrived from the transport and parsed
    MessageReceived,
    /// Something wants a message written to the transport
    SendRequest,
    /// A received message passed the trigger check
    GenerationRequest,
    /// The gateway produced a reply
    ReplyReady,
}

/// Transient envelope passed through the bus
#[derive(Debug, Clone)]
pub enum Event {
    /// Inbound message, already parsed
    MessageReceived {
        /// The parsed message
        message: Message,
    },
    /// Outbound message to send and log
    SendRequest {
        /// The message to send
        message: Message,
    },
    /// Ask the gateway for a reply to `trigger`
    GenerationRequest {
        /// The message that triggered generation
        trigger: Message,
    },
    /// Reply produced by the gateway (may be a no-op message)
    ReplyReady {
        /// Correlates with the gateway's request log lines
        request_id: Uuid,
        /// The reply
        message: Message,
    },
}

impl Event {
    /// Routing key for this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MessageReceived { .. } => EventKind::MessageReceived,
            Event::SendRequest { .. } => EventKind::SendRequest,
            Event::GenerationRequest { .. } => EventKind::GenerationRequest,
            Event::ReplyReady { .. } => EventKind::ReplyReady,
        }
    }
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Shared {
    intake: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

/// Cheap, cloneable handle to one bus.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventBus {
    /// Create a bus and start its dispatcher. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            intake: Mutex::new(Some(tx)),
            handlers: RwLock::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), rx));
        Self {
            shared,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        }
    }

    /// Register `handler` for every future event of `kind`.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.shared
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Queue `event` for dispatch. Never blocks; dropped once the bus is shut down.
    pub fn publish(&self, event: Event) {
        let intake = self.shared.intake.lock();
        match intake.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("event bus dispatcher gone, event dropped");
                }
            }
            None => tracing::debug!(kind = ?event.kind(), "event bus closed, event dropped"),
        }
    }

    /// Stop accepting events and wait up to `timeout` for the queued events and
    /// every running handler to finish, then drop all subscriptions.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.intake.lock().take();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("event bus dispatcher did not stop in time");
            }
        }
        self.shared.handlers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut running = JoinSet::new();
    while let Some(event) = rx.recv().await {
        // Reap finished handlers
        while running.try_join_next().is_some() {}

        let kind = event.kind();
        let handlers = shared
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(?kind, "no subscribers");
            continue;
        }

        for handler in handlers {
            let task = handler(event.clone());
            running.spawn(async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(?kind, error = %err, "event handler failed"),
                    Err(_) => tracing::error!(?kind, "event handler panicked"),
                }
            });
        }
    }

    while running.join_next().await.is_some() {}
    tracing::debug!("event bus dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::parse_wire;

    fn received(line: &str) -> Event {
        Event::MessageReceived {
            message: parse_wire(line).unwrap(),
        }
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_of_the_kind() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for name in ["store", "trigger"] {
            let tx = tx.clone();
            bus.subscribe(EventKind::MessageReceived, move |event| {
                let tx = tx.clone();
                async move {
                    if let Event::MessageReceived { message } = event {
                        tx.send((name, message.command)).ok();
                    }
                    Ok::<(), anyhow::Error>(())
                }
            });
        }
        let other = tx.clone();
        bus.subscribe(EventKind::ReplyReady, move |_| {
            let other = other.clone();
            async move {
                other.send(("reply", String::new())).ok();
                Ok::<(), anyhow::Error>(())
            }
        });

        bus.publish(received("PRIVMSG #a :hi"));

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(
            seen,
            vec![("store", "PRIVMSG".to_string()), ("trigger", "PRIVMSG".to_string())]
        );
        assert!(rx.try_recv().is_err());
    }

    async fn stall(_: Event) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn fail(_: Event) -> anyhow::Result<()> {
        anyhow::bail!("storage unavailable")
    }

    async fn explode(_: Event) -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn slow_or_failing_handlers_do_not_block_others() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(EventKind::MessageReceived, stall);
        bus.subscribe(EventKind::MessageReceived, fail);
        bus.subscribe(EventKind::MessageReceived, explode);
        bus.subscribe(EventKind::MessageReceived, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::MessageReceived { message } = event {
                    tx.send(message.trailing).ok();
                }
                Ok::<(), anyhow::Error>(())
            }
        });

        bus.publish(received("PRIVMSG #a :one"));
        bus.publish(received("PRIVMSG #a :two"));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("one"));
        assert_eq!(second.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_handlers() {
        let bus = EventBus::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&done);
        bus.subscribe(EventKind::ReplyReady, move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        bus.publish(Event::ReplyReady {
            request_id: Uuid::new_v4(),
            message: Message::noop(),
        });
        bus.shutdown(Duration::from_secs(5)).await;

        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_dropped() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        bus.subscribe(EventKind::SendRequest, move |_| {
            let tx = tx.clone();
            async move {
                tx.send(()).ok();
                Ok::<(), anyhow::Error>(())
            }
        });

        bus.shutdown(Duration::from_secs(1)).await;
        bus.publish(Event::SendRequest {
            message: Message::noop(),
        });

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
