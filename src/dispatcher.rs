//! Serialized delivery of application callbacks.
//!
//! All callbacks run on one dedicated worker task, in the order the events
//! were produced. The engine never blocks on a callback; events are queued
//! and the worker drains them. Code running inside a callback is marked via a
//! task-local so the client can reject calls (such as `disconnect`) that
//! would deadlock the worker.

use crate::error::MqttError;
use crate::token::Token;
use crate::types::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

tokio::task_local! {
    static IN_CALLBACK: ();
}

/// True when the current task is executing an application callback.
pub(crate) fn in_callback() -> bool {
    IN_CALLBACK.try_with(|()| ()).is_ok()
}

/// Application-facing event hooks. All methods have empty defaults, so an
/// implementor overrides only what it cares about.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A publish arrived from the broker and cleared its inbound handshake.
    async fn message_arrived(&self, message: Message) {
        let _ = message;
    }

    /// An outbound QoS > 0 publish finished its handshake.
    async fn delivery_complete(&self, token: Token) {
        let _ = token;
    }

    /// The connection dropped without a requested disconnect.
    async fn connection_lost(&self, cause: MqttError) {
        let _ = cause;
    }

    /// The client reconnected automatically after a connection loss.
    async fn connected(&self, server_uri: String) {
        let _ = server_uri;
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    MessageArrived(Message),
    DeliveryComplete(Token),
    ConnectionLost(MqttError),
    Connected(String),
}

pub(crate) struct CallbackDispatcher {
    handler: Arc<Mutex<Option<Arc<dyn EventHandler>>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        let handler: Arc<Mutex<Option<Arc<dyn EventHandler>>>> = Arc::new(Mutex::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let worker_handler = handler.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let current = worker_handler.lock().clone();
                let Some(handler) = current else { continue };
                IN_CALLBACK
                    .scope((), async {
                        match event {
                            Event::MessageArrived(message) => {
                                handler.message_arrived(message).await;
                            }
                            Event::DeliveryComplete(token) => {
                                handler.delivery_complete(token).await;
                            }
                            Event::ConnectionLost(cause) => {
                                handler.connection_lost(cause).await;
                            }
                            Event::Connected(uri) => handler.connected(uri).await,
                        }
                    })
                    .await;
            }
            tracing::trace!("callback worker finished");
        });
        Self {
            handler,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.handler.lock() = handler;
    }

    /// Queues an event for the worker. Never blocks; events arriving after
    /// [`stop`](Self::stop) are dropped.
    pub fn dispatch(&self, event: Event) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(event).is_err() {
                tracing::trace!("callback worker gone, dropping event");
            }
        }
    }

    /// Closes the queue and waits for already-queued events to be delivered.
    pub async fn stop(&self) {
        let worker = {
            self.tx.lock().take();
            self.worker.lock().take()
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "callback worker panicked");
            }
        }
    }
}
