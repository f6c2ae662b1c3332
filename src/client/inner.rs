//! Connection lifecycle state machine.
//!
//! `ClientCore` owns the engine, the dispatcher and the per-connection
//! worker tasks, and serializes every lifecycle transition through one state
//! mutex. Connect and disconnect return tokens immediately and drive the
//! actual work on spawned tasks, so no caller ever blocks the runtime on a
//! handshake.

use crate::codec::PacketCodec;
use crate::dispatcher::{in_callback, CallbackDispatcher, Event};
use crate::engine::{DeliveryEngine, Outbound};
use crate::error::{MqttError, Result};
use crate::packet::{ConnectPacket, Packet};
use crate::store::MessageStore;
use crate::token::Token;
use crate::transport::TransportRegistry;
use crate::types::{ConnectOptions, Message, QoS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::workers::{self, ConnectionTasks};

const CONNECT_TOKEN_KEY: &str = "Con";
const DISCONNECT_TOKEN_KEY: &str = "Disc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

struct ActiveConnection {
    tasks: ConnectionTasks,
    supervisor: Option<JoinHandle<()>>,
    server_uri: String,
}

pub(crate) struct ClientCore {
    state: Mutex<LifecycleState>,
    engine: Arc<DeliveryEngine>,
    dispatcher: Arc<CallbackDispatcher>,
    store: Arc<dyn MessageStore>,
    codec: Arc<dyn PacketCodec>,
    registry: Arc<TransportRegistry>,
    options: Mutex<Option<ConnectOptions>>,
    connection: Mutex<Option<ActiveConnection>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientCore {
    pub fn new(
        store: Arc<dyn MessageStore>,
        codec: Arc<dyn PacketCodec>,
        registry: Arc<TransportRegistry>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(CallbackDispatcher::new());
        Arc::new(Self {
            state: Mutex::new(LifecycleState::Disconnected),
            engine: Arc::new(DeliveryEngine::new(store.clone(), dispatcher.clone())),
            dispatcher,
            store,
            codec,
            registry,
            options: Mutex::new(None),
            connection: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LifecycleState::Connected && self.engine.is_connected()
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn crate::dispatcher::EventHandler>>) {
        self.dispatcher.set_handler(handler);
    }

    pub fn buffered(&self) -> usize {
        self.engine.buffered()
    }

    /// Starts a connect attempt and returns its token. The token resolves
    /// once a CONNACK is accepted (trying each configured endpoint in order)
    /// or every endpoint has failed.
    pub fn connect(self: &Arc<Self>, options: ConnectOptions) -> Result<Token> {
        if options.server_uris.is_empty() {
            return Err(MqttError::Configuration("no server URI".into()));
        }
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Disconnected => {}
                LifecycleState::Connecting => return Err(MqttError::ConnectInProgress),
                LifecycleState::Connected => return Err(MqttError::AlreadyConnected),
                LifecycleState::Disconnecting => return Err(MqttError::Disconnecting),
                LifecycleState::Closed => return Err(MqttError::ClientClosed),
            }
            *state = LifecycleState::Connecting;
        }

        // Open the store first: configure may reload buffered state from it.
        let prepared = self
            .store
            .open(&options.client_id, &options.server_uris[0])
            .and_then(|()| self.engine.configure(&options));
        if let Err(e) = prepared {
            *self.state.lock() = LifecycleState::Disconnected;
            return Err(e);
        }

        let token = Token::new();
        token.bind(CONNECT_TOKEN_KEY)?;
        self.engine
            .tokens()
            .register(CONNECT_TOKEN_KEY, token.clone())?;
        *self.options.lock() = Some(options.clone());

        let core = self.clone();
        tokio::spawn(async move {
            let result = core.try_endpoints(&options).await;
            match result {
                Ok(uri) => {
                    if core.closed.load(Ordering::SeqCst) {
                        // Closed mid-handshake; unwind instead of racing the
                        // close path.
                        if let Some(conn) = core.connection.lock().take() {
                            conn.tasks.abort_all();
                        }
                        core.engine
                            .tokens()
                            .resolve(CONNECT_TOKEN_KEY, Err(MqttError::ClientClosed));
                        return;
                    }
                    *core.state.lock() = LifecycleState::Connected;
                    tracing::info!(server_uri = %uri, "connected");
                    core.engine.tokens().resolve(CONNECT_TOKEN_KEY, Ok(()));
                    core.dispatcher.dispatch(Event::Connected(uri));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connect failed");
                    let mut state = core.state.lock();
                    if *state == LifecycleState::Connecting {
                        *state = LifecycleState::Disconnected;
                    }
                    drop(state);
                    core.engine.tokens().resolve(CONNECT_TOKEN_KEY, Err(e));
                }
            }
        });
        Ok(token)
    }

    /// Tries each endpoint in order; returns the URI that accepted us.
    async fn try_endpoints(self: &Arc<Self>, options: &ConnectOptions) -> Result<String> {
        let mut last_err = MqttError::ConnectionError("no endpoint attempted".into());
        for uri in &options.server_uris {
            if self.closed.load(Ordering::SeqCst) {
                return Err(MqttError::ClientClosed);
            }
            match self.attempt(options, uri).await {
                Ok(()) => return Ok(uri.clone()),
                Err(e) => {
                    tracing::debug!(server_uri = %uri, error = %e, "endpoint failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// One full connection attempt against one endpoint: transport start,
    /// worker spawn, CONNECT/CONNACK, then session replay and buffer flush.
    async fn attempt(self: &Arc<Self>, options: &ConnectOptions, uri: &str) -> Result<()> {
        let mut transport = self.registry.create(uri)?;
        tokio::time::timeout(options.connect_timeout, transport.start())
            .await
            .map_err(|_| MqttError::Timeout)??;
        let (reader, writer) = transport.split()?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let connack_rx = self.engine.expect_connack();
        let (tasks, mut loss_rx) = workers::spawn(
            reader,
            writer,
            self.codec.clone(),
            self.engine.clone(),
            out_rx,
            options.keep_alive,
        );
        self.engine.set_outbound(out_tx);

        let handshake = async {
            self.engine.enqueue(Outbound::packet(Packet::Connect(ConnectPacket {
                client_id: options.client_id.clone(),
                clean_session: options.clean_session,
                keep_alive_secs: options.keep_alive.as_secs().min(u64::from(u16::MAX)) as u16,
                username: options.username.clone(),
                password: options.password.clone(),
            })))?;
            let ack = tokio::time::timeout(options.connect_timeout, connack_rx)
                .await
                .map_err(|_| MqttError::Timeout)?
                .map_err(|_| MqttError::ConnectionLost("connection closed before CONNACK".into()))?;
            if ack.return_code != 0 {
                return Err(MqttError::ConnectionRefused(ack.return_code));
            }
            self.engine.connection_opened(options.clean_session)?;
            Ok(())
        };

        match handshake.await {
            Ok(()) => {
                let core = self.clone();
                let supervisor = tokio::spawn(async move {
                    if let Some(cause) = loss_rx.recv().await {
                        core.handle_connection_lost(cause).await;
                    }
                });
                *self.connection.lock() = Some(ActiveConnection {
                    tasks,
                    supervisor: Some(supervisor),
                    server_uri: uri.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                tasks.abort_all();
                self.engine.connection_closed(&e, &[CONNECT_TOKEN_KEY]);
                Err(e)
            }
        }
    }

    /// Unrequested connection loss: tear down, notify, maybe reconnect.
    async fn handle_connection_lost(self: &Arc<Self>, cause: MqttError) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Connected {
                return;
            }
            *state = LifecycleState::Disconnected;
        }
        tracing::warn!(cause = %cause, "connection lost");

        if let Some(conn) = self.connection.lock().take() {
            conn.tasks.abort_all();
        }
        self.engine.connection_closed(&cause, &[]);
        self.dispatcher.dispatch(Event::ConnectionLost(cause));

        let options = self.options.lock().clone();
        if let Some(options) = options {
            if options.reconnect.enabled {
                self.spawn_reconnect(options);
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, options: ConnectOptions) {
        let core = self.clone();
        let task = tokio::spawn(async move {
            let mut delay = options.reconnect.initial_delay;
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                if let Some(max) = options.reconnect.max_attempts {
                    if attempt > max {
                        tracing::warn!(attempts = max, "giving up on reconnect");
                        return;
                    }
                }
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::time::sleep(delay).await;
                if core.closed.load(Ordering::SeqCst)
                    || core.state() != LifecycleState::Disconnected
                {
                    return;
                }
                match core.try_endpoints(&options).await {
                    Ok(uri) => {
                        if core.closed.load(Ordering::SeqCst) {
                            if let Some(conn) = core.connection.lock().take() {
                                conn.tasks.abort_all();
                            }
                            return;
                        }
                        *core.state.lock() = LifecycleState::Connected;
                        tracing::info!(server_uri = %uri, attempt, "reconnected");
                        core.dispatcher.dispatch(Event::Connected(uri));
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "reconnect attempt failed");
                        delay = options.reconnect.next_delay(delay);
                    }
                }
            }
        });
        if let Some(old) = self.reconnect_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Starts an orderly disconnect and returns its token, which resolves
    /// once the connection is fully torn down. Waits up to `timeout` for
    /// in-flight QoS > 0 deliveries before sending DISCONNECT.
    pub fn disconnect(self: &Arc<Self>, timeout: Duration) -> Result<Token> {
        if in_callback() {
            return Err(MqttError::DisconnectProhibited);
        }
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Connected => {}
                LifecycleState::Closed => return Err(MqttError::ClientClosed),
                LifecycleState::Disconnecting => return Err(MqttError::Disconnecting),
                _ => return Err(MqttError::NotConnected),
            }
            *state = LifecycleState::Disconnecting;
        }
        self.cancel_reconnect();

        let token = Token::new();
        token.bind(DISCONNECT_TOKEN_KEY)?;
        self.engine
            .tokens()
            .register(DISCONNECT_TOKEN_KEY, token.clone())?;

        let core = self.clone();
        tokio::spawn(async move {
            core.engine.drain_inflight(timeout).await;

            // Stop treating the imminent stream closure as an unexpected loss.
            let conn = core.connection.lock().take();
            if let Some(conn) = &conn {
                if let Some(supervisor) = &conn.supervisor {
                    supervisor.abort();
                }
            }

            let wrote = Token::new();
            let enqueued = wrote.bind(DISCONNECT_TOKEN_KEY).is_ok()
                && core
                    .engine
                    .enqueue(Outbound {
                        packet: Packet::Disconnect,
                        on_write: Some(wrote.clone()),
                    })
                    .is_ok();
            if enqueued {
                let _ = wrote.wait_timeout(Duration::from_secs(5)).await;
            }

            if let Some(conn) = conn {
                conn.tasks.abort_all();
            }
            core.engine
                .connection_closed(&MqttError::Disconnecting, &[DISCONNECT_TOKEN_KEY]);
            *core.state.lock() = LifecycleState::Disconnected;
            tracing::info!("disconnected");
            core.engine.tokens().resolve(DISCONNECT_TOKEN_KEY, Ok(()));
        });
        Ok(token)
    }

    /// Releases the client for good. Valid only once disconnected: a live or
    /// connecting client must be disconnected first, and a close issued while
    /// a disconnect is in flight waits for it. Idempotent. Outstanding
    /// operations fail with [`MqttError::ClientClosed`]; queued callbacks are
    /// drained before the store closes.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        if in_callback() {
            return Err(MqttError::DisconnectProhibited);
        }
        loop {
            match self.state() {
                LifecycleState::Closed => return Ok(()),
                LifecycleState::Connected | LifecycleState::Connecting => {
                    return Err(MqttError::InvalidState(
                        "close requires a disconnected client".into(),
                    ))
                }
                LifecycleState::Disconnecting => {
                    match self.engine.tokens().get(DISCONNECT_TOKEN_KEY) {
                        Some(token) => {
                            let _ = token.wait().await;
                        }
                        None => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
                LifecycleState::Disconnected => break,
            }
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("closing client");
        self.cancel_reconnect();

        if let Some(conn) = self.connection.lock().take() {
            if let Some(supervisor) = &conn.supervisor {
                supervisor.abort();
            }
            conn.tasks.abort_all();
        }

        let cause = MqttError::ClientClosed;
        self.engine
            .shutdown(&cause, &[CONNECT_TOKEN_KEY, DISCONNECT_TOKEN_KEY]);
        self.dispatcher.stop().await;
        self.store.close();

        // The lifecycle token, if any, resolves last so its waiter observes
        // a fully shut-down client.
        self.engine
            .tokens()
            .resolve_if_present(CONNECT_TOKEN_KEY, Err(cause.clone()));
        self.engine
            .tokens()
            .resolve_if_present(DISCONNECT_TOKEN_KEY, Err(cause));
        *self.state.lock() = LifecycleState::Closed;
        Ok(())
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    pub fn publish(&self, message: Message) -> Result<Token> {
        self.ensure_usable()?;
        self.engine.publish(message)
    }

    pub fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<Token> {
        self.ensure_usable()?;
        self.engine.subscribe(filters)
    }

    pub fn unsubscribe(&self, filters: Vec<String>) -> Result<Token> {
        self.ensure_usable()?;
        self.engine.unsubscribe(filters)
    }

    pub fn server_uri(&self) -> Option<String> {
        self.connection.lock().as_ref().map(|c| c.server_uri.clone())
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Closed => Err(MqttError::ClientClosed),
            LifecycleState::Disconnecting => Err(MqttError::Disconnecting),
            _ => Ok(()),
        }
    }
}
