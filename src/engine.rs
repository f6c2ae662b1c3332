//! QoS delivery engine.
//!
//! Owns the packet-id space, the token store, the persistence store and the
//! offline buffer, and drives both directions of every acknowledgement
//! handshake. The network workers stay thin: the sender drains the outbound
//! queue this engine fills, and the receiver hands every inbound packet to
//! [`DeliveryEngine::handle_packet`].

use crate::buffer::DisconnectedBuffer;
use crate::dispatcher::{CallbackDispatcher, Event};
use crate::error::{MqttError, Result};
use crate::packet::{
    publish_key, subscribe_key, unsubscribe_key, ConnAckPacket, Packet, PublishPacket,
    SubscribePacket, UnsubscribePacket,
};
use crate::store::{received_key, sent_key, HandshakeStage, MessageStore, PersistedRecord};
use crate::token::{Token, TokenStore};
use crate::types::{Message, QoS};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One packet queued for the sender worker. `on_write` carries a token to
/// resolve as soon as the bytes are on the wire, for operations whose
/// contract ends there (QoS 0 publishes, DISCONNECT).
pub(crate) struct Outbound {
    pub packet: Packet,
    pub on_write: Option<Token>,
}

impl Outbound {
    pub fn packet(packet: Packet) -> Self {
        Self {
            packet,
            on_write: None,
        }
    }
}

struct IdAllocator {
    next: u16,
    in_use: HashSet<u16>,
    /// Subset of `in_use` held by QoS > 0 publishes; bounded by max_inflight.
    inflight: HashSet<u16>,
}

impl IdAllocator {
    fn allocate(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    fn reserve(&mut self, id: u16, inflight: bool) {
        self.in_use.insert(id);
        if inflight {
            self.inflight.insert(id);
        }
    }

    fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
        self.inflight.remove(&id);
    }
}

pub(crate) struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    tokens: TokenStore,
    buffer: Mutex<Arc<DisconnectedBuffer>>,
    dispatcher: Arc<CallbackDispatcher>,
    ids: Mutex<IdAllocator>,
    connected: AtomicBool,
    clean_session: AtomicBool,
    max_inflight: AtomicU16,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// `on_write` tokens enqueued but not yet written, so teardown can fail
    /// the ones the sender never reached.
    queued_writes: Mutex<Vec<Token>>,
    pending_connack: Mutex<Option<oneshot::Sender<ConnAckPacket>>>,
}

impl DeliveryEngine {
    pub fn new(store: Arc<dyn MessageStore>, dispatcher: Arc<CallbackDispatcher>) -> Self {
        Self {
            store,
            tokens: TokenStore::new(),
            buffer: Mutex::new(Arc::new(DisconnectedBuffer::new(
                crate::types::BufferConfig::default(),
                None,
            ))),
            dispatcher,
            ids: Mutex::new(IdAllocator {
                next: 1,
                in_use: HashSet::new(),
                inflight: HashSet::new(),
            }),
            connected: AtomicBool::new(false),
            clean_session: AtomicBool::new(true),
            max_inflight: AtomicU16::new(10),
            outbound: Mutex::new(None),
            queued_writes: Mutex::new(Vec::new()),
            pending_connack: Mutex::new(None),
        }
    }

    /// Applies per-connect settings. Called once per `connect`, after the
    /// store is open and before the connection attempt. Entries buffered
    /// under the previous options carry over; for a non-clean session the
    /// persisted `sb-` mirror is reloaded as well, so buffered messages
    /// survive a process restart.
    pub fn configure(&self, options: &crate::types::ConnectOptions) -> Result<()> {
        self.max_inflight.store(options.max_inflight, Ordering::SeqCst);
        self.clean_session
            .store(options.clean_session, Ordering::SeqCst);
        let store = options.buffer.persist.then(|| self.store.clone());
        let buffer = Arc::new(DisconnectedBuffer::new(options.buffer.clone(), store));
        let previous = std::mem::replace(&mut *self.buffer.lock(), buffer.clone());
        buffer.adopt(previous.take());
        if !options.clean_session {
            let restored = buffer.restore()?;
            if !restored.is_empty() {
                tracing::debug!(
                    count = restored.len(),
                    "restored buffered messages from the store"
                );
                // Their ids predate this process; reserve them before any new
                // allocation can hand them out again.
                let mut ids = self.ids.lock();
                for id in restored {
                    ids.reserve(id, true);
                }
            }
        }
        Ok(())
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Arms the CONNACK hand-off for an in-progress connect attempt.
    pub fn expect_connack(&self) -> oneshot::Receiver<ConnAckPacket> {
        let (tx, rx) = oneshot::channel();
        *self.pending_connack.lock() = Some(tx);
        rx
    }

    pub fn set_outbound(&self, tx: mpsc::UnboundedSender<Outbound>) {
        *self.outbound.lock() = Some(tx);
    }

    pub fn enqueue(&self, outbound: Outbound) -> Result<()> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(MqttError::NotConnected)?;
        if let Some(token) = &outbound.on_write {
            let mut queued = self.queued_writes.lock();
            queued.retain(|t| !t.is_complete());
            queued.push(token.clone());
        }
        tx.send(outbound)
            .map_err(|_| MqttError::ConnectionLost("sender worker gone".into()))
    }

    /// Sends or buffers one application publish, returning its token.
    ///
    /// For QoS > 0 the message is persisted before anything touches the wire;
    /// if persistence fails, the send fails atomically with no id consumed
    /// and no token registered.
    pub fn publish(&self, message: Message) -> Result<Token> {
        let token = Token::new();
        let connected = self.is_connected();
        if !connected {
            let buffer = self.buffer.lock().clone();
            if !buffer.is_enabled() {
                return Err(MqttError::NotConnected);
            }
            let packet = self.stage_publish(&message, &token)?;
            match buffer.offer(packet, Some(token.clone())) {
                Ok(Some(evicted)) => self.discard_buffered(evicted),
                Ok(None) => {}
                Err(e) => {
                    self.unstage_publish(&message, &token);
                    return Err(e);
                }
            }
            return Ok(token);
        }

        let packet = self.stage_publish(&message, &token)?;
        if let Packet::Publish(p) = &packet {
            if let Some(id) = p.packet_id {
                if let Err(e) = self.store.put(&sent_key(id), PersistedRecord::new(packet.clone()))
                {
                    self.unstage_publish(&message, &token);
                    return Err(e);
                }
            }
        }
        let on_write = (message.qos == QoS::AtMostOnce).then(|| token.clone());
        if let Err(e) = self.enqueue(Outbound { packet, on_write }) {
            self.unstage_publish(&message, &token);
            return Err(e);
        }
        Ok(token)
    }

    /// Allocates an id (QoS > 0), binds and registers the token. Reversed by
    /// [`unstage_publish`](Self::unstage_publish) on any later failure.
    fn stage_publish(&self, message: &Message, token: &Token) -> Result<Packet> {
        let packet_id = if message.qos == QoS::AtMostOnce {
            token.bind("Pub:0")?;
            None
        } else {
            let id = {
                let mut ids = self.ids.lock();
                let limit = self.max_inflight.load(Ordering::SeqCst);
                if ids.inflight.len() >= usize::from(limit) {
                    return Err(MqttError::MaxInflightExceeded(limit));
                }
                let id = ids.allocate()?;
                ids.inflight.insert(id);
                id
            };
            let key = publish_key(id);
            token.bind(&key)?;
            if let Err(e) = self.tokens.register(&key, token.clone()) {
                self.ids.lock().release(id);
                return Err(e);
            }
            Some(id)
        };
        Ok(Packet::Publish(PublishPacket {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            retain: message.retain,
            dup: false,
            packet_id,
        }))
    }

    fn unstage_publish(&self, message: &Message, token: &Token) {
        if message.qos != QoS::AtMostOnce {
            if let Some(key) = token.key() {
                if let Some(id) = key.strip_prefix("Pub:").and_then(|s| s.parse::<u16>().ok()) {
                    self.tokens.resolve(&key, Err(MqttError::Incomplete));
                    self.store.remove(&sent_key(id)).ok();
                    self.ids.lock().release(id);
                }
            }
        }
    }

    pub fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<Token> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        let token = Token::new();
        let id = self.ids.lock().allocate()?;
        let key = subscribe_key(id);
        token.bind(&key)?;
        if let Err(e) = self.tokens.register(&key, token.clone()) {
            self.ids.lock().release(id);
            return Err(e);
        }
        let packet = Packet::Subscribe(SubscribePacket {
            packet_id: id,
            filters,
        });
        if let Err(e) = self.enqueue(Outbound::packet(packet)) {
            self.tokens.resolve(&key, Err(MqttError::Incomplete));
            self.ids.lock().release(id);
            return Err(e);
        }
        Ok(token)
    }

    pub fn unsubscribe(&self, filters: Vec<String>) -> Result<Token> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        let token = Token::new();
        let id = self.ids.lock().allocate()?;
        let key = unsubscribe_key(id);
        token.bind(&key)?;
        if let Err(e) = self.tokens.register(&key, token.clone()) {
            self.ids.lock().release(id);
            return Err(e);
        }
        let packet = Packet::Unsubscribe(UnsubscribePacket {
            packet_id: id,
            filters,
        });
        if let Err(e) = self.enqueue(Outbound::packet(packet)) {
            self.tokens.resolve(&key, Err(MqttError::Incomplete));
            self.ids.lock().release(id);
            return Err(e);
        }
        Ok(token)
    }

    /// Routes one inbound packet. An `Err` here is connection-fatal; stray
    /// acknowledgements for unknown ids are logged and ignored instead.
    pub fn handle_packet(&self, packet: Packet) -> Result<()> {
        tracing::trace!(packet = packet.name(), id = ?packet.packet_id(), "inbound");
        match packet {
            Packet::ConnAck(ack) => match self.pending_connack.lock().take() {
                Some(tx) => {
                    let _ = tx.send(ack);
                    Ok(())
                }
                None => Err(MqttError::ProtocolError("unexpected CONNACK".into())),
            },
            Packet::Publish(publish) => self.handle_inbound_publish(publish),
            Packet::PubAck { packet_id } => self.complete_delivery(packet_id),
            Packet::PubRec { packet_id } => {
                // Step the QoS 2 handshake: persist the stage change, then
                // answer with PUBREL.
                if let Some(mut record) = self.store.get(&sent_key(packet_id))? {
                    record.stage = HandshakeStage::PubRel;
                    self.store.put(&sent_key(packet_id), record)?;
                } else {
                    tracing::warn!(packet_id, "PUBREC for unknown message");
                }
                self.enqueue(Outbound::packet(Packet::PubRel { packet_id }))
            }
            Packet::PubComp { packet_id } => self.complete_delivery(packet_id),
            Packet::PubRel { packet_id } => {
                self.store.remove(&received_key(packet_id))?;
                self.enqueue(Outbound::packet(Packet::PubComp { packet_id }))
            }
            Packet::SubAck(ack) => {
                let result = match ack.return_codes.iter().find(|code| **code == 0x80) {
                    Some(code) => Err(MqttError::SubscriptionFailed(*code)),
                    None => Ok(()),
                };
                self.tokens.resolve(&subscribe_key(ack.packet_id), result);
                self.ids.lock().release(ack.packet_id);
                Ok(())
            }
            Packet::UnsubAck { packet_id } => {
                self.tokens.resolve(&unsubscribe_key(packet_id), Ok(()));
                self.ids.lock().release(packet_id);
                Ok(())
            }
            Packet::PingResp => Ok(()),
            other => Err(MqttError::ProtocolError(format!(
                "client received {}",
                other.name()
            ))),
        }
    }

    fn handle_inbound_publish(&self, publish: PublishPacket) -> Result<()> {
        let message = Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        };
        match publish.qos {
            QoS::AtMostOnce => {
                self.dispatcher.dispatch(Event::MessageArrived(message));
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::MalformedPacket("QoS 1 publish without id".into()))?;
                self.dispatcher.dispatch(Event::MessageArrived(message));
                self.enqueue(Outbound::packet(Packet::PubAck { packet_id }))
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| MqttError::MalformedPacket("QoS 2 publish without id".into()))?;
                let key = received_key(packet_id);
                // The receipt marker makes redelivery (dup or otherwise)
                // invisible to the application: deliver only on first sight,
                // always re-answer with PUBREC.
                if self.store.get(&key)?.is_none() {
                    self.store
                        .put(&key, PersistedRecord::new(Packet::Publish(publish)))?;
                    self.dispatcher.dispatch(Event::MessageArrived(message));
                } else {
                    tracing::debug!(packet_id, "suppressing redelivered QoS 2 publish");
                }
                self.enqueue(Outbound::packet(Packet::PubRec { packet_id }))
            }
        }
    }

    /// Terminal step of an outbound QoS 1 or 2 handshake.
    fn complete_delivery(&self, packet_id: u16) -> Result<()> {
        self.store.remove(&sent_key(packet_id))?;
        self.ids.lock().release(packet_id);
        if let Some(token) = self.tokens.resolve(&publish_key(packet_id), Ok(())) {
            self.dispatcher.dispatch(Event::DeliveryComplete(token));
        }
        Ok(())
    }

    /// Brings the engine online after a successful CONNACK: replays unfinished
    /// handshakes (old session) or clears them (clean session), then opens the
    /// send gate and flushes the offline buffer.
    pub fn connection_opened(&self, clean_session: bool) -> Result<()> {
        if clean_session {
            for key in self.store.keys()? {
                if let Some(id) = parse_key_id(&key, crate::store::KEY_PREFIX_SENT) {
                    // Usually already failed at loss time; absence is fine.
                    self.tokens.resolve_if_present(
                        &publish_key(id),
                        Err(MqttError::ConnectionLost(
                            "clean session discarded in-flight state".into(),
                        )),
                    );
                    self.ids.lock().release(id);
                }
            }
            self.store.clear()?;
        } else {
            self.replay()?;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.drain_buffer()
    }

    /// Re-sends every persisted outbound handshake, lowest id first, before
    /// any new traffic: PUBLISH with the dup flag for records still awaiting
    /// their first acknowledgement, PUBREL for QoS 2 records past PUBREC.
    fn replay(&self) -> Result<()> {
        let mut pending: Vec<(u16, PersistedRecord)> = Vec::new();
        for key in self.store.keys()? {
            if let Some(id) = parse_key_id(&key, crate::store::KEY_PREFIX_SENT) {
                if let Some(record) = self.store.get(&key)? {
                    pending.push((id, record));
                }
            }
        }
        pending.sort_by_key(|(id, _)| *id);

        for (id, record) in pending {
            self.ids.lock().reserve(id, true);
            let key = publish_key(id);
            if self.tokens.get(&key).is_none() {
                // Restored from a previous process; give the handshake a
                // token so completion still produces a delivery event.
                let token = Token::new();
                token.bind(&key)?;
                self.tokens.register(&key, token)?;
            }
            match record.stage {
                HandshakeStage::Publish => {
                    let Packet::Publish(mut publish) = record.packet else {
                        return Err(MqttError::Persistence(format!(
                            "corrupt record under {}",
                            sent_key(id)
                        )));
                    };
                    publish.dup = true;
                    tracing::debug!(packet_id = id, "replaying PUBLISH");
                    self.enqueue(Outbound::packet(Packet::Publish(publish)))?;
                }
                HandshakeStage::PubRel => {
                    tracing::debug!(packet_id = id, "replaying PUBREL");
                    self.enqueue(Outbound::packet(Packet::PubRel { packet_id: id }))?;
                }
            }
        }
        Ok(())
    }

    fn drain_buffer(&self) -> Result<()> {
        let buffer = self.buffer.lock().clone();
        for entry in buffer.drain() {
            let mut on_write = None;
            if let Packet::Publish(publish) = &entry.packet {
                match publish.packet_id {
                    Some(id) => {
                        // Entries restored from the store after a restart have
                        // no live token and an unreserved id; give them both so
                        // their handshakes complete like any other.
                        self.ids.lock().reserve(id, true);
                        let key = publish_key(id);
                        if self.tokens.get(&key).is_none() {
                            let token = Token::new();
                            token.bind(&key)?;
                            self.tokens.register(&key, token)?;
                        }
                        self.store
                            .put(&sent_key(id), PersistedRecord::new(entry.packet.clone()))?;
                    }
                    None => on_write = entry.token,
                }
            }
            self.enqueue(Outbound {
                packet: entry.packet,
                on_write,
            })?;
        }
        Ok(())
    }

    /// Releases everything a buffered publish held when it is evicted.
    fn discard_buffered(&self, entry: crate::buffer::BufferedEntry) {
        let reason = MqttError::BufferDiscarded("evicted by newer message".into());
        match entry.packet.packet_id() {
            Some(id) => {
                self.tokens.resolve(&publish_key(id), Err(reason));
                self.ids.lock().release(id);
            }
            None => {
                if let Some(token) = entry.token {
                    token.resolve(Err(reason));
                }
            }
        }
    }

    /// Takes the engine offline. Subscribe/unsubscribe/connect tokens fail
    /// now, as do in-flight delivery tokens of a clean session (nothing will
    /// ever replay them). Delivery tokens of a non-clean session stay pending,
    /// backed by the store, until a later session finishes their handshake or
    /// the client shuts down; so do tokens of still-buffered messages, which
    /// flush with the next connection.
    pub fn connection_closed(&self, cause: &MqttError, defer: &[&str]) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        self.pending_connack.lock().take();
        self.fail_queued_writes(cause);

        let clean = self.clean_session.load(Ordering::SeqCst);
        let mut kept: Vec<String> = Vec::new();
        for key in self.tokens.keys() {
            if defer.contains(&key.as_str()) {
                kept.push(key);
            } else if let Some(id) = parse_key_id(&key, "Pub:") {
                // No sent record means the message is still buffered, not in
                // flight; it survives the loss either way.
                let in_flight = matches!(self.store.get(&sent_key(id)), Ok(Some(_)));
                if in_flight && clean {
                    self.store.remove(&sent_key(id)).ok();
                    self.ids.lock().release(id);
                } else {
                    kept.push(key);
                }
            } else if let Some(id) =
                parse_key_id(&key, "Sub:").or_else(|| parse_key_id(&key, "Unsub:"))
            {
                self.ids.lock().release(id);
            }
        }
        let kept_refs: Vec<&str> = kept.iter().map(String::as_str).collect();
        let failed = self.tokens.fail_all_except(&kept_refs, cause);
        if failed > 0 {
            tracing::debug!(failed, "failed outstanding tokens on connection close");
        }
    }

    /// Final teardown: every remaining token fails, the buffer empties, and
    /// new registrations are refused.
    pub fn shutdown(&self, cause: &MqttError, defer: &[&str]) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        self.pending_connack.lock().take();
        self.fail_queued_writes(cause);
        self.tokens.quiesce(MqttError::ClientClosed);
        self.buffer.lock().clear("client shut down");
        self.tokens.fail_all_except(defer, cause);
    }

    /// Fails the `on_write` tokens of queued packets the sender never wrote.
    /// QoS 0 tokens live outside the token store, so teardown has to reach
    /// them through the queue ledger.
    fn fail_queued_writes(&self, cause: &MqttError) {
        for token in self.queued_writes.lock().drain(..) {
            if !token.is_complete() {
                token.resolve(Err(cause.clone()));
            }
        }
    }

    /// Waits up to `timeout` for outstanding QoS > 0 deliveries to finish.
    pub async fn drain_inflight(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self
                .tokens
                .keys()
                .iter()
                .filter(|key| key.starts_with("Pub:"))
                .count();
            if pending == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(pending, "disconnect timeout with deliveries in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn parse_key_id(key: &str, prefix: &str) -> Option<u16> {
    key.strip_prefix(prefix)?.parse().ok()
}
