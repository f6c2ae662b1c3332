//! Buffering for sends issued while disconnected.
//!
//! When buffering is enabled, publishes attempted without a live connection
//! are queued here and flushed in order once the connection is back, after
//! any in-flight replay. The buffer is bounded; a full buffer either rejects
//! the newcomer or evicts its oldest entry, depending on policy.

use crate::error::{MqttError, Result};
use crate::packet::Packet;
use crate::store::{buffered_key, MessageStore, PersistedRecord, KEY_PREFIX_BUFFERED};
use crate::token::Token;
use crate::types::BufferConfig;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct BufferedEntry {
    pub packet: Packet,
    pub token: Option<Token>,
    seq: u64,
}

pub(crate) struct DisconnectedBuffer {
    config: BufferConfig,
    store: Option<Arc<dyn MessageStore>>,
    inner: Mutex<BufferInner>,
}

struct BufferInner {
    entries: VecDeque<BufferedEntry>,
    next_seq: u64,
}

impl DisconnectedBuffer {
    pub fn new(config: BufferConfig, store: Option<Arc<dyn MessageStore>>) -> Self {
        let store = if config.persist { store } else { None };
        Self {
            config,
            store,
            inner: Mutex::new(BufferInner {
                entries: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Queues one outbound packet. When the buffer is at capacity the oldest
    /// entry is evicted and returned (if the policy allows) so the caller can
    /// release whatever state it holds for it; otherwise the offer is
    /// rejected with [`MqttError::BufferFull`].
    pub fn offer(&self, packet: Packet, token: Option<Token>) -> Result<Option<BufferedEntry>> {
        if !self.config.enabled {
            return Err(MqttError::NotConnected);
        }

        let mut inner = self.inner.lock();
        let evicted = if inner.entries.len() >= self.config.max_messages {
            if !self.config.delete_oldest {
                return Err(MqttError::BufferFull);
            }
            inner.entries.pop_front()
        } else {
            None
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        if let Some(store) = &self.store {
            store.put(&buffered_key(seq), PersistedRecord::new(packet.clone()))?;
        }
        tracing::debug!(seq, packet = packet.name(), "buffered while disconnected");
        inner.entries.push_back(BufferedEntry { packet, token, seq });
        drop(inner);

        if let Some(entry) = &evicted {
            self.unpersist(entry.seq);
            tracing::debug!(seq = entry.seq, "evicting oldest buffered message");
        }
        Ok(evicted)
    }

    /// Takes every queued entry without touching the persisted mirror, for
    /// handing the queue over to a successor buffer.
    pub fn take(&self) -> Vec<BufferedEntry> {
        self.inner.lock().entries.drain(..).collect()
    }

    /// Re-queues entries taken from a predecessor, keeping their sequence
    /// numbers and moving the counter past them.
    pub fn adopt(&self, entries: Vec<BufferedEntry>) {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.next_seq = inner.next_seq.max(entry.seq + 1);
            inner.entries.push_back(entry);
        }
    }

    /// Reloads `sb-` records left behind by a previous process, oldest first,
    /// and seeds the sequence counter past them. Entries already in the queue
    /// are left alone. Returns the packet ids of the restored publishes.
    pub fn restore(&self) -> Result<Vec<u16>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut inner = self.inner.lock();
        let present: HashSet<u64> = inner.entries.iter().map(|e| e.seq).collect();
        let mut restored: Vec<BufferedEntry> = Vec::new();
        for key in store.keys()? {
            let Some(seq) = key
                .strip_prefix(KEY_PREFIX_BUFFERED)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if present.contains(&seq) {
                continue;
            }
            if let Some(record) = store.get(&key)? {
                restored.push(BufferedEntry {
                    packet: record.packet,
                    token: None,
                    seq,
                });
            }
        }
        restored.sort_by_key(|e| e.seq);
        let ids = restored
            .iter()
            .filter_map(|e| e.packet.packet_id())
            .collect();
        for entry in restored {
            inner.next_seq = inner.next_seq.max(entry.seq + 1);
            inner.entries.push_back(entry);
        }
        inner
            .entries
            .make_contiguous()
            .sort_by_key(|entry| entry.seq);
        Ok(ids)
    }

    /// Takes every queued entry, oldest first, clearing the persisted mirror.
    pub fn drain(&self) -> Vec<BufferedEntry> {
        let entries: Vec<BufferedEntry> = self.inner.lock().entries.drain(..).collect();
        for entry in &entries {
            self.unpersist(entry.seq);
        }
        entries
    }

    /// Drops every queued entry, failing their tokens. The persisted mirror
    /// stays intact so a later process can still restore and send them.
    pub fn clear(&self, reason: &str) {
        for entry in self.take() {
            if let Some(token) = entry.token {
                token.resolve(Err(MqttError::BufferDiscarded(reason.to_string())));
            }
        }
    }

    fn unpersist(&self, seq: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&buffered_key(seq)) {
                tracing::warn!(seq, error = %e, "failed to unpersist buffered message");
            }
        }
    }
}
