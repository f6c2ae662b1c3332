//! Pending-request tokens and the in-flight token store.

use crate::error::{MqttError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Completion handle for one outstanding asynchronous operation.
///
/// Returned immediately from `connect`/`publish`/`subscribe`/... and resolved
/// exactly once when the operation's final acknowledgement arrives or the
/// operation fails. Cloning shares the same underlying request.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

struct TokenState {
    key: Option<String>,
    complete: bool,
    result: Option<Result<()>>,
    context: Option<Arc<dyn Any + Send + Sync>>,
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl Token {
    #[must_use]
    pub fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState {
                    key: None,
                    complete: false,
                    result: None,
                    context: None,
                }),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Binds the token to an operation key. A token still in flight cannot be
    /// reused for another request; a completed token may be, which resets its
    /// result.
    pub(crate) fn bind(&self, key: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.key.is_some() && !state.complete {
            return Err(MqttError::TokenInUse(
                state.key.clone().unwrap_or_default(),
            ));
        }
        state.key = Some(key.to_string());
        state.complete = false;
        state.result = None;
        drop(state);
        self.inner.done_tx.send_replace(false);
        Ok(())
    }

    #[must_use]
    pub fn key(&self) -> Option<String> {
        self.inner.state.lock().key.clone()
    }

    /// Attaches an application correlation object readable after completion.
    pub fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        self.inner.state.lock().context = Some(context);
    }

    #[must_use]
    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.state.lock().context.clone()
    }

    /// Marks the request complete. A second resolution of the same request is
    /// a bug in the engine; it is logged and ignored rather than crashing.
    pub(crate) fn resolve(&self, result: Result<()>) {
        {
            let mut state = self.inner.state.lock();
            if state.complete {
                tracing::warn!(key = ?state.key, "token resolved twice, ignoring");
                return;
            }
            state.complete = true;
            state.result = Some(result);
        }
        self.inner.done_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().complete
    }

    /// The failure cause, if the request completed with an error.
    #[must_use]
    pub fn failure(&self) -> Option<MqttError> {
        match self.inner.state.lock().result {
            Some(Err(ref e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Waits for completion and re-raises the failure, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.inner.done_rx.clone();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| MqttError::Incomplete)?;
        self.inner
            .state
            .lock()
            .result
            .clone()
            .unwrap_or(Err(MqttError::Incomplete))
    }

    /// Like [`wait`](Self::wait) with a bound. Timing out affects only this
    /// waiter; the underlying operation keeps progressing.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::Timeout),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Token")
            .field("key", &state.key)
            .field("complete", &state.complete)
            .finish()
    }
}

/// Maps in-flight request keys to their tokens.
///
/// A key maps to at most one live token at a time. While quiesced (during
/// teardown) every new registration is rejected with the quiesce reason.
pub struct TokenStore {
    inner: Mutex<TokenStoreInner>,
}

struct TokenStoreInner {
    tokens: HashMap<String, Token>,
    quiesced: Option<MqttError>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TokenStoreInner {
                tokens: HashMap::new(),
                quiesced: None,
            }),
        }
    }

    pub fn register(&self, key: &str, token: Token) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.quiesced {
            return Err(reason.clone());
        }
        if inner.tokens.contains_key(key) {
            return Err(MqttError::TokenInUse(key.to_string()));
        }
        inner.tokens.insert(key.to_string(), token);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Token> {
        self.inner.lock().tokens.get(key).cloned()
    }

    /// Removes and completes the token for `key`. Resolving an unknown key is
    /// treated as a bug signal, not a crash.
    pub fn resolve(&self, key: &str, result: Result<()>) -> Option<Token> {
        let token = self.inner.lock().tokens.remove(key);
        match token {
            Some(token) => {
                token.resolve(result);
                Some(token)
            }
            None => {
                tracing::warn!(key, "resolve for unknown token key");
                None
            }
        }
    }

    /// Like [`resolve`](Self::resolve) but silent when the key has no token,
    /// for teardown paths where absence is normal.
    pub fn resolve_if_present(&self, key: &str, result: Result<()>) {
        let token = self.inner.lock().tokens.remove(key);
        if let Some(token) = token {
            token.resolve(result);
        }
    }

    /// Fails every outstanding token except the listed keys (the current
    /// connect/disconnect token is deferred to the end of teardown).
    pub fn fail_all_except(&self, except: &[&str], reason: &MqttError) -> usize {
        let drained: Vec<(String, Token)> = {
            let mut inner = self.inner.lock();
            let keep: Vec<(String, Token)> = except
                .iter()
                .filter_map(|k| inner.tokens.remove(*k).map(|t| ((*k).to_string(), t)))
                .collect();
            let drained = inner.tokens.drain().collect();
            inner.tokens.extend(keep);
            drained
        };
        let count = drained.len();
        for (key, token) in drained {
            tracing::debug!(key = %key, reason = %reason, "failing outstanding token");
            token.resolve(Err(reason.clone()));
        }
        count
    }

    /// Rejects all future registrations with `reason` until [`reopen`](Self::reopen).
    pub fn quiesce(&self, reason: MqttError) {
        self.inner.lock().quiesced = Some(reason);
    }

    pub fn reopen(&self) {
        self.inner.lock().quiesced = None;
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().tokens.len()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().tokens.keys().cloned().collect()
    }
}
