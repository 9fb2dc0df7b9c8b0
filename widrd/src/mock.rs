//! Deterministic in-memory signer and sink for tests.
//!
//! `ScriptedSigner` replays queued responses FIFO and signs everything once
//! the script is exhausted. Every call is recorded with the tokio instant it
//! arrived at, so paused-clock tests can inspect the waits between calls.

use crate::signer::{IdentitySigner, SignError};
use crate::sink::{SinkError, TaskTokenSink};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use widr_common::{IdentityRequest, SignedIdentity};

/// One scripted signer response.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Sign every requested identity.
    SignAll,
    /// Fail the whole call.
    Fail(SignError),
    /// Succeed with zero identities.
    Empty,
    /// Sign everything except the named identities.
    Omit(Vec<String>),
    /// Return exactly these identities.
    Respond(Vec<SignedIdentity>),
}

/// A recorded `sign_identities` call.
#[derive(Debug, Clone)]
pub struct SignCall {
    pub min_index: u64,
    pub requests: Vec<IdentityRequest>,
    pub at: Instant,
}

impl SignCall {
    /// Identity names in request order.
    pub fn identity_names(&self) -> Vec<&str> {
        self.requests
            .iter()
            .map(|r| r.identity_name.as_str())
            .collect()
    }
}

struct SignerInner {
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<SignCall>>,
    call_count: watch::Sender<usize>,
    serial: AtomicU64,
}

#[derive(Clone)]
pub struct ScriptedSigner {
    inner: Arc<SignerInner>,
}

impl ScriptedSigner {
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_ttls(default_ttl, HashMap::new())
    }

    /// Per-identity-name TTLs; others use `default_ttl`.
    pub fn with_ttls(default_ttl: Duration, ttls: HashMap<String, Duration>) -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(SignerInner {
                default_ttl,
                ttls,
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                call_count,
                serial: AtomicU64::new(0),
            }),
        }
    }

    /// Append a scripted response. Responses are consumed FIFO.
    pub fn push(&self, response: Scripted) {
        self.inner
            .script
            .lock()
            .expect("script mutex poisoned")
            .push_back(response);
    }

    /// Snapshot of all calls received so far.
    pub fn calls(&self) -> Vec<SignCall> {
        self.inner
            .calls
            .lock()
            .expect("calls mutex poisoned")
            .clone()
    }

    pub fn call_count(&self) -> usize {
        *self.inner.call_count.borrow()
    }

    /// Resolve once at least `n` calls have been received.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.inner.call_count.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn sign(&self, req: &IdentityRequest) -> SignedIdentity {
        let ttl = self
            .inner
            .ttls
            .get(&req.identity_name)
            .copied()
            .unwrap_or(self.inner.default_ttl);
        let serial = self.inner.serial.fetch_add(1, Ordering::SeqCst);
        let expiration = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        SignedIdentity {
            task_name: req.task_name.clone(),
            identity_name: req.identity_name.clone(),
            token: format!("{}.{}.{serial}", req.task_name, req.identity_name),
            expiration,
        }
    }
}

#[async_trait]
impl IdentitySigner for ScriptedSigner {
    async fn sign_identities(
        &self,
        min_index: u64,
        requests: &[IdentityRequest],
    ) -> Result<Vec<SignedIdentity>, SignError> {
        self.inner
            .calls
            .lock()
            .expect("calls mutex poisoned")
            .push(SignCall {
                min_index,
                requests: requests.to_vec(),
                at: Instant::now(),
            });
        self.inner.call_count.send_modify(|count| *count += 1);

        let next = self
            .inner
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or(Scripted::SignAll);

        match next {
            Scripted::SignAll => Ok(requests.iter().map(|r| self.sign(r)).collect()),
            Scripted::Fail(err) => Err(err),
            Scripted::Empty => Ok(Vec::new()),
            Scripted::Omit(names) => Ok(requests
                .iter()
                .filter(|r| !names.contains(&r.identity_name))
                .map(|r| self.sign(r))
                .collect()),
            Scripted::Respond(signed) => Ok(signed),
        }
    }
}

/// Sink that records writes and can be told to fail for some identities.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    writes: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes for `identity` fail until [`RecordingSink::heal`].
    pub fn fail_identity(&self, identity: &str) {
        self.failing
            .lock()
            .expect("failing mutex poisoned")
            .insert(identity.to_string());
    }

    pub fn heal(&self, identity: &str) {
        self.failing
            .lock()
            .expect("failing mutex poisoned")
            .remove(identity);
    }

    /// Successful writes as (identity, token), in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().expect("writes mutex poisoned").clone()
    }

    pub fn writes_for(&self, identity: &str) -> usize {
        self.writes()
            .iter()
            .filter(|(name, _)| name == identity)
            .count()
    }
}

#[async_trait]
impl TaskTokenSink for RecordingSink {
    async fn apply_token(&self, identity: &str, token: &str) -> Result<(), SinkError> {
        if self
            .failing
            .lock()
            .expect("failing mutex poisoned")
            .contains(identity)
        {
            return Err(SinkError::Unavailable(format!("{identity} is failing")));
        }
        self.writes
            .lock()
            .expect("writes mutex poisoned")
            .push((identity.to_string(), token.to_string()));
        Ok(())
    }
}
