//! Background renewal loop: sleeps until the soonest token needs refreshing,
//! renews every managed identity in one batch, applies the results and
//! reschedules, until cancelled.

use crate::schedule::{CycleReport, RenewalOutcome, RenewalSchedule};
use crate::signer::IdentitySigner;
use crate::sink::TaskTokenSink;
use crate::store::SharedTokenStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use widr_common::SignedIdentity;

/// Per-task sinks, keyed by task name.
pub type TaskSinks = HashMap<String, Arc<dyn TaskTokenSink>>;

/// State of a renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Computing the next wait.
    Idle,
    /// Waiting for the timer or cancellation.
    Sleeping,
    /// Batched signing call in flight.
    Refreshing,
    /// Writing results to the store and sinks.
    Applying,
    /// Cancelled or out of work. Terminal.
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Refreshing => write!(f, "refreshing"),
            Self::Applying => write!(f, "applying"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot published by the loop on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalStatus {
    pub state: LoopState,
    /// Consecutive failed cycles.
    pub retry: u64,
    /// Wait chosen for the current or most recent sleep.
    pub next_wait: Duration,
    /// Signing calls issued by this loop.
    pub attempts: u64,
}

impl Default for RenewalStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            retry: 0,
            next_wait: Duration::ZERO,
            attempts: 0,
        }
    }
}

/// One renewal loop. Owns its working set exclusively.
pub struct RenewalLoop {
    create_index: u64,
    schedule: RenewalSchedule,
    signer: Arc<dyn IdentitySigner>,
    store: Arc<SharedTokenStore>,
    sinks: Arc<TaskSinks>,
    cancel: CancellationToken,
    status: Arc<watch::Sender<RenewalStatus>>,
    attempts: u64,
}

impl RenewalLoop {
    pub fn new(
        create_index: u64,
        schedule: RenewalSchedule,
        signer: Arc<dyn IdentitySigner>,
        store: Arc<SharedTokenStore>,
        sinks: Arc<TaskSinks>,
        cancel: CancellationToken,
        status: Arc<watch::Sender<RenewalStatus>>,
    ) -> Self {
        Self {
            create_index,
            schedule,
            signer,
            store,
            sinks,
            cancel,
            status,
            attempts: 0,
        }
    }

    fn set_state(&self, state: LoopState, next_wait: Duration) {
        self.status.send_replace(RenewalStatus {
            state,
            retry: self.schedule.retry(),
            next_wait,
            attempts: self.attempts,
        });
    }

    /// Run until cancelled. Never returns an error: failures are retried.
    pub async fn run(mut self) {
        let alloc_id = self.store.alloc_id().clone();

        if self.schedule.is_empty() {
            trace!(%alloc_id, "No workload identities expire");
            self.set_state(LoopState::Stopped, Duration::ZERO);
            return;
        }

        self.set_state(LoopState::Idle, Duration::ZERO);
        let mut wait = self.schedule.next_wait(Utc::now());

        while !self.cancel.is_cancelled() {
            self.set_state(LoopState::Sleeping, wait);
            debug!(%alloc_id, num = self.schedule.len(), ?wait, "Waiting to renew identities");

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let requests = self.schedule.requests();
            trace!(%alloc_id, num = requests.len(), "Getting new signed identities");
            self.attempts += 1;
            self.set_state(LoopState::Refreshing, wait);

            // Renew all tokens together since it's cheap.
            let response = self
                .signer
                .sign_identities(self.create_index, &requests)
                .await;

            wait = match RenewalOutcome::from_response(&requests, response) {
                RenewalOutcome::NothingToRenew => break,
                RenewalOutcome::Failed(err) => {
                    let next = self.schedule.record_failure();
                    error!(
                        %alloc_id,
                        error = %err,
                        retry = self.schedule.retry(),
                        next = ?next,
                        "Error renewing workload identities"
                    );
                    next
                }
                RenewalOutcome::Empty => {
                    let next = self.schedule.record_failure();
                    error!(
                        %alloc_id,
                        error = "no tokens",
                        retry = self.schedule.retry(),
                        next = ?next,
                        "Error renewing workload identities"
                    );
                    next
                }
                RenewalOutcome::Renewed(tokens) => {
                    self.set_state(LoopState::Applying, wait);
                    self.apply(tokens).await
                }
            };

            self.set_state(LoopState::Idle, wait);
        }

        debug!(%alloc_id, "Identity renewal loop stopped");
        self.set_state(LoopState::Stopped, wait);
    }

    /// Write every returned token to the store and its task's sink, then
    /// fold the results into the schedule.
    async fn apply(&mut self, tokens: Vec<SignedIdentity>) -> Duration {
        let mut report = CycleReport::default();

        for token in tokens {
            let key = token.key();
            let Some(spec) = self.schedule.spec(&key) else {
                // Every requested identity should either be signed or omitted.
                warn!(identity = %key, "Bug: unexpected workload identity received");
                report.unexpected(key);
                continue;
            };
            trace!(
                identity = %key,
                ttl = ?spec.ttl,
                expiration = %token.expiration,
                "Renewed identity"
            );

            self.store
                .update(&token.task_name, &token.identity_name, &token.token);

            let written = match self.sinks.get(&token.task_name) {
                Some(sink) => sink.apply_token(&token.identity_name, &token.token).await,
                None => Ok(()),
            };
            match written {
                Ok(()) => report.renewed(key, token.expiration),
                Err(err) => {
                    error!(identity = %key, error = %err, "Error setting new workload identity");
                    report.sink_failed(key);
                }
            }
        }

        let summary = self.schedule.complete_cycle(report, Utc::now());
        for key in &summary.missing {
            warn!(identity = %key, "Bug: requested workload identity was not signed or rejected");
        }
        if summary.clean {
            debug!(next = ?summary.wait, "Renewed workload identities");
        } else {
            warn!(
                retry = self.schedule.retry(),
                next = ?summary.wait,
                "Workload identity renewal incomplete"
            );
        }
        summary.wait
    }
}
