//! Working set of a renewal loop: which identities it manages, when each one
//! is next due, and the retry counter.
//!
//! Pure bookkeeping. The loop does the I/O and reports back here, which keeps
//! every timing decision testable with an explicit `now`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use widr_common::{
    Allocation, AllocationId, IdentityKey, IdentityRequest, RenewalTiming, SignedIdentity,
    WorkloadIdentity,
};

use crate::signer::SignError;

/// Result of one batched renewal call.
#[derive(Debug)]
pub enum RenewalOutcome {
    /// No identity needs renewing; the loop has nothing to do.
    NothingToRenew,
    /// The signer answered with at least one identity.
    Renewed(Vec<SignedIdentity>),
    /// The signer answered a non-empty request with nothing.
    Empty,
    /// The call itself failed.
    Failed(SignError),
}

impl RenewalOutcome {
    pub fn from_response(
        requests: &[IdentityRequest],
        response: Result<Vec<SignedIdentity>, SignError>,
    ) -> Self {
        if requests.is_empty() {
            return Self::NothingToRenew;
        }
        match response {
            Err(err) => Self::Failed(err),
            Ok(tokens) if tokens.is_empty() => Self::Empty,
            Ok(tokens) => Self::Renewed(tokens),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    spec: WorkloadIdentity,
    /// Expiration of the current token; `None` until first signed.
    expiration: Option<DateTime<Utc>>,
    /// Forced check time after a failed write or an unanswered request.
    recheck_at: Option<DateTime<Utc>>,
}

/// Per-identity results of applying one renewal response.
#[derive(Debug, Default)]
pub struct CycleReport {
    renewed: Vec<(IdentityKey, DateTime<Utc>)>,
    sink_failures: Vec<IdentityKey>,
    unexpected: Vec<IdentityKey>,
}

impl CycleReport {
    pub fn renewed(&mut self, key: IdentityKey, expiration: DateTime<Utc>) {
        self.renewed.push((key, expiration));
    }

    pub fn sink_failed(&mut self, key: IdentityKey) {
        self.sink_failures.push(key);
    }

    pub fn unexpected(&mut self, key: IdentityKey) {
        self.unexpected.push(key);
    }
}

/// What the loop does next after a completed cycle.
#[derive(Debug)]
pub struct CycleSummary {
    pub wait: Duration,
    /// Every requested identity was renewed and written.
    pub clean: bool,
    /// Requested identities the signer did not answer.
    pub missing: Vec<IdentityKey>,
}

/// Renewal working set for one allocation.
#[derive(Debug)]
pub struct RenewalSchedule {
    alloc_id: AllocationId,
    entries: BTreeMap<IdentityKey, Entry>,
    retry: u64,
    timing: RenewalTiming,
}

impl RenewalSchedule {
    /// Build the working set from every expiring identity of every task,
    /// seeded with the tokens fetched at startup.
    pub fn new(alloc: &Allocation, signed: &[SignedIdentity], timing: RenewalTiming) -> Self {
        let mut entries = BTreeMap::new();
        for task in &alloc.tasks {
            for wid in task.renewable_identities() {
                entries.insert(
                    IdentityKey::new(&task.name, &wid.name),
                    Entry {
                        spec: wid.clone(),
                        expiration: None,
                        recheck_at: None,
                    },
                );
            }
        }
        for token in signed {
            if let Some(entry) = entries.get_mut(&token.key()) {
                entry.expiration = Some(token.expiration);
            }
        }

        Self {
            alloc_id: alloc.id.clone(),
            entries,
            retry: 0,
            timing,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn retry(&self) -> u64 {
        self.retry
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn spec(&self, key: &IdentityKey) -> Option<&WorkloadIdentity> {
        self.entries.get(key).map(|e| &e.spec)
    }

    /// One request per managed identity; every cycle renews them together.
    pub fn requests(&self) -> Vec<IdentityRequest> {
        self.entries
            .keys()
            .map(|key| IdentityRequest::new(self.alloc_id.clone(), &key.task, &key.identity))
            .collect()
    }

    /// How long to sleep before the next renewal.
    ///
    /// Zero if any identity has never been signed. Otherwise the earlier of
    /// the renew time of the soonest-expiring token and any forced recheck.
    pub fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        let mut min_exp: Option<DateTime<Utc>> = None;
        let mut min_recheck: Option<DateTime<Utc>> = None;

        for entry in self.entries.values() {
            match (entry.recheck_at, entry.expiration) {
                (Some(at), _) => min_recheck = Some(min_recheck.map_or(at, |m| m.min(at))),
                (None, Some(exp)) => min_exp = Some(min_exp.map_or(exp, |m| m.min(exp))),
                // Missing a signature: treat as already expired.
                (None, None) => return Duration::ZERO,
            }
        }

        let renew = min_exp.map(|exp| self.timing.renew_wait(exp, now));
        let recheck = min_recheck.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        match (renew, recheck) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => Duration::ZERO,
        }
    }

    /// Record a failed or empty renewal call and return the backoff wait.
    pub fn record_failure(&mut self) -> Duration {
        self.retry += 1;
        self.timing.retry_wait(self.retry)
    }

    /// Fold a cycle's per-identity results into the working set.
    pub fn complete_cycle(&mut self, report: CycleReport, now: DateTime<Utc>) -> CycleSummary {
        let answered: Vec<IdentityKey> = report
            .renewed
            .iter()
            .map(|(k, _)| k.clone())
            .chain(report.sink_failures.iter().cloned())
            .collect();

        for (key, expiration) in &report.renewed {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.expiration = Some(*expiration);
                entry.recheck_at = None;
            }
        }

        // Failed writes and unanswered requests are retried on the backoff
        // schedule instead of waiting for the real expiration.
        let recheck_at = after(now, self.timing.retry_wait(self.retry + 1));
        for key in &report.sink_failures {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.recheck_at = Some(recheck_at);
            }
        }

        let missing: Vec<IdentityKey> = self
            .entries
            .keys()
            .filter(|k| !answered.contains(k))
            .cloned()
            .collect();
        for key in &missing {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.recheck_at = Some(recheck_at);
            }
        }

        let clean =
            report.sink_failures.is_empty() && report.unexpected.is_empty() && missing.is_empty();

        let mut wait = self.next_wait(now);
        if !report.unexpected.is_empty() {
            wait = wait.min(self.timing.retry_wait(self.retry + 1));
        }

        if clean {
            self.retry = 0;
        } else {
            self.retry += 1;
        }

        CycleSummary {
            wait,
            clean,
            missing,
        }
    }
}

fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
