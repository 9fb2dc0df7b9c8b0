//! Signing boundary: the contract the hook and renewal loop consume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use widr_common::{Allocation, IdentityKey, IdentityRequest, SignedIdentity};

/// Errors returned by a signer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("signing service unavailable: {0}")]
    Unavailable(String),

    #[error("signing request rejected: {0}")]
    Rejected(String),

    /// The service has not caught up to the requested consistency index.
    #[error("signing service state at index {current} is older than required index {required}")]
    StaleIndex { required: u64, current: u64 },
}

/// Signs batches of workload identities.
///
/// The signer may answer with fewer identities than requested; callers handle
/// omissions per identity. `min_index` is a consistency lower bound: answers
/// must not be computed from state older than it.
#[async_trait]
pub trait IdentitySigner: Send + Sync {
    async fn sign_identities(
        &self,
        min_index: u64,
        requests: &[IdentityRequest],
    ) -> Result<Vec<SignedIdentity>, SignError>;
}

/// Local development signer.
///
/// Issues opaque, unsigned placeholder tokens with the expirations a real
/// signer would use. Identities not declared in the allocation are omitted
/// from the response.
#[derive(Debug)]
pub struct DevSigner {
    index: u64,
    ttls: HashMap<IdentityKey, Duration>,
}

/// Expiration used for identities that never expire.
fn non_expiring() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

impl DevSigner {
    pub fn new(alloc: &Allocation) -> Self {
        let ttls = alloc
            .tasks
            .iter()
            .flat_map(|t| {
                t.identities
                    .iter()
                    .map(|w| (IdentityKey::new(&t.name, &w.name), w.ttl))
            })
            .collect();
        Self {
            index: alloc.create_index,
            ttls,
        }
    }

    fn expiration(ttl: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        if ttl.is_zero() {
            return non_expiring();
        }
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(non_expiring)
    }
}

#[async_trait]
impl IdentitySigner for DevSigner {
    async fn sign_identities(
        &self,
        min_index: u64,
        requests: &[IdentityRequest],
    ) -> Result<Vec<SignedIdentity>, SignError> {
        if min_index > self.index {
            return Err(SignError::StaleIndex {
                required: min_index,
                current: self.index,
            });
        }

        let now = Utc::now();
        let signed: Vec<SignedIdentity> = requests
            .iter()
            .filter_map(|req| {
                let ttl = self.ttls.get(&req.key())?;
                Some(SignedIdentity {
                    task_name: req.task_name.clone(),
                    identity_name: req.identity_name.clone(),
                    token: format!("dev.{}.{}", req.alloc_id, uuid::Uuid::new_v4().simple()),
                    expiration: Self::expiration(*ttl, now),
                })
            })
            .collect();

        debug!(
            requested = requests.len(),
            signed = signed.len(),
            "Dev signer issued tokens"
        );
        Ok(signed)
    }
}
