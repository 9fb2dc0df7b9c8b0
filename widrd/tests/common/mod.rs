use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use widr_common::{Allocation, AllocationId, Task, WorkloadIdentity};
use widrd::mock::ScriptedSigner;
use widrd::{IdentityHook, SharedTokenStore};

static INIT: Once = Once::new();

pub const FLOOR: Duration = Duration::from_secs(10);

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// Task with `(identity, ttl_secs)` pairs; a TTL of 0 never expires.
pub fn task(name: &str, identities: &[(&str, u64)]) -> Task {
    Task {
        name: name.to_string(),
        identities: identities
            .iter()
            .map(|(n, ttl)| WorkloadIdentity::new(*n, Duration::from_secs(*ttl)))
            .collect(),
    }
}

pub fn allocation(tasks: Vec<Task>) -> Arc<Allocation> {
    Arc::new(Allocation {
        id: AllocationId::new("8d3c5b51-7f0a-4b7e-9a55-3c1e5d2f0a11"),
        create_index: 42,
        tasks,
    })
}

/// Hook wired to `signer` with a fresh store and the test floor.
#[allow(dead_code)]
pub fn hook(
    alloc: &Arc<Allocation>,
    signer: &ScriptedSigner,
) -> (IdentityHook, Arc<SharedTokenStore>) {
    let store = Arc::new(SharedTokenStore::new(alloc.id.clone()));
    let hook = IdentityHook::new(alloc.clone(), Arc::new(signer.clone()), store.clone())
        .with_min_wait(FLOOR);
    (hook, store)
}
