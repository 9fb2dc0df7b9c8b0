//! Identity hook: signs an allocation's workload identities at startup and
//! keeps them fresh with a background renewal loop.

use crate::lifecycle::{PrerunHook, RunnerHook, ShutdownHook, TaskStopHook, TaskStopRequest};
use crate::renew::{LoopState, RenewalLoop, RenewalStatus, TaskSinks};
use crate::schedule::RenewalSchedule;
use crate::signer::{IdentitySigner, SignError};
use crate::sink::{SinkError, TaskTokenSink};
use crate::store::SharedTokenStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use widr_common::{Allocation, AllocationId, RenewalTiming, SignedIdentity};

/// Errors surfaced by the identity hook. Only startup can fail.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("error fetching alternate identities for task {task}: {source}")]
    Sign {
        task: String,
        #[source]
        source: SignError,
    },

    #[error("error writing initial {identity} token for task {task}: {source}")]
    Sink {
        task: String,
        identity: String,
        #[source]
        source: SinkError,
    },

    #[error("identity hook already ran for allocation {0}")]
    AlreadyStarted(AllocationId),
}

/// Sets and renews the workload identity tokens of one allocation.
pub struct IdentityHook {
    alloc: Arc<Allocation>,
    signer: Arc<dyn IdentitySigner>,
    store: Arc<SharedTokenStore>,
    sinks: TaskSinks,
    timing: RenewalTiming,

    // Cancelled when the task is stopped or the agent shuts down. Unlike
    // prerun, the renewal loop outlives the startup call.
    stop: CancellationToken,
    status: Arc<watch::Sender<RenewalStatus>>,
    started: AtomicBool,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl IdentityHook {
    pub fn new(
        alloc: Arc<Allocation>,
        signer: Arc<dyn IdentitySigner>,
        store: Arc<SharedTokenStore>,
    ) -> Self {
        let (status, _) = watch::channel(RenewalStatus::default());
        Self {
            alloc,
            signer,
            store,
            sinks: HashMap::new(),
            timing: RenewalTiming::default(),
            stop: CancellationToken::new(),
            status: Arc::new(status),
            started: AtomicBool::new(false),
            renewal: Mutex::new(None),
        }
    }

    /// Register the sink receiving `task`'s tokens.
    pub fn with_task_sink(
        mut self,
        task: impl Into<String>,
        sink: Arc<dyn TaskTokenSink>,
    ) -> Self {
        self.sinks.insert(task.into(), sink);
        self
    }

    pub fn with_timing(mut self, timing: RenewalTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Override the renewal floor. Settable to ease testing.
    pub fn with_min_wait(mut self, min_wait: Duration) -> Self {
        self.timing.min_wait = min_wait;
        self
    }

    pub fn state(&self) -> LoopState {
        self.status.borrow().state
    }

    /// Watch the renewal loop's status.
    pub fn status(&self) -> watch::Receiver<RenewalStatus> {
        self.status.subscribe()
    }

    /// Wait for the renewal loop to exit after cancellation.
    ///
    /// Returns `true` once the loop has exited (or never ran). On timeout the
    /// loop is aborted and `false` is returned.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        let handle = self
            .renewal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return true;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(
                    alloc_id = %self.alloc.id,
                    error = %err,
                    "Identity renewal loop ended abnormally"
                );
                true
            }
            Err(_) => {
                warn!(
                    alloc_id = %self.alloc.id,
                    ?timeout,
                    "Identity renewal loop did not stop in time; aborting"
                );
                abort.abort();
                false
            }
        }
    }

    /// Sign every identity of every task, publish the tokens, and write them
    /// to the task sinks. Returns all signed identities.
    async fn get_identities(&self) -> Result<Vec<SignedIdentity>, HookError> {
        let alloc = &self.alloc;
        let mut fetched = Vec::new();

        for task in alloc.tasks_with_identities() {
            let requests = task.identity_requests(&alloc.id);
            let signed = self
                .signer
                .sign_identities(alloc.create_index, &requests)
                .await
                .map_err(|source| HookError::Sign {
                    task: task.name.clone(),
                    source,
                })?;

            let (signed, stray): (Vec<_>, Vec<_>) =
                signed.into_iter().partition(|s| s.task_name == task.name);
            for s in &stray {
                warn!(
                    task = %task.name,
                    identity = %s.key(),
                    "Bug: signer answered for another task"
                );
            }
            if signed.len() < requests.len() {
                warn!(
                    task = %task.name,
                    requested = requests.len(),
                    signed = signed.len(),
                    "Signer omitted identities; they will be renewed immediately"
                );
            }

            // Store task identities so other allocation-level consumers can
            // use them.
            let tokens: HashMap<String, String> = signed
                .iter()
                .map(|s| (s.identity_name.clone(), s.token.clone()))
                .collect();
            self.store.publish(&task.name, tokens);

            if let Some(sink) = self.sinks.get(&task.name) {
                for s in &signed {
                    sink.apply_token(&s.identity_name, &s.token)
                        .await
                        .map_err(|source| HookError::Sink {
                            task: task.name.clone(),
                            identity: s.identity_name.clone(),
                            source,
                        })?;
                }
            }

            fetched.extend(signed);
        }

        Ok(fetched)
    }
}

impl RunnerHook for IdentityHook {
    fn name(&self) -> &'static str {
        "identity"
    }
}

#[async_trait]
impl PrerunHook for IdentityHook {
    type Error = HookError;

    async fn prerun(&self) -> Result<(), HookError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HookError::AlreadyStarted(self.alloc.id.clone()));
        }

        let fetched = self.get_identities().await?;
        info!(
            alloc_id = %self.alloc.id,
            signed = fetched.len(),
            "Fetched workload identities"
        );

        let schedule = RenewalSchedule::new(&self.alloc, &fetched, self.timing);
        let renewal = RenewalLoop::new(
            self.alloc.create_index,
            schedule,
            self.signer.clone(),
            self.store.clone(),
            Arc::new(self.sinks.clone()),
            self.stop.clone(),
            self.status.clone(),
        );

        // Start token renewal loop
        let handle = tokio::spawn(renewal.run());
        *self.renewal.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl TaskStopHook for IdentityHook {
    type Error = HookError;

    async fn stop(&self, request: &TaskStopRequest) -> Result<(), HookError> {
        debug!(alloc_id = %self.alloc.id, task = ?request.task, "Stopping identity renewal");
        self.stop.cancel();
        Ok(())
    }
}

impl ShutdownHook for IdentityHook {
    fn shutdown(&self) {
        debug!(alloc_id = %self.alloc.id, "Shutting down identity renewal");
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingSink, Scripted, ScriptedSigner};
    use widr_common::{Task, WorkloadIdentity};

    fn alloc(tasks: Vec<Task>) -> Arc<Allocation> {
        Arc::new(Allocation {
            id: AllocationId::new("alloc-1"),
            create_index: 11,
            tasks,
        })
    }

    fn task(name: &str, identities: &[(&str, u64)]) -> Task {
        Task {
            name: name.to_string(),
            identities: identities
                .iter()
                .map(|(n, ttl)| WorkloadIdentity::new(*n, Duration::from_secs(*ttl)))
                .collect(),
        }
    }

    fn hook(alloc: Arc<Allocation>, signer: &ScriptedSigner) -> IdentityHook {
        let store = Arc::new(SharedTokenStore::new(alloc.id.clone()));
        IdentityHook::new(alloc, Arc::new(signer.clone()), store)
            .with_min_wait(Duration::from_secs(10))
    }

    #[test]
    fn name_is_stable() {
        let signer = ScriptedSigner::new(Duration::from_secs(60));
        assert_eq!(hook(alloc(vec![]), &signer).name(), "identity");
    }

    #[tokio::test(start_paused = true)]
    async fn prerun_signs_each_task_separately() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let alloc = alloc(vec![
            task("web", &[("default", 0), ("vault", 600)]),
            task("idle", &[]),
            task("db", &[("consul", 3600)]),
        ]);
        let hook = hook(alloc, &signer);

        hook.prerun().await.unwrap();

        let calls = signer.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.min_index == 11));
        assert_eq!(calls[0].identity_names(), vec!["default", "vault"]);
        assert_eq!(calls[1].identity_names(), vec!["consul"]);
        assert!(hook.store.get("web", "default").is_some());
        assert!(hook.store.get("db", "consul").is_some());

        hook.shutdown();
        assert!(hook.wait_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn prerun_writes_initial_tokens_to_sinks() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let sink = RecordingSink::new();
        let hook = hook(alloc(vec![task("web", &[("default", 0)])]), &signer)
            .with_task_sink("web", Arc::new(sink.clone()));

        hook.prerun().await.unwrap();
        assert_eq!(sink.writes(), vec![("default".to_string(), "web.default.0".to_string())]);
        assert!(hook.wait_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_sign_failure_is_fatal() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        signer.push(Scripted::Fail(SignError::Unavailable("no leader".into())));
        let hook = hook(alloc(vec![task("web", &[("vault", 600)])]), &signer);

        let err = hook.prerun().await.unwrap_err();
        assert!(matches!(err, HookError::Sign { ref task, .. } if task == "web"));
        assert!(err.to_string().contains("no leader"));
        // No loop was started.
        assert_eq!(hook.state(), LoopState::Idle);
        assert!(hook.wait_stopped(Duration::from_millis(1)).await);
        assert_eq!(signer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_sink_failure_is_fatal() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let sink = RecordingSink::new();
        sink.fail_identity("vault");
        let hook = hook(alloc(vec![task("web", &[("vault", 600)])]), &signer)
            .with_task_sink("web", Arc::new(sink));

        let err = hook.prerun().await.unwrap_err();
        assert!(matches!(err, HookError::Sink { ref identity, .. } if identity == "vault"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_prerun_is_rejected() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let hook = hook(alloc(vec![task("web", &[("vault", 600)])]), &signer);

        hook.prerun().await.unwrap();
        assert!(matches!(
            hook.prerun().await,
            Err(HookError::AlreadyStarted(_))
        ));
        assert_eq!(signer.call_count(), 1);

        hook.shutdown();
        assert!(hook.wait_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_shutdown_are_idempotent() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let hook = hook(alloc(vec![task("web", &[("vault", 600)])]), &signer);
        hook.prerun().await.unwrap();

        hook.stop(&TaskStopRequest::for_task("web")).await.unwrap();
        hook.stop(&TaskStopRequest::default()).await.unwrap();
        hook.shutdown();

        assert!(hook.wait_stopped(Duration::from_secs(1)).await);
        assert_eq!(hook.state(), LoopState::Stopped);
        assert_eq!(signer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stopped_times_out_and_aborts_running_loop() {
        let signer = ScriptedSigner::new(Duration::from_secs(3600));
        let hook = hook(alloc(vec![task("web", &[("vault", 600)])]), &signer);
        hook.prerun().await.unwrap();

        // Not cancelled, so the loop keeps sleeping.
        assert!(!hook.wait_stopped(Duration::from_millis(10)).await);
        hook.shutdown();
    }
}
