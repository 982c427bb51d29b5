//! # Generation Job Tracking
//!
//! Drives a client through the lifecycle of a server-side email generation
//! job: reconcile with any job already running for the signal, submit a new
//! one, then poll it to a terminal state. Polling is self-scheduled and
//! chained — each delay starts only after the previous response lands — with
//! a two-phase cadence: tight feedback while most jobs finish, then a
//! degraded interval so long runners do not burn a request every few
//! seconds. A hard attempt ceiling turns a stuck job into a client-side
//! timeout failure.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::registry::{CleanupRegistry, ManagedOperation};
use crate::retrieve::http::ApiClient;

const TIMEOUT_MESSAGE: &str = "Timed out waiting for the generation to finish";

/// Server-side job states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Per-item outcome inside a finished generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailOutcome {
    Generated,
    Error,
}

/// One produced artifact of a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedEmail {
    pub contact_id: String,
    pub sequence_step: u32,
    pub block_id: String,
    pub block_name: String,
    pub subject: String,
    pub body: String,
    pub status: EmailOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sources: Option<Vec<Value>>,
}

/// Full job snapshot as returned by the poll endpoint. Mutated only by poll
/// responses; the most recent response wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailGenerationStatus {
    pub generation_id: String,
    pub status: JobStatus,
    pub total_emails: u32,
    #[serde(default)]
    pub contacts_processed: u32,
    #[serde(default)]
    pub generated_emails: Vec<GeneratedEmail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Submission payload for a new job.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub sequence_id: String,
    pub signal_id: String,
    pub contacts: Vec<Value>,
    pub company_data: Value,
    pub custom_data: Value,
}

/// Acknowledgement returned by the submission endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationStarted {
    pub generation_id: String,
    pub status: JobStatus,
    pub total_emails: u32,
}

/// Result of the per-signal lookup used for startup reconciliation.
#[derive(Debug, Clone)]
pub enum SignalLookup {
    Found(EmailGenerationStatus),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The server refused the request outright; no job was created.
    #[error("generation request rejected: {message}")]
    Rejected { message: String },
    /// The endpoint could not be reached or answered garbage. Transient for
    /// polls, terminal for submissions.
    #[error("generation endpoint unreachable: {source}")]
    Transport {
        #[source]
        source: anyhow::Error,
    },
}

/// Server API surface the tracker drives. Kept as a trait so the polling
/// state machine is testable against a scripted fake.
pub trait GenerationApi: Send + Sync + 'static {
    fn start_generation(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<GenerationStarted, GenerationError>> + Send;

    fn fetch_generation(
        &self,
        generation_id: &str,
    ) -> impl Future<Output = Result<EmailGenerationStatus, GenerationError>> + Send;

    fn find_by_signal(
        &self,
        signal_id: &str,
    ) -> impl Future<Output = Result<SignalLookup, GenerationError>> + Send;
}

/// Cadence and budget knobs. Defaults match the product's feedback
/// trade-off: most jobs finish inside the first ten polls.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub fast_interval: Duration,
    pub fast_poll_limit: u32,
    pub slow_interval: Duration,
    /// Delay before the single confirmation poll after `completed`.
    pub confirmation_delay: Duration,
    /// Hard ceiling; roughly ten minutes measured at the degraded cadence.
    pub max_poll_attempts: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(3),
            fast_poll_limit: 10,
            slow_interval: Duration::from_secs(10),
            confirmation_delay: Duration::from_secs(1),
            max_poll_attempts: 60,
        }
    }
}

/// Cadence policy: interval to wait before poll number `poll_number`
/// (1-based). Pure so it is testable apart from the timer plumbing.
pub fn poll_interval(config: &GenerationConfig, poll_number: u32) -> Duration {
    if poll_number <= config.fast_poll_limit {
        config.fast_interval
    } else {
        config.slow_interval
    }
}

/// What consumers observe: the latest job snapshot plus request-level
/// loading/error flags.
#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    pub generation: Option<EmailGenerationStatus>,
    pub loading: bool,
    pub error: Option<String>,
}

impl TrackerState {
    pub fn is_in_progress(&self) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|g| g.status.is_active())
    }

    pub fn has_results(&self) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|g| g.status == JobStatus::Completed && !g.generated_emails.is_empty())
    }

    pub fn has_failed(&self) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|g| g.status == JobStatus::Failed)
    }
}

/// Tracks one signal's generation job. Owns at most one polling loop at a
/// time; starting a new job replaces the old snapshot and loop.
pub struct GenerationTracker<A: GenerationApi> {
    api: Arc<A>,
    registry: CleanupRegistry,
    config: GenerationConfig,
    signal_id: String,
    state: Arc<watch::Sender<TrackerState>>,
    state_rx: watch::Receiver<TrackerState>,
    poll_guard: Mutex<Option<Arc<ManagedOperation>>>,
}

impl<A: GenerationApi> GenerationTracker<A> {
    pub fn new(api: Arc<A>, registry: CleanupRegistry, signal_id: impl Into<String>) -> Self {
        Self::with_config(api, registry, signal_id, GenerationConfig::default())
    }

    pub fn with_config(
        api: Arc<A>,
        registry: CleanupRegistry,
        signal_id: impl Into<String>,
        config: GenerationConfig,
    ) -> Self {
        let (tx, rx) = watch::channel(TrackerState::default());
        Self {
            api,
            registry,
            config,
            signal_id: signal_id.into(),
            state: Arc::new(tx),
            state_rx: rx,
            poll_guard: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> TrackerState {
        self.state_rx.borrow().clone()
    }

    /// Startup reconciliation: ask whether a job already exists for this
    /// signal before offering to start one, so a remounted consumer does
    /// not submit a duplicate. Also usable as a manual refresh.
    pub async fn refresh_status(&self) {
        if self.signal_id.is_empty() {
            return;
        }
        self.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });

        match self.api.find_by_signal(&self.signal_id).await {
            Ok(SignalLookup::Found(status)) => {
                let follow = status.status.is_active();
                let generation_id = status.generation_id.clone();
                self.state.send_modify(|s| {
                    s.generation = Some(status);
                    s.loading = false;
                    s.error = None;
                });
                if follow {
                    self.spawn_poll_loop(generation_id);
                }
            }
            Ok(SignalLookup::NotFound) => {
                self.state.send_modify(|s| {
                    s.generation = None;
                    s.loading = false;
                    s.error = None;
                });
            }
            Err(e) => {
                log::error!("Failed to check existing generation: {}", e);
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(e.to_string());
                });
            }
        }
    }

    /// Submits a new job and begins tracking it. Returns the new job id, or
    /// `None` when the submission is rejected or the request is not
    /// actionable (no signal, no sequence, no contacts).
    pub async fn start_generation(&self, request: GenerationRequest) -> Option<String> {
        if self.signal_id.is_empty() || request.sequence_id.is_empty() || request.contacts.is_empty()
        {
            return None;
        }
        self.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });

        match self.api.start_generation(&request).await {
            Ok(started) => {
                let snapshot = EmailGenerationStatus {
                    generation_id: started.generation_id.clone(),
                    status: started.status,
                    total_emails: started.total_emails,
                    contacts_processed: 0,
                    generated_emails: Vec::new(),
                    error_message: None,
                    created_at: None,
                    updated_at: None,
                };
                self.state.send_modify(|s| {
                    s.generation = Some(snapshot);
                    s.loading = false;
                    s.error = None;
                });
                if started.status.is_active() {
                    self.spawn_poll_loop(started.generation_id.clone());
                }
                Some(started.generation_id)
            }
            Err(e) => {
                log::error!("Failed to start generation: {}", e);
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(e.to_string());
                });
                None
            }
        }
    }

    /// Replaces any running poll loop with a fresh one for `generation_id`.
    fn spawn_poll_loop(&self, generation_id: String) {
        let mut guard = self
            .poll_guard
            .lock()
            .expect("GenerationTracker lock poisoned");
        if let Some(previous) = guard.take() {
            previous.cancel();
        }
        let operation = Arc::new(self.registry.managed_operation());
        let token = operation.token();
        *guard = Some(Arc::clone(&operation));

        let api = Arc::clone(&self.api);
        let registry = self.registry.clone();
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            run_poll_loop(api, registry, config, state, generation_id, token).await;
            // Release the registry slot once the loop exits on its own.
            operation.cancel();
        });
    }
}

impl<A: GenerationApi> Drop for GenerationTracker<A> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.poll_guard.lock() {
            if let Some(operation) = guard.take() {
                operation.cancel();
            }
        }
    }
}

async fn run_poll_loop<A: GenerationApi>(
    api: Arc<A>,
    registry: CleanupRegistry,
    config: GenerationConfig,
    state: Arc<watch::Sender<TrackerState>>,
    generation_id: String,
    token: CancellationToken,
) {
    let mut polls: u32 = 0;

    loop {
        if token.is_cancelled() {
            return;
        }
        // The loop is superseded when another job replaced the snapshot.
        let status = {
            let current = state.borrow();
            match current.generation.as_ref() {
                Some(g) if g.generation_id == generation_id => g.status,
                _ => return,
            }
        };

        match status {
            JobStatus::Failed => return,
            JobStatus::Completed => {
                // One delayed confirmation poll: the last result item may
                // have been written after the status flipped.
                if !sleep_raced(&registry, config.confirmation_delay, &token).await {
                    return;
                }
                match api.fetch_generation(&generation_id).await {
                    Ok(fresh) => apply_poll_response(&state, &generation_id, fresh),
                    Err(e) => log::warn!(
                        "Confirmation poll failed for generation {}: {}",
                        generation_id,
                        e
                    ),
                }
                return;
            }
            JobStatus::Pending | JobStatus::InProgress => {
                if polls >= config.max_poll_attempts {
                    log::warn!(
                        "Generation {} still not terminal after {} polls. Giving up.",
                        generation_id,
                        polls
                    );
                    state.send_modify(|s| {
                        if let Some(g) = s.generation.as_mut() {
                            if g.generation_id == generation_id {
                                g.status = JobStatus::Failed;
                                g.error_message = Some(TIMEOUT_MESSAGE.to_string());
                            }
                        }
                    });
                    return;
                }

                if !sleep_raced(&registry, poll_interval(&config, polls + 1), &token).await {
                    return;
                }
                polls += 1;
                match api.fetch_generation(&generation_id).await {
                    Ok(fresh) => apply_poll_response(&state, &generation_id, fresh),
                    // Transient; the job is only failed by the server or by
                    // the attempt ceiling.
                    Err(e) => log::warn!(
                        "Poll {} failed for generation {}: {}",
                        polls,
                        generation_id,
                        e
                    ),
                }
            }
        }
    }
}

async fn sleep_raced(
    registry: &CleanupRegistry,
    delay: Duration,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        fired = registry.managed_sleep(delay) => fired,
    }
}

fn apply_poll_response(
    state: &watch::Sender<TrackerState>,
    generation_id: &str,
    fresh: EmailGenerationStatus,
) {
    state.send_modify(|s| {
        if s.generation
            .as_ref()
            .is_some_and(|g| g.generation_id == generation_id)
        {
            s.generation = Some(fresh);
            s.error = None;
        }
    });
}

/// Production `GenerationApi` over the shared retrieval client.
pub struct HttpGenerationApi {
    client: Arc<ApiClient>,
}

impl HttpGenerationApi {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

impl GenerationApi for HttpGenerationApi {
    async fn start_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationStarted, GenerationError> {
        let response = self
            .client
            .post::<GenerationStarted, _>("emails/generate", request)
            .await
            .map_err(|e| GenerationError::Transport { source: e })?;

        if response.success {
            response.data.ok_or_else(|| GenerationError::Transport {
                source: anyhow::anyhow!("submission acknowledged with an empty body"),
            })
        } else {
            Err(GenerationError::Rejected {
                message: response
                    .error_body
                    .unwrap_or_else(|| format!("HTTP {}", response.status)),
            })
        }
    }

    async fn fetch_generation(
        &self,
        generation_id: &str,
    ) -> Result<EmailGenerationStatus, GenerationError> {
        let path = format!("emails/generations/{}", generation_id);
        let response = self
            .client
            .get::<EmailGenerationStatus>(&path)
            .await
            .map_err(|e| GenerationError::Transport { source: e })?;

        match response.data {
            Some(status) if response.success => Ok(status),
            _ => Err(GenerationError::Transport {
                source: anyhow::anyhow!(
                    "poll returned HTTP {} without a job snapshot",
                    response.status
                ),
            }),
        }
    }

    async fn find_by_signal(&self, signal_id: &str) -> Result<SignalLookup, GenerationError> {
        let path = format!("emails/by-signal/{}", signal_id);
        let response = self
            .client
            .get::<Value>(&path)
            .await
            .map_err(|e| GenerationError::Transport { source: e })?;

        if response.status == 404 {
            return Ok(SignalLookup::NotFound);
        }
        if !response.success {
            return Err(GenerationError::Transport {
                source: anyhow::anyhow!("signal lookup returned HTTP {}", response.status),
            });
        }

        let body = response.data.unwrap_or(Value::Null);
        if body.get("status").and_then(Value::as_str) == Some("not_found") {
            return Ok(SignalLookup::NotFound);
        }
        serde_json::from_value(body)
            .map(SignalLookup::Found)
            .map_err(|e| GenerationError::Transport { source: e.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn email(contact_id: &str) -> GeneratedEmail {
        GeneratedEmail {
            contact_id: contact_id.to_string(),
            sequence_step: 1,
            block_id: "block-1".to_string(),
            block_name: "Opener".to_string(),
            subject: "Hello".to_string(),
            body: "Body".to_string(),
            status: EmailOutcome::Generated,
            subject_prompt: None,
            body_prompt: None,
            data_sources: None,
        }
    }

    fn in_progress(id: &str, processed: u32, total: u32) -> EmailGenerationStatus {
        EmailGenerationStatus {
            generation_id: id.to_string(),
            status: JobStatus::InProgress,
            total_emails: total,
            contacts_processed: processed,
            generated_emails: Vec::new(),
            error_message: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn completed(id: &str, total: u32) -> EmailGenerationStatus {
        EmailGenerationStatus {
            generation_id: id.to_string(),
            status: JobStatus::Completed,
            total_emails: total,
            contacts_processed: total,
            generated_emails: (0..total).map(|i| email(&format!("contact-{}", i))).collect(),
            error_message: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn request(contacts: usize) -> GenerationRequest {
        GenerationRequest {
            sequence_id: "seq-1".to_string(),
            signal_id: "sig-1".to_string(),
            contacts: (0..contacts)
                .map(|i| serde_json::json!({"contact_id": format!("contact-{}", i)}))
                .collect(),
            company_data: serde_json::json!({}),
            custom_data: serde_json::json!({}),
        }
    }

    /// Scripted API: `fetch_generation` walks the queue and repeats its last
    /// entry forever.
    struct FakeApi {
        start_result: Mutex<Option<Result<GenerationStarted, GenerationError>>>,
        lookup_result: Mutex<Option<SignalLookup>>,
        fetch_script: Mutex<VecDeque<EmailGenerationStatus>>,
        fetch_calls: AtomicUsize,
    }

    impl FakeApi {
        fn new(
            start_result: Option<Result<GenerationStarted, GenerationError>>,
            lookup_result: Option<SignalLookup>,
            fetch_script: Vec<EmailGenerationStatus>,
        ) -> Arc<Self> {
            Arc::new(Self {
                start_result: Mutex::new(start_result),
                lookup_result: Mutex::new(lookup_result),
                fetch_script: Mutex::new(fetch_script.into()),
                fetch_calls: AtomicUsize::new(0),
            })
        }

        fn started(id: &str, total: u32) -> GenerationStarted {
            GenerationStarted {
                generation_id: id.to_string(),
                status: JobStatus::Pending,
                total_emails: total,
            }
        }
    }

    impl GenerationApi for FakeApi {
        async fn start_generation(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationStarted, GenerationError> {
            self.start_result
                .lock()
                .unwrap()
                .take()
                .expect("unexpected start_generation call")
        }

        async fn fetch_generation(
            &self,
            _generation_id: &str,
        ) -> Result<EmailGenerationStatus, GenerationError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.fetch_script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.pop_front().expect("script not empty"))
            } else {
                Ok(script.front().expect("fetch script exhausted").clone())
            }
        }

        async fn find_by_signal(&self, _signal_id: &str) -> Result<SignalLookup, GenerationError> {
            Ok(self
                .lookup_result
                .lock()
                .unwrap()
                .clone()
                .expect("unexpected find_by_signal call"))
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<TrackerState>, mut predicate: F)
    where
        F: FnMut(&TrackerState) -> bool,
    {
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return;
                }
            }
            rx.changed().await.expect("tracker state sender dropped");
        }
    }

    #[test]
    fn cadence_is_fast_for_ten_polls_then_degrades() {
        let config = GenerationConfig::default();
        assert_eq!(poll_interval(&config, 1), Duration::from_secs(3));
        assert_eq!(poll_interval(&config, 10), Duration::from_secs(3));
        assert_eq!(poll_interval(&config, 11), Duration::from_secs(10));
        assert_eq!(poll_interval(&config, 100), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn job_polls_to_completion_with_confirmation_poll() {
        let api = FakeApi::new(
            Some(Ok(FakeApi::started("gen-1", 4))),
            None,
            vec![
                in_progress("gen-1", 1, 4),
                in_progress("gen-1", 2, 4),
                in_progress("gen-1", 3, 4),
                completed("gen-1", 4),
            ],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");
        let started_at = Instant::now();

        let id = tracker.start_generation(request(4)).await;
        assert_eq!(id.as_deref(), Some("gen-1"));

        let mut rx = tracker.subscribe();
        wait_for(&mut rx, |s| s.has_results()).await;
        // The next state notification is the confirmation poll landing.
        rx.changed().await.expect("confirmation poll notification");

        let state = tracker.state();
        assert!(state.has_results());
        assert!(!state.has_failed());
        assert!(!state.is_in_progress());
        let generation = state.generation.expect("generation snapshot present");
        assert_eq!(generation.generated_emails.len(), 4);
        assert_eq!(generation.contacts_processed, 4);

        // Four 3 s polls plus the 1 s confirmation poll.
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 5);
        assert_eq!(started_at.elapsed(), Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_exhaustion_synthesizes_a_timeout_failure() {
        let api = FakeApi::new(
            Some(Ok(FakeApi::started("gen-2", 4))),
            None,
            vec![in_progress("gen-2", 1, 4)],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");
        let started_at = Instant::now();

        tracker.start_generation(request(4)).await.expect("job id");
        let mut rx = tracker.subscribe();
        wait_for(&mut rx, |s| s.has_failed()).await;

        let state = tracker.state();
        assert!(state.has_failed());
        assert!(!state.has_results());
        let generation = state.generation.expect("generation snapshot present");
        assert_eq!(
            generation.error_message.as_deref(),
            Some("Timed out waiting for the generation to finish")
        );
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 60);
        // 10 polls at 3 s, then 50 at 10 s.
        assert_eq!(started_at.elapsed(), Duration::from_secs(530));
    }

    #[tokio::test(start_paused = true)]
    async fn server_reported_failure_is_terminal_with_its_message() {
        let mut failed = in_progress("gen-3", 2, 4);
        failed.status = JobStatus::Failed;
        failed.error_message = Some("model quota exhausted".to_string());

        let api = FakeApi::new(
            Some(Ok(FakeApi::started("gen-3", 4))),
            None,
            vec![in_progress("gen-3", 1, 4), failed],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");

        tracker.start_generation(request(4)).await.expect("job id");
        let mut rx = tracker.subscribe();
        wait_for(&mut rx, |s| s.has_failed()).await;

        let generation = tracker.state().generation.expect("snapshot present");
        assert_eq!(
            generation.error_message.as_deref(),
            Some("model quota exhausted")
        );

        // Polling stopped: no further fetches after the terminal response.
        let calls = api.fetch_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submission_surfaces_immediately_without_a_job() {
        let api = FakeApi::new(
            Some(Err(GenerationError::Rejected {
                message: "sequence not found".to_string(),
            })),
            None,
            vec![],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry.clone(), "sig-1");

        let id = tracker.start_generation(request(2)).await;
        assert!(id.is_none());

        let state = tracker.state();
        assert!(state.generation.is_none());
        assert!(state.error.as_deref().unwrap_or("").contains("rejected"));
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.resource_counts().operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_contact_list_never_reaches_the_server() {
        let api = FakeApi::new(None, None, vec![]);
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");

        assert!(tracker.start_generation(request(0)).await.is_none());
        assert!(tracker.state().generation.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_adopts_an_existing_active_job() {
        let api = FakeApi::new(
            None,
            Some(SignalLookup::Found(in_progress("gen-4", 2, 4))),
            vec![completed("gen-4", 4)],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");

        tracker.refresh_status().await;
        assert!(tracker.state().is_in_progress());

        let mut rx = tracker.subscribe();
        wait_for(&mut rx, |s| s.has_results()).await;
        assert_eq!(
            tracker.state().generation.expect("snapshot").generated_emails.len(),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_clears_state_on_not_found() {
        let api = FakeApi::new(None, Some(SignalLookup::NotFound), vec![]);
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry, "sig-1");

        tracker.refresh_status().await;
        let state = tracker.state();
        assert!(state.generation.is_none());
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_cleanup_halts_an_abandoned_poll_loop() {
        let api = FakeApi::new(
            Some(Ok(FakeApi::started("gen-5", 4))),
            None,
            vec![in_progress("gen-5", 1, 4)],
        );
        let registry = CleanupRegistry::new();
        let tracker = GenerationTracker::new(Arc::clone(&api), registry.clone(), "sig-1");

        tracker.start_generation(request(4)).await.expect("job id");
        while api.fetch_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        registry.cleanup();
        let calls = api.fetch_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), calls);
        assert_eq!(registry.resource_counts().timers, 0);
    }
}
