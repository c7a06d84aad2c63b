//! Job monitor: submission with bounded retry, then one realtime
//! subscription per job until it reaches a terminal status.
//!
//! ## Per-job lifecycle
//!
//! ```text
//! submit ──► create (retry/backoff) ──► open ──► Connecting
//!                                        │
//!        ┌───────────── update ──────────┤
//!        ▼                               │ error / timeout / complete
//!   Connected ── terminal ──► grace ──► teardown (Disconnected)
//!                                        ▼
//!                                  Error ── backoff ──► open (attempt n)
//!                                        │
//!                                        └─ n > max_retries ──► SUBSCRIPTION_FAILED
//! ```
//!
//! Every job has a [`Tracker`] behind one mutex. Each subscription it opens
//! gets a fresh generation; events, timers and timeouts carry the generation
//! they were started under and are dropped once it is stale. Cleanup always
//! precedes a new subscription, so a job never has two live subscriptions or
//! two reconnect timers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use proplens_core::errors::codes;
use proplens_core::{JobError, JobInput, JobRecord};
use proplens_realtime::{
    Credential, Selector, SubscriptionEvent, SubscriptionEvents, SubscriptionRequest,
    SubscriptionTransport, TransportError,
};
use proplens_settings::MonitorSettings;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::JobApi;
use crate::store::{ConnectionState, JobSnapshot, JobState, JobStatePatch, JobStore};

/// Default job-update subscription.
pub const JOB_UPDATED_SUBSCRIPTION: &str = "subscription OnJobUpdated($id: ID!) { \
     onJobUpdated(id: $id) { id status result createdAt updatedAt } }";

/// Where the job sits inside each `data` payload.
pub const JOB_UPDATED_PATH: &str = "data.onJobUpdated";

type Outcome = Result<JobRecord, JobError>;

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Monitor configuration.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Retry, backoff and timeout tuning.
    pub settings: MonitorSettings,
    /// Subscription document; takes the job id as `$id`.
    pub subscription_document: String,
    /// Selector path for the job inside `data` payloads.
    pub selector_path: String,
}

impl From<MonitorSettings> for MonitorConfig {
    fn from(settings: MonitorSettings) -> Self {
        Self {
            settings,
            subscription_document: JOB_UPDATED_SUBSCRIPTION.to_string(),
            selector_path: JOB_UPDATED_PATH.to_string(),
        }
    }
}

/// Why a submission failed.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Blank request. No network call was made.
    #[error("job request must not be empty")]
    InvalidInput,

    /// No credential. No network call was made.
    #[error("a credential is required to submit jobs")]
    AuthRequired,

    /// The API call failed. The placeholder entry keeps the error.
    #[error("{error}")]
    Failed {
        /// Finalized error.
        error: JobError,
        /// Store key of the retained placeholder.
        placeholder: String,
    },
}

impl SubmitError {
    /// Error code.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidInput => codes::INVALID_INPUT,
            Self::AuthRequired => codes::AUTH_REQUIRED,
            Self::Failed { error, .. } => &error.code,
        }
    }

    /// As a finalized [`JobError`].
    pub fn to_job_error(&self) -> JobError {
        match self {
            Self::Failed { error, .. } => error.clone(),
            other => JobError::new(other.code(), other.to_string()),
        }
    }
}

/// Resolves once with the job's terminal outcome.
#[derive(Debug)]
pub struct JobCompletion {
    rx: oneshot::Receiver<Outcome>,
}

impl JobCompletion {
    /// `Ok` for `COMPLETED`/`COMPLETE`, `Err` for a failed job or when
    /// monitoring gave up or was stopped.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(JobError::new(
                codes::UNKNOWN_ERROR,
                "monitoring stopped before the job finished",
            ))
        })
    }

    /// Outcome if already resolved.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        self.rx.try_recv().ok()
    }
}

/// A submitted job.
#[derive(Debug)]
pub struct JobTicket {
    /// Record returned by the API.
    pub record: JobRecord,
    /// Terminal outcome.
    pub completion: JobCompletion,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tracker {
    generation: u64,
    attempts: u32,
    terminal: bool,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
    completion: Option<oneshot::Sender<Outcome>>,
}

impl Tracker {
    fn resolve(&mut self, outcome: Outcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    fn cancel_tasks(&mut self) {
        for handle in [self.pump.take(), self.reconnect.take(), self.teardown.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn current<'a>(
    jobs: &'a mut HashMap<String, Tracker>,
    job_id: &str,
    generation: u64,
) -> Option<&'a mut Tracker> {
    jobs.get_mut(job_id)
        .filter(|tracker| tracker.generation == generation)
}

/// What the pump does after an event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// Keep reading; restart the silence timer.
    Continue,
    /// Keep reading trailing frames; no silence timer.
    Quiet,
    /// Exit.
    Stop,
}

enum Failure {
    Transport(TransportError),
    Timeout(Duration),
    Completed,
    Ended,
}

impl Failure {
    fn to_job_error(&self) -> JobError {
        match self {
            Self::Timeout(_) => JobError::new(codes::SUBSCRIPTION_TIMEOUT, self.to_string()),
            _ => JobError::new(codes::SUBSCRIPTION_ERROR, self.to_string()),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Timeout(silence) => write!(f, "no update within {}ms", silence.as_millis()),
            Self::Completed => f.write_str("subscription completed before a terminal status"),
            Self::Ended => f.write_str("subscription ended"),
        }
    }
}

fn terminal_error(job_id: &str, record: &JobRecord) -> Option<JobError> {
    record.status.is_failure().then(|| {
        JobError::new(
            codes::JOB_FAILED,
            format!("job {job_id} finished with status {}", record.status),
        )
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    config: MonitorConfig,
    api: Arc<dyn JobApi>,
    transport: Arc<dyn SubscriptionTransport>,
    store: Arc<JobStore>,
    jobs: Mutex<HashMap<String, Tracker>>,
    /// Generations are never reused, even across trackers for the same job.
    generations: AtomicU64,
}

/// Submits jobs and follows them over the realtime transport.
#[derive(Clone)]
pub struct JobMonitor {
    inner: Arc<Inner>,
}

impl JobMonitor {
    /// Create a monitor publishing into `store`.
    pub fn new(
        config: impl Into<MonitorConfig>,
        api: Arc<dyn JobApi>,
        transport: Arc<dyn SubscriptionTransport>,
        store: Arc<JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.into(),
                api,
                transport,
                store,
                jobs: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// The store this monitor publishes into.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Current state and history of a job.
    pub fn job_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.store.get(job_id)
    }

    /// Jobs still being followed, sorted. A job leaves this list once its
    /// post-terminal grace period ends or its reconnect attempts run out.
    pub fn monitored_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a job and start following it.
    ///
    /// Blank requests and missing credentials are rejected before any
    /// network call. The API call is retried on retryable failures up to
    /// `max_retries` times.
    pub async fn submit_job(
        &self,
        input: JobInput,
        credential: Option<Credential>,
    ) -> Result<JobTicket, SubmitError> {
        if input.is_blank() {
            warn!("rejecting job with empty request");
            return Err(SubmitError::InvalidInput);
        }
        let Some(credential) = credential else {
            warn!("rejecting job submission without credential");
            return Err(SubmitError::AuthRequired);
        };

        let placeholder = format!("pending-{}", Uuid::new_v4());
        self.inner.store.replace(
            &placeholder,
            JobState {
                loading: true,
                ..JobState::default()
            },
        );

        let record = match self.inner.create_with_retry(&input, &credential).await {
            Ok(record) => record,
            Err(error) => {
                self.inner.store.patch(
                    &placeholder,
                    JobStatePatch {
                        error: Some(Some(error.clone())),
                        loading: Some(false),
                        ..JobStatePatch::default()
                    },
                );
                return Err(SubmitError::Failed { error, placeholder });
            }
        };

        let job_id = record.id.clone();
        let _ = self.inner.store.rekey(&placeholder, &job_id);
        self.inner.store.patch(
            &job_id,
            JobStatePatch {
                result: Some(record.clone()),
                ..JobStatePatch::default()
            },
        );
        self.inner.transport.set_credential(credential);
        info!(%job_id, status = %record.status, priority = ?input.priority, "job submitted");

        let completion = self.inner.track(&job_id, Some(&record));
        Ok(JobTicket { record, completion })
    }

    /// Follow an already-submitted job. Replaces any existing monitoring of
    /// the same id.
    pub fn watch_job(&self, job_id: &str, credential: Option<Credential>) -> JobCompletion {
        if let Some(credential) = credential {
            self.inner.transport.set_credential(credential);
        }
        self.inner.track(job_id, None)
    }

    /// Stop following a job. State and history stay in the store. A pending
    /// completion resolves with an error.
    pub fn stop_monitoring(&self, job_id: &str) -> bool {
        let mut jobs = self.inner.jobs.lock();
        let Some(mut tracker) = jobs.remove(job_id) else {
            return false;
        };
        tracker.cancel_tasks();
        let _ = self.inner.transport.remove_subscription(job_id);
        self.inner.transition(
            job_id,
            ConnectionState::Disconnected,
            JobStatePatch {
                loading: Some(false),
                ..JobStatePatch::default()
            },
        );
        info!(job_id, "stopped monitoring job");
        true
    }

    /// Stop following a job and delete its store entry.
    pub fn forget(&self, job_id: &str) -> bool {
        let stopped = self.stop_monitoring(job_id);
        self.inner.store.delete(job_id) || stopped
    }

    /// Stop following every job.
    pub fn shutdown(&self) {
        for job_id in self.monitored_jobs() {
            let _ = self.stop_monitoring(&job_id);
        }
    }
}

impl Inner {
    fn settings(&self) -> &MonitorSettings {
        &self.config.settings
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn request(&self, job_id: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(self.config.subscription_document.clone())
            .variable("id", job_id)
            .select(Selector::path(&self.config.selector_path))
    }

    /// Patch `job_id`, moving to `next` only if that transition is legal.
    fn transition(&self, job_id: &str, next: ConnectionState, mut patch: JobStatePatch) {
        let from = self
            .store
            .state(job_id)
            .map(|state| state.connection_state)
            .unwrap_or_default();
        if from.can_transition_to(next) {
            patch.connection_state = Some(next);
        } else {
            warn!(job_id, ?from, to = ?next, "skipping illegal connection state transition");
        }
        self.store.patch(job_id, patch);
    }

    async fn create_with_retry(
        &self,
        input: &JobInput,
        credential: &Credential,
    ) -> Result<JobRecord, JobError> {
        let max_retries = self.settings().max_retries;
        let backoff = self.settings().backoff();
        let mut retries = 0u32;
        loop {
            match self.api.create_job(input, credential).await {
                Ok(record) => return Ok(record),
                Err(err) if !err.is_retryable() => {
                    warn!(error = %err, code = err.code(), "job submission rejected");
                    return Err(JobError::new(err.code(), err.to_string()).with_attempts(retries));
                }
                Err(err) if retries >= max_retries => {
                    warn!(retries, error = %err, "job submission retries exhausted");
                    return Err(JobError::new(
                        codes::SUBMISSION_FAILED,
                        format!("submission failed after {retries} retries: {err}"),
                    )
                    .with_attempts(retries));
                }
                Err(err) => {
                    retries += 1;
                    let delay_ms = backoff.delay_ms(retries);
                    warn!(retries, max_retries, delay_ms, error = %err, "job submission failed, retrying");
                    time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Start (or restart) tracking. `initial` short-circuits jobs that were
    /// already terminal when created.
    fn track(self: &Arc<Self>, job_id: &str, initial: Option<&JobRecord>) -> JobCompletion {
        let (tx, rx) = oneshot::channel();
        let mut jobs = self.jobs.lock();

        match initial.filter(|record| record.status.is_terminal()) {
            Some(record) => {
                if let Some(mut previous) = jobs.remove(job_id) {
                    previous.cancel_tasks();
                    let _ = self.transport.remove_subscription(job_id);
                }
                let error = terminal_error(job_id, record);
                self.store.patch(
                    job_id,
                    JobStatePatch {
                        error: Some(error.clone()),
                        loading: Some(false),
                        ..JobStatePatch::default()
                    },
                );
                let _ = tx.send(error.map_or_else(|| Ok(record.clone()), Err));
                info!(job_id, status = %record.status, "job already terminal at submission");
            }
            None => {
                let tracker = jobs.entry(job_id.to_string()).or_default();
                tracker.attempts = 0;
                tracker.terminal = false;
                tracker.completion = Some(tx);
                self.open(job_id, tracker);
            }
        }
        JobCompletion { rx }
    }

    /// Release whatever the job had and subscribe afresh.
    fn open(self: &Arc<Self>, job_id: &str, tracker: &mut Tracker) {
        tracker.cancel_tasks();
        let _ = self.transport.remove_subscription(job_id);
        tracker.generation = self.next_generation();
        let generation = tracker.generation;

        let from = self
            .store
            .state(job_id)
            .map(|state| state.connection_state)
            .unwrap_or_default();
        if !from.can_transition_to(ConnectionState::Connecting) {
            self.transition(job_id, ConnectionState::Disconnected, JobStatePatch::default());
        }
        self.transition(
            job_id,
            ConnectionState::Connecting,
            JobStatePatch {
                loading: Some(true),
                ..JobStatePatch::default()
            },
        );

        let events = self.transport.add_subscription(job_id, self.request(job_id));
        tracker.pump = Some(tokio::spawn(pump(
            Arc::downgrade(self),
            job_id.to_string(),
            generation,
            events,
            self.settings().subscription_timeout(),
        )));
        debug!(job_id, generation, attempt = tracker.attempts, "job subscription opened");
    }

    fn on_started(&self, job_id: &str, generation: u64) -> Flow {
        let mut jobs = self.jobs.lock();
        let Some(tracker) = current(&mut jobs, job_id, generation) else {
            return Flow::Stop;
        };
        if tracker.terminal {
            return Flow::Quiet;
        }
        tracker.attempts = 0;
        self.transition(
            job_id,
            ConnectionState::Connected,
            JobStatePatch {
                error: Some(None),
                reconnect_attempts: Some(0),
                ..JobStatePatch::default()
            },
        );
        debug!(job_id, "job subscription started");
        Flow::Continue
    }

    fn on_data(self: &Arc<Self>, job_id: &str, generation: u64, value: Value) -> Flow {
        let record = match JobRecord::from_value(value) {
            Ok(record) => record,
            Err(err) => {
                warn!(job_id, error = %err, "ignoring malformed job update");
                return Flow::Continue;
            }
        };
        if record.id != job_id {
            warn!(job_id, update_id = %record.id, "ignoring update for another job");
            return Flow::Continue;
        }

        let mut jobs = self.jobs.lock();
        let Some(tracker) = current(&mut jobs, job_id, generation) else {
            return Flow::Stop;
        };
        let _ = self.store.append_history(job_id, record.clone());
        let status = record.status;
        if tracker.terminal {
            debug!(job_id, %status, "trailing update after terminal status");
            return Flow::Quiet;
        }
        tracker.attempts = 0;

        if !status.is_terminal() {
            self.transition(
                job_id,
                ConnectionState::Connected,
                JobStatePatch {
                    result: Some(record),
                    error: Some(None),
                    reconnect_attempts: Some(0),
                    ..JobStatePatch::default()
                },
            );
            debug!(job_id, %status, "job update");
            return Flow::Continue;
        }

        tracker.terminal = true;
        let error = terminal_error(job_id, &record);
        self.transition(
            job_id,
            ConnectionState::Connected,
            JobStatePatch {
                result: Some(record.clone()),
                error: Some(error.clone()),
                loading: Some(false),
                reconnect_attempts: Some(0),
                ..JobStatePatch::default()
            },
        );
        tracker.resolve(error.map_or(Ok(record), Err));
        tracker.teardown = Some(self.schedule_teardown(job_id, generation));
        info!(job_id, %status, "job reached terminal status");
        Flow::Quiet
    }

    fn on_failure(self: &Arc<Self>, job_id: &str, generation: u64, failure: &Failure) -> Flow {
        let mut jobs = self.jobs.lock();
        let Some(tracker) = current(&mut jobs, job_id, generation) else {
            return Flow::Stop;
        };
        if tracker.terminal {
            debug!(job_id, %failure, "ignoring failure after terminal status");
            return Flow::Stop;
        }

        // The calling pump exits on its own.
        tracker.pump = None;
        let _ = self.transport.remove_subscription(job_id);
        tracker.generation = self.next_generation();
        let error = failure.to_job_error();

        if tracker.attempts >= self.settings().max_retries {
            let attempts = tracker.attempts;
            let error = JobError::new(
                codes::SUBSCRIPTION_FAILED,
                format!("gave up after {attempts} reconnect attempts: {}", error.message),
            )
            .with_attempts(attempts);
            warn!(job_id, attempts, error = %error, "job monitoring failed");
            self.transition(
                job_id,
                ConnectionState::Error,
                JobStatePatch {
                    error: Some(Some(error.clone())),
                    loading: Some(false),
                    reconnect_attempts: Some(attempts),
                    ..JobStatePatch::default()
                },
            );
            tracker.resolve(Err(error));
            if let Some(mut finished) = jobs.remove(job_id) {
                finished.cancel_tasks();
            }
            return Flow::Stop;
        }

        tracker.attempts += 1;
        let attempts = tracker.attempts;
        let delay_ms = self.settings().backoff().delay_ms(attempts);
        warn!(job_id, attempts, delay_ms, code = %error.code, error = %error.message, "job subscription failed, reconnecting");
        self.transition(
            job_id,
            ConnectionState::Error,
            JobStatePatch {
                error: Some(Some(error.with_attempts(attempts))),
                reconnect_attempts: Some(attempts),
                ..JobStatePatch::default()
            },
        );
        if let Some(previous) = tracker.reconnect.take() {
            previous.abort();
        }
        tracker.reconnect = Some(self.schedule_reconnect(
            job_id,
            tracker.generation,
            Duration::from_millis(delay_ms),
        ));
        Flow::Stop
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        job_id: &str,
        generation: u64,
        delay: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = monitor.upgrade() {
                inner.reconnect(&job_id, generation);
            }
        })
    }

    fn reconnect(self: &Arc<Self>, job_id: &str, generation: u64) {
        let mut jobs = self.jobs.lock();
        let Some(tracker) = current(&mut jobs, job_id, generation) else {
            return;
        };
        if tracker.terminal {
            return;
        }
        // Detach our own handle so `open` does not abort it.
        tracker.reconnect = None;
        info!(job_id, attempt = tracker.attempts, "resubscribing to job");
        self.open(job_id, tracker);
    }

    fn schedule_teardown(self: &Arc<Self>, job_id: &str, generation: u64) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        let job_id = job_id.to_string();
        let grace = self.settings().teardown_grace();
        tokio::spawn(async move {
            time::sleep(grace).await;
            if let Some(inner) = monitor.upgrade() {
                inner.teardown(&job_id, generation);
            }
        })
    }

    fn teardown(&self, job_id: &str, generation: u64) {
        let mut jobs = self.jobs.lock();
        if current(&mut jobs, job_id, generation).is_none() {
            return;
        }
        let Some(mut tracker) = jobs.remove(job_id) else {
            return;
        };
        // This runs as the teardown task.
        tracker.teardown = None;
        tracker.cancel_tasks();
        let _ = self.transport.remove_subscription(job_id);
        self.transition(job_id, ConnectionState::Disconnected, JobStatePatch::default());
        debug!(job_id, "job subscription torn down");
    }
}

enum Step {
    Event(Option<SubscriptionEvent>),
    Silence,
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Read one subscription's events until it ends or goes stale.
async fn pump(
    monitor: Weak<Inner>,
    job_id: String,
    generation: u64,
    mut events: SubscriptionEvents,
    silence: Duration,
) {
    let mut deadline = Some(Instant::now() + silence);
    loop {
        let step = tokio::select! {
            event = events.recv() => Step::Event(event),
            () = expire(deadline) => Step::Silence,
        };
        let Some(inner) = monitor.upgrade() else {
            return;
        };
        let flow = match step {
            Step::Silence => inner.on_failure(&job_id, generation, &Failure::Timeout(silence)),
            Step::Event(None) => inner.on_failure(&job_id, generation, &Failure::Ended),
            Step::Event(Some(SubscriptionEvent::Started)) => inner.on_started(&job_id, generation),
            Step::Event(Some(SubscriptionEvent::Data(value))) => {
                inner.on_data(&job_id, generation, value)
            }
            Step::Event(Some(SubscriptionEvent::Error(TransportError::Selector { reason }))) => {
                warn!(%job_id, %reason, "job update did not match selector");
                Flow::Continue
            }
            Step::Event(Some(SubscriptionEvent::Error(err))) => {
                inner.on_failure(&job_id, generation, &Failure::Transport(err))
            }
            Step::Event(Some(SubscriptionEvent::Complete)) => {
                inner.on_failure(&job_id, generation, &Failure::Completed)
            }
        };
        match flow {
            Flow::Continue => deadline = Some(Instant::now() + silence),
            Flow::Quiet => deadline = None,
            Flow::Stop => return,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ApiError;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use proplens_core::{JobStatus, Priority};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    // ── fakes ───────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeTransport {
        live: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionEvent>>>,
        added: Mutex<Vec<(String, Value)>>,
        removed: Mutex<Vec<String>>,
        credential: Mutex<Option<Credential>>,
    }

    impl FakeTransport {
        fn emit(&self, key: &str, event: SubscriptionEvent) {
            let live = self.live.lock();
            let sink = live.get(key).expect("no live subscription");
            let _ = sink.send(event);
        }

        fn data(&self, key: &str, value: Value) {
            self.emit(key, SubscriptionEvent::Data(value));
        }

        fn fail(&self, key: &str) {
            self.emit(
                key,
                SubscriptionEvent::Error(TransportError::Closed {
                    reason: "network lost".into(),
                }),
            );
        }

        fn adds(&self) -> usize {
            self.added.lock().len()
        }

        fn removes(&self) -> usize {
            self.removed.lock().len()
        }

        fn is_live(&self, key: &str) -> bool {
            self.live.lock().contains_key(key)
        }
    }

    impl SubscriptionTransport for FakeTransport {
        fn add_subscription(&self, key: &str, request: SubscriptionRequest) -> SubscriptionEvents {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.live.lock().insert(key.to_string(), tx);
            self.added
                .lock()
                .push((key.to_string(), Value::Object(request.variables)));
            rx
        }

        fn remove_subscription(&self, key: &str) -> bool {
            let removed = self.live.lock().remove(key).is_some();
            if removed {
                self.removed.lock().push(key.to_string());
            }
            removed
        }

        fn set_credential(&self, credential: Credential) {
            *self.credential.lock() = Some(credential);
        }
    }

    struct ScriptedApi {
        script: Mutex<VecDeque<Result<JobRecord, ApiError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<JobRecord, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobApi for ScriptedApi {
        async fn create_job(
            &self,
            _input: &JobInput,
            _credential: &Credential,
        ) -> Result<JobRecord, ApiError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or_else(|| {
                Err(ApiError::Status {
                    status: 500,
                    message: "script exhausted".into(),
                })
            })
        }
    }

    // ── fixtures ────────────────────────────────────────────────────────────

    fn settings() -> MonitorSettings {
        MonitorSettings {
            subscription_timeout_ms: 60_000,
            ..MonitorSettings::default()
        }
    }

    fn setup_with(
        settings: MonitorSettings,
        script: Vec<Result<JobRecord, ApiError>>,
    ) -> (JobMonitor, Arc<FakeTransport>, Arc<ScriptedApi>) {
        let api = ScriptedApi::new(script);
        let transport = Arc::new(FakeTransport::default());
        let monitor = JobMonitor::new(
            settings,
            api.clone(),
            transport.clone(),
            Arc::new(JobStore::new()),
        );
        (monitor, transport, api)
    }

    fn setup(script: Vec<Result<JobRecord, ApiError>>) -> (JobMonitor, Arc<FakeTransport>, Arc<ScriptedApi>) {
        setup_with(settings(), script)
    }

    fn created(id: &str) -> Result<JobRecord, ApiError> {
        Ok(JobRecord::new(id, JobStatus::Pending))
    }

    fn server_error() -> Result<JobRecord, ApiError> {
        Err(ApiError::Status {
            status: 500,
            message: "boom".into(),
        })
    }

    fn token() -> Option<Credential> {
        Some(Credential::Token("tok".into()))
    }

    fn update(status: &str) -> Value {
        json!({"id": "job-1", "status": status})
    }

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    async fn submit(monitor: &JobMonitor) -> JobTicket {
        monitor
            .submit_job(JobInput::new("Summarize X"), token())
            .await
            .unwrap()
    }

    fn state(monitor: &JobMonitor) -> JobState {
        monitor.store().state("job-1").unwrap()
    }

    fn statuses(monitor: &JobMonitor) -> Vec<JobStatus> {
        monitor
            .store()
            .history("job-1")
            .iter()
            .map(|record| record.status)
            .collect()
    }

    // ── submission ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn submit_then_follow_to_completion() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);

        let ticket = monitor
            .submit_job(
                JobInput::new("Summarize X").with_priority(Priority::High),
                token(),
            )
            .await
            .unwrap();
        assert_eq!(ticket.record.id, "job-1");
        assert_eq!(transport.adds(), 1);
        assert_eq!(transport.added.lock()[0].1, json!({"id": "job-1"}));
        assert!(transport.credential.lock().is_some());
        assert_eq!(monitor.store().job_ids(), vec!["job-1"]);
        assert!(state(&monitor).loading);
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connecting);

        transport.data("job-1", update("PROCESSING"));
        settle().await;
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connected);
        assert_eq!(statuses(&monitor), vec![JobStatus::Processing]);

        transport.data(
            "job-1",
            json!({"id": "job-1", "status": "COMPLETED", "result": "{\"score\":7}"}),
        );
        settle().await;
        assert_eq!(
            statuses(&monitor),
            vec![JobStatus::Completed, JobStatus::Processing]
        );
        let done = state(&monitor);
        assert!(!done.loading);
        assert!(done.error.is_none());

        let record = ticket.completion.wait().await.unwrap();
        assert_eq!(record.result.as_deref(), Some("{\"score\":7}"));

        // Torn down only after the grace delay.
        assert!(transport.is_live("job-1"));
        assert_eq!(monitor.monitored_jobs(), vec!["job-1"]);
        time::sleep(Duration::from_millis(1100)).await;
        assert!(!transport.is_live("job-1"));
        assert_eq!(transport.removes(), 1);
        assert_eq!(state(&monitor).connection_state, ConnectionState::Disconnected);
        assert!(monitor.monitored_jobs().is_empty());
        assert!(!monitor.stop_monitoring("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_request_makes_no_call() {
        let (monitor, transport, api) = setup(vec![created("job-1")]);

        for request in ["", "   ", "\n\t"] {
            let err = monitor
                .submit_job(JobInput::new(request), token())
                .await
                .unwrap_err();
            assert_matches!(err, SubmitError::InvalidInput);
            assert_eq!(err.code(), codes::INVALID_INPUT);
        }
        assert_eq!(api.calls(), 0);
        assert_eq!(transport.adds(), 0);
        assert!(monitor.store().job_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_makes_no_call() {
        let (monitor, _, api) = setup(vec![created("job-1")]);

        let err = monitor
            .submit_job(JobInput::new("Summarize X"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::AUTH_REQUIRED);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_exhaust_then_submission_failed() {
        let (monitor, transport, api) = setup(vec![
            server_error(),
            server_error(),
            server_error(),
            server_error(),
        ]);

        let err = monitor
            .submit_job(JobInput::new("Summarize X"), token())
            .await
            .unwrap_err();
        assert_eq!(api.calls(), 4);
        assert_matches!(&err, SubmitError::Failed { error, .. } if error.attempts == 3);
        assert_eq!(err.code(), codes::SUBMISSION_FAILED);
        assert_eq!(transport.adds(), 0);

        // The placeholder keeps the error for the caller.
        let SubmitError::Failed { placeholder, .. } = err else {
            unreachable!()
        };
        let kept = monitor.store().state(&placeholder).unwrap();
        assert!(!kept.loading);
        assert_eq!(kept.error.unwrap().code, codes::SUBMISSION_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let (monitor, transport, api) =
            setup(vec![server_error(), server_error(), created("job-1")]);

        let ticket = submit(&monitor).await;
        assert_eq!(ticket.record.id, "job-1");
        assert_eq!(api.calls(), 3);
        assert_eq!(transport.adds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_follow_backoff() {
        let (monitor, _, api) = setup(vec![server_error(), server_error(), created("job-1")]);

        let started = Instant::now();
        let _ = submit(&monitor).await;
        assert_eq!(api.calls(), 3);
        // 1000ms + 2000ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_response_is_never_retried() {
        let (monitor, _, api) = setup(vec![Err(ApiError::InvalidResponse {
            reason: "missing data.createJob".into(),
        })]);

        let err = monitor
            .submit_job(JobInput::new("Summarize X"), token())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_RESPONSE);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_never_retried() {
        let (monitor, _, api) = setup(vec![Err(ApiError::Status {
            status: 401,
            message: "Unauthorized".into(),
        })]);

        let err = monitor
            .submit_job(JobInput::new("Summarize X"), token())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::AUTH_REQUIRED);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_at_submission_skips_subscription() {
        let (monitor, transport, _) = setup(vec![Ok(JobRecord::new("job-1", JobStatus::Completed))]);

        let ticket = submit(&monitor).await;
        assert_eq!(ticket.completion.wait().await.unwrap().id, "job-1");
        assert_eq!(transport.adds(), 0);
        assert!(!state(&monitor).loading);
        assert!(monitor.monitored_jobs().is_empty());
    }

    // ── monitoring ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn failed_status_resolves_with_job_failed() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let ticket = submit(&monitor).await;

        transport.data("job-1", update("FAILED"));
        let err = ticket.completion.wait().await.unwrap_err();
        assert_eq!(err.code, codes::JOB_FAILED);
        assert_eq!(state(&monitor).error.unwrap().code, codes::JOB_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reconnect_after_terminal_status() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let mut ticket = submit(&monitor).await;

        transport.data("job-1", update("COMPLETED"));
        settle().await;
        transport.fail("job-1");
        settle().await;
        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.adds(), 1);
        assert_matches!(ticket.completion.try_outcome(), Some(Ok(_)));
        let done = state(&monitor);
        assert_eq!(done.reconnect_attempts, 0);
        assert!(done.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_update_is_recorded_without_second_completion() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let ticket = submit(&monitor).await;

        transport.data("job-1", json!({"id": "job-1", "status": "COMPLETED", "updatedAt": "t1"}));
        transport.data("job-1", json!({"id": "job-1", "status": "COMPLETE", "updatedAt": "t2"}));
        settle().await;

        assert_eq!(ticket.completion.wait().await.unwrap().status, JobStatus::Completed);
        assert_eq!(
            statuses(&monitor),
            vec![JobStatus::Complete, JobStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_updates_are_not_recorded_twice() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        let processing = json!({"id": "job-1", "status": "PROCESSING", "updatedAt": "t1"});
        transport.data("job-1", processing.clone());
        transport.data("job-1", processing);
        settle().await;
        assert_eq!(statuses(&monitor), vec![JobStatus::Processing]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_reconnects_with_backoff() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        transport.fail("job-1");
        settle().await;
        let failing = state(&monitor);
        assert_eq!(failing.connection_state, ConnectionState::Error);
        assert_eq!(failing.reconnect_attempts, 1);
        let error = failing.error.unwrap();
        assert_eq!(error.code, codes::SUBSCRIPTION_ERROR);
        assert_eq!(error.attempts, 1);
        assert!(failing.loading);

        time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.adds(), 1);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.adds(), 2);
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connecting);

        // Second failure waits twice as long.
        transport.fail("job-1");
        settle().await;
        time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(transport.adds(), 2);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.adds(), 3);
        assert_eq!(state(&monitor).reconnect_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_resubscription_resets_attempts() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        transport.fail("job-1");
        settle().await;
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.adds(), 2);

        transport.emit("job-1", SubscriptionEvent::Started);
        settle().await;
        let healthy = state(&monitor);
        assert_eq!(healthy.connection_state, ConnectionState::Connected);
        assert_eq!(healthy.reconnect_attempts, 0);
        assert!(healthy.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_exhaust() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let ticket = submit(&monitor).await;

        for attempt in 1..=3u32 {
            transport.fail("job-1");
            settle().await;
            let wait = MonitorSettings::default().backoff().delay_ms(attempt) + 10;
            time::sleep(Duration::from_millis(wait)).await;
        }
        assert_eq!(transport.adds(), 4);

        transport.fail("job-1");
        let err = ticket.completion.wait().await.unwrap_err();
        assert_eq!(err.code, codes::SUBSCRIPTION_FAILED);
        assert_eq!(err.attempts, 3);

        let failed = state(&monitor);
        assert!(!failed.loading);
        assert_eq!(failed.connection_state, ConnectionState::Error);
        assert_eq!(failed.reconnect_attempts, 3);
        assert!(monitor.monitored_jobs().is_empty());

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.adds(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_before_handshake_reconnects() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        // The transport reports a refused socket while the start is queued.
        transport.emit(
            "job-1",
            SubscriptionEvent::Error(TransportError::Connect {
                url: "ws://127.0.0.1:9/graphql".into(),
                reason: "connection refused".into(),
            }),
        );
        settle().await;
        let failing = state(&monitor);
        assert_eq!(failing.connection_state, ConnectionState::Error);
        assert_eq!(failing.reconnect_attempts, 1);
        assert_eq!(failing.error.unwrap().code, codes::SUBSCRIPTION_ERROR);
        assert!(!transport.is_live("job-1"));

        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.adds(), 2);
        assert!(transport.is_live("job-1"));
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn server_complete_before_terminal_reconnects() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        transport.emit("job-1", SubscriptionEvent::Complete);
        settle().await;
        assert_eq!(state(&monitor).reconnect_attempts, 1);
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.adds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_reconnects() {
        let (monitor, transport, _) = setup_with(
            MonitorSettings {
                subscription_timeout_ms: 5000,
                ..MonitorSettings::default()
            },
            vec![created("job-1")],
        );
        let _ticket = submit(&monitor).await;

        // An update restarts the silence timer.
        time::sleep(Duration::from_millis(4000)).await;
        transport.data("job-1", update("PROCESSING"));
        time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connected);

        time::sleep(Duration::from_millis(600)).await;
        let timed_out = state(&monitor);
        assert_eq!(timed_out.connection_state, ConnectionState::Error);
        assert_eq!(timed_out.error.unwrap().code, codes::SUBSCRIPTION_TIMEOUT);
        assert_eq!(timed_out.reconnect_attempts, 1);
        assert!(!transport.is_live("job-1"));

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.adds(), 2);
        assert!(transport.is_live("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn updates_for_other_jobs_and_selector_misses_are_ignored() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        transport.data("job-1", json!({"id": "job-2", "status": "COMPLETED"}));
        transport.data("job-1", json!({"unexpected": true}));
        transport.emit(
            "job-1",
            SubscriptionEvent::Error(TransportError::Selector {
                reason: "missing onJobUpdated".into(),
            }),
        );
        settle().await;

        assert!(statuses(&monitor).is_empty());
        assert_eq!(state(&monitor).reconnect_attempts, 0);
        assert_eq!(transport.adds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_is_idempotent() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let ticket = submit(&monitor).await;

        assert!(monitor.stop_monitoring("job-1"));
        assert!(!monitor.stop_monitoring("job-1"));
        assert!(!transport.is_live("job-1"));
        assert_eq!(state(&monitor).connection_state, ConnectionState::Disconnected);
        assert!(!state(&monitor).loading);

        let err = ticket.completion.wait().await.unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_ERROR);
        assert!(monitor.monitored_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let (monitor, transport, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        transport.fail("job-1");
        settle().await;
        assert!(monitor.stop_monitoring("job-1"));
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.adds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_deletes_state() {
        let (monitor, _, _) = setup(vec![created("job-1")]);
        let _ticket = submit(&monitor).await;

        assert!(monitor.forget("job-1"));
        assert!(monitor.job_snapshot("job-1").is_none());
        assert!(!monitor.forget("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_existing_job_replaces_previous_subscription() {
        let (monitor, transport, _) = setup(vec![]);

        let _first = monitor.watch_job("job-1", token());
        transport.data("job-1", update("PROCESSING"));
        settle().await;
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connected);

        let second = monitor.watch_job("job-1", None);
        assert_eq!(transport.adds(), 2);
        assert_eq!(transport.removes(), 1);
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connecting);

        transport.data("job-1", update("COMPLETE"));
        assert_eq!(second.wait().await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_after_teardown_follows_again() {
        let (monitor, transport, _) = setup(vec![]);

        let first = monitor.watch_job("job-1", token());
        transport.data("job-1", update("COMPLETED"));
        assert!(first.wait().await.is_ok());
        time::sleep(Duration::from_millis(1100)).await;
        assert!(monitor.monitored_jobs().is_empty());

        let second = monitor.watch_job("job-1", None);
        assert_eq!(transport.adds(), 2);
        transport.data("job-1", update("PROCESSING"));
        settle().await;
        assert_eq!(state(&monitor).connection_state, ConnectionState::Connected);
        transport.data("job-1", update("FAILED"));
        assert_eq!(second.wait().await.unwrap_err().code, codes::JOB_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let (monitor, transport, _) = setup(vec![]);
        let _a = monitor.watch_job("job-a", token());
        let _b = monitor.watch_job("job-b", None);
        assert_eq!(monitor.monitored_jobs(), vec!["job-a", "job-b"]);

        monitor.shutdown();
        assert!(monitor.monitored_jobs().is_empty());
        assert!(!transport.is_live("job-a"));
        assert!(!transport.is_live("job-b"));
    }

    #[test]
    fn submit_error_as_job_error() {
        let err = SubmitError::InvalidInput.to_job_error();
        assert_eq!(err.code, codes::INVALID_INPUT);
        assert_eq!(err.attempts, 0);
    }
}
