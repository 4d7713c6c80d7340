// src/service/mod.rs

//! Asynchronous preservation service
//!
//! Accepts preservation requests, runs at most one build per identifier at a
//! time on a fixed pool of workers, and records every request's progress in
//! a durable [`StatusStore`].
//!
//! ```text
//! Queued -> Running -> Succeeded | Failed | Cancelled
//!              |
//!              +-> Queued (re-request, while attempt < max_retries)
//! ```
//!
//! The identifier lock is taken at `submit` and held until the request is
//! terminal. Workers persist the terminal status before releasing it.
//!
//! A build also holds its bag's [`BagLock`] while it runs. `start` reconciles
//! the store before any worker runs: a `running` row whose bag lock nobody
//! holds was interrupted and is failed, so it cannot block new submissions.

mod locks;
mod queue;
mod store;
mod worker;

pub use locks::IdentifierLocks;
pub use queue::{QueuedRequest, RequestQueue};
pub use store::{StatusStore, Transition};
pub use worker::JobOutcome;

use crate::bag::BagLock;
use crate::cancel::CancellationToken;
use crate::config::PreservationConfig;
use crate::context::BuildContext;
use crate::external::{
    AcceptAll, ArchiveStore, DirectoryArchive, IdentityTransform, MetadataTransform,
    RecordValidator,
};
use crate::validate::{Issue, Severity};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unique request identifier (UUID)
pub type RequestId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreservationState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PreservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for PreservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreservationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidRecord(format!("unknown state '{}'", other))),
        }
    }
}

/// Where a submission's inputs live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipLocation {
    /// Source metadata document handed to the metadata transform
    pub metadata: PathBuf,
    /// Directory whose files become the bag's payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl SipLocation {
    pub fn new<P: Into<PathBuf>>(metadata: P) -> Self {
        Self {
            metadata: metadata.into(),
            data_dir: None,
        }
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }
}

/// Durable status of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservationStatus {
    pub request_id: RequestId,
    pub identifier: String,
    pub state: PreservationState,
    /// Requeues so far
    pub attempt: u32,
    pub sip: SipLocation,
    /// Validator issues, once a bag was validated
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Why the request failed or was cancelled
    #[serde(default)]
    pub cause: Option<String>,
    /// Set when an interrupted build was failed at recovery
    #[serde(default)]
    pub retry_eligible: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PreservationStatus {
    pub fn queued(request_id: RequestId, identifier: &str, sip: SipLocation) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            identifier: identifier.to_string(),
            state: PreservationState::Queued,
            attempt: 0,
            sip,
            issues: Vec::new(),
            cause: None,
            retry_eligible: false,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn prob_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Prob)
            .count()
    }
}

impl fmt::Display for PreservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (attempt {})",
            self.request_id, self.identifier, self.state, self.attempt
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Result of [`PreservationService::cancel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue and recorded as cancelled
    Cancelled,
    /// Running; the worker stops at its next checkpoint
    Requested,
    /// Already finished; nothing to do
    AlreadyTerminal(PreservationState),
}

/// Events broadcast by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    Queued {
        request_id: RequestId,
        identifier: String,
    },
    Started {
        request_id: RequestId,
        attempt: u32,
    },
    Requeued {
        request_id: RequestId,
        attempt: u32,
        reason: String,
    },
    Succeeded {
        request_id: RequestId,
    },
    Failed {
        request_id: RequestId,
        cause: String,
    },
    Cancelled {
        request_id: RequestId,
    },
}

/// What `recover` did with the requests left by a previous run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted builds, now failed and marked retry-eligible
    pub failed: Vec<RequestId>,
    /// Queued requests put back on the queue
    pub requeued: Vec<RequestId>,
}

/// The external collaborators a build calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub transform: Arc<dyn MetadataTransform>,
    pub validator: Arc<dyn RecordValidator>,
    pub archive: Arc<dyn ArchiveStore>,
}

impl Collaborators {
    pub fn new(
        transform: Arc<dyn MetadataTransform>,
        validator: Arc<dyn RecordValidator>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self {
            transform,
            validator,
            archive,
        }
    }

    /// Identity transform, accept-all validator, directory archive
    pub fn local<P: Into<PathBuf>>(archive_dir: P) -> Self {
        Self::new(
            Arc::new(IdentityTransform),
            Arc::new(AcceptAll),
            Arc::new(DirectoryArchive::new(archive_dir)),
        )
    }
}

struct Shared {
    ctx: BuildContext,
    store: StatusStore,
    locks: IdentifierLocks,
    queue: RequestQueue,
    events: broadcast::Sender<ServiceEvent>,
    collaborators: Collaborators,
}

impl Shared {
    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn finish(&self, request: &QueuedRequest) {
        self.queue.remove_token(&request.request_id);
        self.locks.release(&request.identifier, &request.request_id);
    }
}

pub struct PreservationService {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PreservationService {
    /// Open the status store; workers are not started until [`start`](Self::start)
    pub fn new(config: PreservationConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let store = StatusStore::open(&config.service.status_db)?;
        Ok(Self::with_store(config, collaborators, store))
    }

    pub fn with_store(
        config: PreservationConfig,
        collaborators: Collaborators,
        store: StatusStore,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                ctx: BuildContext::new(Arc::new(config)),
                store,
                locks: IdentifierLocks::new(),
                queue: RequestQueue::new(),
                events,
                collaborators,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PreservationConfig {
        self.shared.ctx.config()
    }

    pub fn store(&self) -> &StatusStore {
        &self.shared.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    /// Reconcile what a previous run left behind, then spawn the worker pool
    ///
    /// Runs on the current tokio runtime. Starting twice is a no-op that
    /// returns an empty report.
    pub fn start(&self) -> Result<RecoveryReport> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return Ok(RecoveryReport::default());
        }
        let report = self.recover()?;

        let count = self.config().service.workers;
        for worker_id in 0..count {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        info!("Started {} preservation worker(s)", count);
        Ok(report)
    }

    /// Stop taking requests and wait for every worker to finish its current job
    pub async fn shutdown(&self) {
        self.shared.queue.close();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Preservation worker ended abnormally: {}", e);
            }
        }
        info!("Preservation service stopped");
    }

    /// Queue a preservation request; returns immediately
    pub fn submit(&self, identifier: &str, sip: SipLocation) -> Result<RequestId> {
        if identifier.trim().is_empty() {
            return Err(Error::InvalidRecord("identifier must not be empty".to_string()));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        if let Err(holder) = self.shared.locks.try_acquire(identifier, &request_id) {
            return Err(Error::AlreadyInProgress {
                identifier: identifier.to_string(),
                request_id: holder,
            });
        }

        let status = PreservationStatus::queued(request_id.clone(), identifier, sip.clone());
        if let Err(e) = self.shared.store.insert(&status) {
            self.shared.locks.release(identifier, &request_id);
            return Err(e);
        }

        self.shared.queue.push(QueuedRequest {
            request_id: request_id.clone(),
            identifier: identifier.to_string(),
            sip,
            cancel_token: CancellationToken::new(),
        });
        self.shared.emit(ServiceEvent::Queued {
            request_id: request_id.clone(),
            identifier: identifier.to_string(),
        });

        info!("Queued preservation of {} as request {}", identifier, request_id);
        Ok(request_id)
    }

    pub fn status(&self, request_id: &str) -> Result<PreservationStatus> {
        self.shared
            .store
            .get(request_id)?
            .ok_or_else(|| Error::NotFound(format!("request {}", request_id)))
    }

    /// Status of the most recent request for an identifier
    pub fn status_for_identifier(&self, identifier: &str) -> Result<PreservationStatus> {
        self.shared
            .store
            .latest_for_identifier(identifier)?
            .ok_or_else(|| Error::NotFound(format!("no requests for {}", identifier)))
    }

    pub fn cancel(&self, request_id: &str) -> Result<CancelOutcome> {
        let status = self.status(request_id)?;
        if status.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(status.state));
        }

        if let Some(request) = self.shared.queue.remove(request_id) {
            let cancelled = self.shared.store.transition(
                request_id,
                PreservationState::Queued,
                PreservationState::Cancelled,
                Transition::new().cause("cancelled before the build started"),
            )?;
            self.shared.locks.release(&request.identifier, request_id);
            if cancelled {
                self.shared.emit(ServiceEvent::Cancelled {
                    request_id: request_id.to_string(),
                });
                return Ok(CancelOutcome::Cancelled);
            }
            return Ok(CancelOutcome::AlreadyTerminal(self.status(request_id)?.state));
        }

        if let Some(token) = self.shared.queue.cancel_token(request_id) {
            token.cancel();
            info!("Cancellation requested for running request {}", request_id);
            return Ok(CancelOutcome::Requested);
        }

        // Queued in the store but unknown to this process (not yet recovered)
        if self.shared.store.transition(
            request_id,
            PreservationState::Queued,
            PreservationState::Cancelled,
            Transition::new().cause("cancelled before the build started"),
        )? {
            self.shared.emit(ServiceEvent::Cancelled {
                request_id: request_id.to_string(),
            });
            return Ok(CancelOutcome::Cancelled);
        }
        Ok(CancelOutcome::AlreadyTerminal(self.status(request_id)?.state))
    }

    /// Reconcile requests left behind by a previous run
    ///
    /// A running request is live if this service holds its identifier or any
    /// process holds its bag lock. Every other running request is failed,
    /// never resumed. Queued requests go back on the queue.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for status in self.shared.store.list_by_state(PreservationState::Running)? {
            if self.shared.locks.holder(&status.identifier).as_deref()
                == Some(status.request_id.as_str())
            {
                continue;
            }
            let bag_dir = self.config().bag_dir_for(&status.identifier);
            if BagLock::is_held(BagLock::path_for(&bag_dir)) {
                debug!(
                    "Request {} for {} is being built elsewhere",
                    status.request_id, status.identifier
                );
                continue;
            }
            let failed = self.shared.store.transition(
                &status.request_id,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new()
                    .issues(status.issues.clone())
                    .cause("build was interrupted; no worker was running it")
                    .retry_eligible(),
            )?;
            if failed {
                warn!(
                    "Request {} for {} was interrupted; marked failed",
                    status.request_id, status.identifier
                );
                self.shared.locks.release(&status.identifier, &status.request_id);
                report.failed.push(status.request_id);
            }
        }

        for status in self.shared.store.list_by_state(PreservationState::Queued)? {
            if self.shared.queue.cancel_token(&status.request_id).is_some() {
                continue;
            }
            if self
                .shared
                .locks
                .try_acquire(&status.identifier, &status.request_id)
                .is_err()
            {
                continue;
            }
            self.shared.queue.push(QueuedRequest {
                request_id: status.request_id.clone(),
                identifier: status.identifier.clone(),
                sip: status.sip.clone(),
                cancel_token: CancellationToken::new(),
            });
            self.shared.emit(ServiceEvent::Queued {
                request_id: status.request_id.clone(),
                identifier: status.identifier,
            });
            report.requeued.push(status.request_id);
        }

        info!(
            "Recovery: {} interrupted build(s) failed, {} request(s) requeued",
            report.failed.len(),
            report.requeued.len()
        );
        Ok(report)
    }

    /// Poll until the request is terminal or `timeout` passes
    ///
    /// Returns the last status seen either way.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Result<PreservationStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(request_id)?;
            if status.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    while let Some(request) = shared.queue.pop().await {
        tracing::debug!("Worker {} picked up request {}", worker_id, request.request_id);
        run_request(&shared, request).await;
    }
    tracing::debug!("Worker {} exiting", worker_id);
}

async fn run_request(shared: &Arc<Shared>, request: QueuedRequest) {
    let request_id = request.request_id.clone();

    if request.cancel_token.is_cancelled() {
        record_terminal(
            shared,
            &request,
            PreservationState::Queued,
            PreservationState::Cancelled,
            Transition::new().cause("cancelled before the build started"),
        );
        shared.finish(&request);
        return;
    }

    let started = shared.store.transition(
        &request_id,
        PreservationState::Queued,
        PreservationState::Running,
        Transition::new(),
    );
    let attempt = match (started, shared.store.get(&request_id)) {
        (Ok(true), Ok(Some(status))) => status.attempt,
        (Ok(true), _) => 0,
        (Ok(false), _) => {
            // Cancelled or otherwise finished while queued
            shared.finish(&request);
            return;
        }
        (Err(e), _) => {
            error!("Cannot start request {}: {}", request_id, e);
            shared.finish(&request);
            return;
        }
    };
    shared.emit(ServiceEvent::Started {
        request_id: request_id.clone(),
        attempt,
    });

    let ctx = shared.ctx.for_request(&request.identifier, &request_id);
    let mut handle = {
        let shared = shared.clone();
        let identifier = request.identifier.clone();
        let sip = request.sip.clone();
        let token = request.cancel_token.clone();
        tokio::task::spawn_blocking(move || {
            worker::build_and_archive(&ctx, &shared.collaborators, &identifier, &sip, &token)
        })
    };

    let timeout = shared.ctx.config().build_timeout();
    let joined = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            let cause = format!("build timed out after {}s", timeout.as_secs());
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new().cause(cause),
            );
            request.cancel_token.cancel();

            // Keep the identifier locked until the build has really stopped
            let shared = shared.clone();
            tokio::spawn(async move {
                let _ = handle.await;
                shared.finish(&request);
            });
            return;
        }
    };

    match joined {
        Ok(Ok(JobOutcome::Archived { issues, serialized })) => {
            info!(
                "Preserved {} ({})",
                request.identifier,
                serialized.display()
            );
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Succeeded,
                Transition::new().issues(issues),
            );
        }
        Ok(Ok(JobOutcome::Rejected { issues })) => {
            let probs = issues.iter().filter(|i| i.severity == Severity::Prob).count();
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new()
                    .issues(issues)
                    .cause(format!("bag failed validation with {} PROB issue(s)", probs)),
            );
        }
        Ok(Err(Error::Rerequest(reason))) => {
            let max_retries = shared.ctx.config().service.max_retries;
            if attempt < max_retries {
                requeue(shared, request, attempt + 1, reason);
                return;
            }
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new().cause(format!(
                    "gave up after {} re-request(s): {}",
                    attempt, reason
                )),
            );
        }
        Ok(Err(Error::Cancelled)) => {
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Cancelled,
                Transition::new().cause("cancelled during the build"),
            );
        }
        Ok(Err(e)) => {
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new().cause(e.to_string()),
            );
        }
        Err(join_error) => {
            record_terminal(
                shared,
                &request,
                PreservationState::Running,
                PreservationState::Failed,
                Transition::new().cause(format!("build task aborted: {}", join_error)),
            );
        }
    }

    shared.finish(&request);
}

fn requeue(shared: &Arc<Shared>, request: QueuedRequest, attempt: u32, reason: String) {
    let moved = shared.store.transition(
        &request.request_id,
        PreservationState::Running,
        PreservationState::Queued,
        Transition::new().attempt(attempt).cause(reason.clone()),
    );
    match moved {
        Ok(true) => {
            info!(
                "Requeued request {} (attempt {}): {}",
                request.request_id, attempt, reason
            );
            shared.emit(ServiceEvent::Requeued {
                request_id: request.request_id.clone(),
                attempt,
                reason,
            });
            shared.queue.push(request);
        }
        Ok(false) => shared.finish(&request),
        Err(e) => {
            error!("Cannot requeue request {}: {}", request.request_id, e);
            shared.finish(&request);
        }
    }
}

/// Persist a terminal state and announce it
fn record_terminal(
    shared: &Shared,
    request: &QueuedRequest,
    from: PreservationState,
    to: PreservationState,
    update: Transition,
) {
    let cause = update.cause.clone().unwrap_or_default();
    match shared.store.transition(&request.request_id, from, to, update) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "Request {} was no longer {}; {} not recorded",
                request.request_id, from, to
            );
            return;
        }
        Err(e) => {
            error!(
                "Cannot record {} for request {}: {}",
                to, request.request_id, e
            );
            return;
        }
    }

    let request_id = request.request_id.clone();
    let event = match to {
        PreservationState::Succeeded => ServiceEvent::Succeeded { request_id },
        PreservationState::Cancelled => ServiceEvent::Cancelled { request_id },
        _ => {
            warn!("Request {} failed: {}", request.request_id, cause);
            ServiceEvent::Failed { request_id, cause }
        }
    };
    shared.emit(event);
}
