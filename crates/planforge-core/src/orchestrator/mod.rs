//! The streaming control loop: resumes or rejects duplicate work, drives the
//! generator, emits progress, and finalizes results into both stores.
//!
//! One logical task runs per open stream connection. Reconnections for the
//! same request ID converge on the same ledger row through the resume check,
//! not through a lock -- the ledger's guarded transitions make a duplicate
//! start harmless if one slips through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use planforge_db::models::{GenerationKind, GenerationRequest, RequestStatus};
use planforge_db::queries::{metrics, requests};

use crate::cache::{CacheStatus, RequestCache};
use crate::events::{ProgressEvent, ProgressSink};
use crate::generator::{GenerationContext, Generator, ProfileStore};
use crate::progress::ProgressSimulator;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tunables for the control loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fallback generation-duration estimate when no history exists.
    pub default_estimate: Duration,
    /// Simulator tick interval while the generator call is in flight.
    pub tick_interval: Duration,
    /// Ledger poll interval when following work owned by another process.
    pub poll_interval: Duration,
    /// Hard ceiling on how long a stream waits before surfacing a timeout.
    pub stream_ceiling: Duration,
    /// Ledger rows untouched for longer than this read as `not_found`.
    pub retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_estimate: Duration::from_secs(120),
            tick_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            stream_ceiling: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(10 * 60),
        }
    }
}

/// What a stream connection carries on entry.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    /// Client-generated idempotency key.
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub context: GenerationContext,
}

/// Errors surfaced to the transport layer before or instead of a stream.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A different active generation already exists for this user.
    #[error("a generation is already in progress")]
    Conflict,
    /// Request ID unknown or expired; the caller should start over.
    #[error("request not found or expired")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Short, classified message safe to show a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Conflict => "a generation is already in progress",
            Self::NotFound => "request not found, start a new generation",
            Self::Internal(_) => "internal error, try again",
        }
    }
}

/// Work-request event published to an external execution channel.
///
/// The core assumes nothing about the worker beyond it eventually calling
/// the ledger transition functions for the same request ID.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequested {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub kind: GenerationKind,
    pub target_day: Option<i32>,
}

impl GenerationRequested {
    /// Event name on the wire.
    pub const EVENT: &'static str = "generation.requested";
}

/// Message-passing boundary for out-of-process execution.
#[async_trait::async_trait]
pub trait WorkerHandoff: Send + Sync {
    async fn publish(&self, event: GenerationRequested) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Guarded stream
// ---------------------------------------------------------------------------

/// Wraps the sink so a disconnected client can never abort the loop, and so
/// emitted percentages never regress within one connection.
struct GuardedStream<'a> {
    sink: &'a mut dyn ProgressSink,
    client_gone: bool,
    last_percent: u8,
}

impl<'a> GuardedStream<'a> {
    fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            sink,
            client_gone: false,
            last_percent: 0,
        }
    }

    async fn progress(&mut self, percent: u8, phase: &str, message: &str, eta_seconds: Option<u64>) {
        if percent < self.last_percent {
            return;
        }
        self.last_percent = percent;
        self.emit(ProgressEvent::Progress {
            phase: phase.to_owned(),
            percent,
            message: message.to_owned(),
            eta_seconds,
        })
        .await;
    }

    async fn complete(&mut self, result_ref: String, insight_changes: Value) {
        self.emit(ProgressEvent::Complete {
            result_ref,
            insight_changes,
        })
        .await;
    }

    async fn error(&mut self, message: String) {
        self.emit(ProgressEvent::Error { message }).await;
    }

    async fn emit(&mut self, event: ProgressEvent) {
        if self.client_gone {
            return;
        }
        if self.sink.send(event).await.is_err() {
            tracing::debug!("stream write failed, client gone; side effects continue");
            self.client_gone = true;
        }
    }

    fn client_gone(&self) -> bool {
        self.client_gone
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Composes the ledger, cache, metrics, generator, and optional worker
/// hand-off behind one entry point per stream connection.
pub struct Orchestrator {
    pool: PgPool,
    cache: Arc<RequestCache>,
    profiles: Arc<dyn ProfileStore>,
    generator: Arc<dyn Generator>,
    handoff: Option<Arc<dyn WorkerHandoff>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        cache: Arc<RequestCache>,
        profiles: Arc<dyn ProfileStore>,
        generator: Arc<dyn Generator>,
        handoff: Option<Arc<dyn WorkerHandoff>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            profiles,
            generator,
            handoff,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Entry point for a stream connection carrying `(user, request, context)`.
    ///
    /// Resumes finished or in-flight work for a known request ID, rejects a
    /// different concurrent generation for the same user, and otherwise
    /// starts and drives a new one. Generator failures do not surface as
    /// `Err`: they finalize the request as failed and end the stream with an
    /// error event.
    pub async fn run(
        &self,
        params: GenerationParams,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), OrchestratorError> {
        let mut stream = GuardedStream::new(sink);
        let request_id = params.request_id;

        // 1. Resume check, ledger first (authoritative, survives restarts).
        if let Some(existing) = requests::get_request(&self.pool, request_id).await? {
            if self.expired(&existing) {
                return Err(OrchestratorError::NotFound);
            }
            tracing::info!(request_id = %request_id, status = %existing.status, "resuming known request");
            return self.replay_or_follow(existing, &mut stream).await;
        }

        // Cache next: cheap, process-local, possibly ahead of a slow ledger
        // read path but never authoritative.
        if let Some(entry) = self.cache.get(request_id) {
            match entry.status {
                CacheStatus::Complete => {
                    stream
                        .complete(entry.result_ref.unwrap_or_default(), entry.insight_changes)
                        .await;
                    return Ok(());
                }
                CacheStatus::Error => {
                    stream
                        .error(entry.error.unwrap_or_else(|| "generation failed".to_owned()))
                        .await;
                    return Ok(());
                }
                CacheStatus::InProgress => return self.follow(request_id, &mut stream).await,
            }
        }

        // 2. Dedup check: at most one active generation per user.
        if let Some(active) = requests::get_active_for_user(&self.pool, params.user_id).await? {
            if !self.expired(&active) {
                if params.context.matches_request(active.kind, active.target_day) {
                    tracing::info!(
                        request_id = %request_id,
                        active_id = %active.id,
                        "same-context start resumes the active request"
                    );
                    return self.replay_or_follow(active, &mut stream).await;
                }
                tracing::info!(
                    request_id = %request_id,
                    active_id = %active.id,
                    "different-context start rejected while a generation is active"
                );
                return Err(OrchestratorError::Conflict);
            }
        }

        // 3. Start: create the ledger row in `pending`.
        match requests::insert_request(
            &self.pool,
            request_id,
            params.user_id,
            params.context.kind(),
            params.context.target_day(),
        )
        .await
        {
            Ok(_) => {}
            Err(err) if requests::is_unique_violation(&err) => {
                // Lost a race with a concurrent first contact for the same
                // id; converge on the winner's row.
                let existing = requests::get_request(&self.pool, request_id)
                    .await?
                    .ok_or(OrchestratorError::NotFound)?;
                return self.replay_or_follow(existing, &mut stream).await;
            }
            Err(err) => return Err(err.into()),
        }

        // Hand off to an out-of-process worker when a channel is configured;
        // the stream's only remaining job is translating ledger deltas.
        if let Some(handoff) = &self.handoff {
            handoff
                .publish(GenerationRequested {
                    request_id,
                    user_id: params.user_id,
                    kind: params.context.kind(),
                    target_day: params.context.target_day(),
                })
                .await?;
            tracing::info!(request_id = %request_id, "published work request to execution channel");
            return self.follow(request_id, &mut stream).await;
        }

        self.drive(params, &mut stream).await
    }

    /// Replay a terminal request immediately, or follow an active one.
    async fn replay_or_follow(
        &self,
        existing: GenerationRequest,
        stream: &mut GuardedStream<'_>,
    ) -> Result<(), OrchestratorError> {
        match existing.status {
            RequestStatus::Completed => {
                let insight = self
                    .cache
                    .get(existing.id)
                    .map(|e| e.insight_changes)
                    .unwrap_or(Value::Null);
                stream
                    .complete(existing.result_ref.unwrap_or_default(), insight)
                    .await;
                Ok(())
            }
            RequestStatus::Failed => {
                stream
                    .error(
                        existing
                            .error_message
                            .unwrap_or_else(|| "generation failed".to_owned()),
                    )
                    .await;
                Ok(())
            }
            RequestStatus::Pending | RequestStatus::InProgress => {
                self.follow(existing.id, stream).await
            }
        }
    }

    /// Run the generator inline and finalize both stores.
    async fn drive(
        &self,
        params: GenerationParams,
        stream: &mut GuardedStream<'_>,
    ) -> Result<(), OrchestratorError> {
        let request_id = params.request_id;
        let kind = params.context.kind().to_string();

        self.cache.start(request_id);
        requests::mark_started(&self.pool, request_id).await?;

        let estimate = match metrics::estimate_duration_ms(&self.pool, params.user_id, &kind).await
        {
            Ok(est) => est.and_then(|ms| u64::try_from(ms).ok()).map(Duration::from_millis),
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "duration estimate unavailable");
                None
            }
        };
        let eta = estimate.map(|d| d.as_secs());

        self.milestone(stream, request_id, 0, "starting", "starting generation", eta)
            .await;
        self.milestone(stream, request_id, 10, "profile", "loading profile", eta)
            .await;

        let profile = match self.profiles.load(params.user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "profile load failed");
                return self
                    .finalize_failure(params, &kind, 0, "profile incomplete or unavailable", stream)
                    .await;
            }
        };

        self.milestone(stream, request_id, 30, "planning", "planning structure", eta)
            .await;
        self.milestone(stream, request_id, 45, "analyzing", "analyzing training history", eta)
            .await;

        // The opaque call. The simulator keeps the stream moving between 45
        // and 75 while the generator works; its guard stops the ticker on
        // every exit path.
        let sim_duration = estimate.unwrap_or(self.config.default_estimate);
        let (tick_tx, mut tick_rx) = mpsc::channel::<u8>(8);
        let simulator = ProgressSimulator::start(
            45,
            75,
            sim_duration,
            self.config.tick_interval,
            move |percent| {
                // A full channel just drops a tick; the next one catches up.
                let _ = tick_tx.try_send(percent);
            },
        );

        let started = tokio::time::Instant::now();
        let generate = self.generator.generate(&profile, params.context);
        tokio::pin!(generate);

        let result = loop {
            tokio::select! {
                result = &mut generate => break result,
                Some(percent) = tick_rx.recv() => {
                    if let Err(err) =
                        requests::update_progress(&self.pool, request_id, percent as i32, "generating").await
                    {
                        tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "progress write failed");
                    }
                    let remaining = estimate
                        .map(|d| d.saturating_sub(started.elapsed()).as_secs());
                    stream
                        .progress(percent, "generating", "building your plan", remaining)
                        .await;
                }
            }
        };
        simulator.stop();
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(plan) => {
                self.milestone(stream, request_id, 75, "optimizing", "optimizing exercise order", None)
                    .await;
                self.milestone(stream, request_id, 85, "validating", "validating plan", None)
                    .await;
                self.milestone(stream, request_id, 95, "saving", "saving plan", None)
                    .await;

                // Terminal ordering: ledger first, then cache, then metrics.
                // Losing a terminal write breaks resumability, so only this
                // ledger failure propagates.
                let transitioned =
                    requests::mark_completed(&self.pool, request_id, &plan.result_ref).await?;
                if !transitioned {
                    tracing::warn!(request_id = %request_id, "request already terminal, keeping first result");
                }
                self.cache
                    .complete(request_id, &plan.result_ref, plan.insight_changes.clone());
                if let Err(err) =
                    metrics::record_sample(&self.pool, params.user_id, &kind, duration_ms, true).await
                {
                    tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "metrics write failed");
                }

                tracing::info!(
                    request_id = %request_id,
                    duration_ms = duration_ms,
                    result_ref = %plan.result_ref,
                    "generation completed"
                );
                stream.complete(plan.result_ref, plan.insight_changes).await;
                Ok(())
            }
            Err(err) => {
                // Raw detail stays in logs; the ledger and the client get
                // the classified message.
                tracing::warn!(request_id = %request_id, error = %err, "generator failed");
                self.finalize_failure(params, &kind, duration_ms, err.user_message(), stream)
                    .await
            }
        }
    }

    /// Write the failed terminal state everywhere, then end the stream.
    async fn finalize_failure(
        &self,
        params: GenerationParams,
        kind: &str,
        duration_ms: i64,
        message: &str,
        stream: &mut GuardedStream<'_>,
    ) -> Result<(), OrchestratorError> {
        let request_id = params.request_id;

        let transitioned = requests::mark_failed(&self.pool, request_id, message).await?;
        if !transitioned {
            tracing::warn!(request_id = %request_id, "request already terminal, failure write ignored");
        }
        self.cache.error(request_id, message);
        if let Err(err) =
            metrics::record_sample(&self.pool, params.user_id, kind, duration_ms, false).await
        {
            tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "metrics write failed");
        }

        stream.error(message.to_owned()).await;
        Ok(())
    }

    /// Translate ledger deltas into stream events until a terminal state
    /// appears or the ceiling elapses.
    ///
    /// Used when the work is owned elsewhere: a reconnecting stream, or a
    /// request handed off to an out-of-process worker. Ceiling expiry emits
    /// a timeout without failing the ledger row -- the owner may still
    /// finish, and a later poll sees the real terminal state.
    async fn follow(
        &self,
        request_id: Uuid,
        stream: &mut GuardedStream<'_>,
    ) -> Result<(), OrchestratorError> {
        tracing::info!(request_id = %request_id, "following request via ledger polls");
        let deadline = tokio::time::Instant::now() + self.config.stream_ceiling;

        loop {
            let Some(req) = requests::get_request(&self.pool, request_id).await? else {
                stream
                    .error("request not found, start a new generation".to_owned())
                    .await;
                return Ok(());
            };

            match req.status {
                RequestStatus::Completed => {
                    let insight = self
                        .cache
                        .get(request_id)
                        .map(|e| e.insight_changes)
                        .unwrap_or(Value::Null);
                    stream
                        .complete(req.result_ref.unwrap_or_default(), insight)
                        .await;
                    return Ok(());
                }
                RequestStatus::Failed => {
                    stream
                        .error(
                            req.error_message
                                .unwrap_or_else(|| "generation failed".to_owned()),
                        )
                        .await;
                    return Ok(());
                }
                RequestStatus::Pending | RequestStatus::InProgress => {
                    // Never show less than the ledger's persisted value; the
                    // cache estimate may run ahead of it, never behind.
                    let ledger_percent = req.progress_percent.clamp(0, 100) as u8;
                    let (percent, phase) = match self.cache.estimate_progress(request_id) {
                        Some((est, est_phase)) if est > ledger_percent => {
                            (est, est_phase.to_owned())
                        }
                        _ => (
                            ledger_percent,
                            req.current_phase.unwrap_or_else(|| "working".to_owned()),
                        ),
                    };
                    stream
                        .progress(percent, &phase, "generation in progress", None)
                        .await;

                    if stream.client_gone() {
                        // No listener and no side effects left to perform.
                        tracing::debug!(request_id = %request_id, "client gone, stopping follow loop");
                        return Ok(());
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                stream
                    .error("generation timed out, reconnect or poll for status".to_owned())
                    .await;
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Emit a fixed milestone to the ledger (best-effort) and the stream.
    async fn milestone(
        &self,
        stream: &mut GuardedStream<'_>,
        request_id: Uuid,
        percent: u8,
        phase: &str,
        message: &str,
        eta_seconds: Option<u64>,
    ) {
        if let Err(err) =
            requests::update_progress(&self.pool, request_id, percent as i32, phase).await
        {
            tracing::warn!(request_id = %request_id, error = %format!("{err:#}"), "progress write failed");
        }
        stream.progress(percent, phase, message, eta_seconds).await;
    }

    /// Whether a ledger row is past the retention window.
    fn expired(&self, req: &GenerationRequest) -> bool {
        req.age(Utc::now())
            .to_std()
            .map(|age| age > self.config.retention)
            .unwrap_or(false)
    }
}
