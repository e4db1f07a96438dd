//! Serving loop: one scheduler, one worker task per shard
//!
//! Workers own a [`Backend`] each and talk to the engine only through
//! [`WorkerCommand`] messages, so a worker could equally live in another
//! process. Each [`ServingEngine::step`] runs one scheduler cycle, hands every
//! shard its batch, and folds the reports back before the next cycle.

use crate::config::EmberConfig;
use ember_backend::Backend;
use ember_interfaces::{Batch, ModelExecutor, PrefilledState, Sampler, StepReport};
use ember_scheduler::{ImportTarget, Resolution, Scheduler, SchedulerStats};
use ember_types::{
    EmberError, FinishStatus, InferenceRequest, RequestId, Result, RouterConfig, ShardIndex,
    SharedRecordTable, SharedRequestRecord, TokenId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const WORKER_QUEUE_DEPTH: usize = 16;

/// Message to a shard worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run one batch and reply with its report
    Step {
        batch: Batch,
        reply: oneshot::Sender<Result<StepReport>>,
    },
    /// Raise the abort flag of a request living on this worker
    Abort {
        request_id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Final result of a request as seen by its submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestOutcome {
    /// At least one output was produced
    Completed {
        tokens: Vec<TokenId>,
        logprobs: Vec<f32>,
        /// Pooled representation in embedding mode
        pooled: Option<Vec<f32>>,
        status: FinishStatus,
    },
    Failed { reason: String },
}

impl RequestOutcome {
    pub fn status(&self) -> FinishStatus {
        match self {
            RequestOutcome::Completed { status, .. } => *status,
            RequestOutcome::Failed { .. } => FinishStatus::Aborted,
        }
    }

    pub fn tokens(&self) -> &[TokenId] {
        match self {
            RequestOutcome::Completed { tokens, .. } => tokens,
            RequestOutcome::Failed { .. } => &[],
        }
    }
}

/// What one engine step did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub batches: usize,
    pub tokens: usize,
    pub deferred: usize,
    pub resolved: usize,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    tokens: Vec<TokenId>,
    logprobs: Vec<f32>,
    pooled: Option<Vec<f32>>,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

async fn run_worker(mut backend: Backend, mut rx: mpsc::Receiver<WorkerCommand>) {
    let shard = backend.shard();
    debug!("Worker for shard {} started", shard);
    while let Some(command) = rx.recv().await {
        match command {
            WorkerCommand::Step { batch, reply } => {
                let result = backend.step(&batch).await;
                if reply.send(result).is_err() {
                    warn!("Shard {}: step reply dropped", shard);
                }
            }
            WorkerCommand::Abort { request_id, reply } => {
                if reply.send(backend.signal_abort(request_id)).is_err() {
                    warn!("Shard {}: abort reply for {} dropped", shard, request_id);
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(
        "Worker for shard {} stopped with {} live requests",
        shard,
        backend.live_requests()
    );
}

/// Scheduler plus shard workers for one serving instance
pub struct ServingEngine {
    scheduler: Scheduler,
    records: Arc<SharedRecordTable>,
    workers: Vec<WorkerHandle>,
    outputs: HashMap<RequestId, OutputBuffer>,
    outcomes: HashMap<RequestId, RequestOutcome>,
    router: RouterConfig,
    last_stats_log: Instant,
}

impl ServingEngine {
    /// Build the scheduler and spawn one worker per shard.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &EmberConfig,
        executor: Arc<dyn ModelExecutor>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EmberError::internal(format!("no tokio runtime: {}", e)))?;

        let records = Arc::new(SharedRecordTable::new());
        let scheduler = Scheduler::new(
            &config.router,
            &config.kv_cache,
            &config.parallel,
            records.clone(),
        )?;

        let mut workers = Vec::with_capacity(scheduler.shard_count());
        for shard in 0..scheduler.shard_count() {
            let kv_cache = scheduler
                .shard_handles(shard)
                .ok_or_else(|| EmberError::internal(format!("missing shard {}", shard)))?;
            let backend = Backend::new(
                shard,
                kv_cache,
                executor.clone(),
                sampler.clone(),
                records.clone(),
                &config.router,
                shard as u64,
            );
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            let task = runtime.spawn(run_worker(backend, rx));
            workers.push(WorkerHandle { tx, task });
        }

        info!(
            "Serving engine ready: mode={:?}, shards={}, executor={}, sampler={}",
            config.router.run_mode,
            workers.len(),
            executor.name(),
            sampler.name()
        );

        Ok(Self {
            scheduler,
            records,
            workers,
            outputs: HashMap::new(),
            outcomes: HashMap::new(),
            router: config.router.clone(),
            last_stats_log: Instant::now(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn records(&self) -> &Arc<SharedRecordTable> {
        &self.records
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn submit(&mut self, request: InferenceRequest) -> Result<Arc<SharedRequestRecord>> {
        let id = request.id;
        let record = self.scheduler.submit(request)?;
        self.outputs.insert(id, OutputBuffer::default());
        Ok(record)
    }

    /// Accept a prompt prefilled by a partner instance; see
    /// [`Scheduler::admit_prefilled`]
    pub fn admit_prefilled(
        &mut self,
        request: InferenceRequest,
        prefilled: PrefilledState,
    ) -> Result<Option<ImportTarget>> {
        let id = request.id;
        let first = (prefilled.first_token, prefilled.first_logprob);
        let target = self.scheduler.admit_prefilled(request, prefilled)?;
        if target.is_some() {
            self.outputs.insert(
                id,
                OutputBuffer {
                    tokens: vec![first.0],
                    logprobs: vec![first.1],
                    pooled: None,
                },
            );
        }
        Ok(target)
    }

    /// Request an abort.
    ///
    /// Requests already on a worker are flagged there; anything else is
    /// flagged through the record table.
    pub async fn abort(&self, id: RequestId) -> bool {
        let shard = self
            .scheduler
            .request(id)
            .filter(|r| r.announced)
            .and_then(|r| r.shard);
        if let Some(shard) = shard {
            if let Some(flagged) = self.abort_on_worker(shard, id).await {
                return flagged;
            }
        }
        self.scheduler.abort(id)
    }

    async fn abort_on_worker(&self, shard: ShardIndex, id: RequestId) -> Option<bool> {
        let worker = self.workers.get(shard)?;
        let (reply, rx) = oneshot::channel();
        worker
            .tx
            .send(WorkerCommand::Abort {
                request_id: id,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Run one scheduler cycle across all shards.
    ///
    /// A fatal executor failure aborts the requests of the failing batch and is
    /// returned after every other shard's report has been applied.
    pub async fn step(&mut self) -> Result<CycleSummary> {
        let plan = self.scheduler.schedule();
        for (id, err) in &plan.deferred {
            trace!("Cycle {}: {} deferred: {}", plan.cycle, id, err);
        }
        let mut summary = CycleSummary {
            cycle: plan.cycle,
            batches: plan.batches.len(),
            tokens: plan.total_tokens(),
            deferred: plan.deferred.len(),
            resolved: 0,
        };

        let mut pending = Vec::with_capacity(plan.batches.len());
        let mut failure: Option<EmberError> = None;
        for batch in plan.batches {
            let batch_id = batch.id;
            let shard = batch.shard;
            let (reply, rx) = oneshot::channel();
            let Some(worker) = self.workers.get(shard) else {
                let err = EmberError::internal(format!("no worker for shard {}", shard));
                self.scheduler.fail_batch(batch_id, &err);
                failure.get_or_insert(err);
                continue;
            };
            if worker
                .tx
                .send(WorkerCommand::Step { batch, reply })
                .await
                .is_err()
            {
                let err = EmberError::internal(format!("worker for shard {} stopped", shard));
                self.scheduler.fail_batch(batch_id, &err);
                failure.get_or_insert(err);
                continue;
            }
            pending.push((batch_id, rx));
        }

        for (batch_id, rx) in pending {
            let result = rx.await.unwrap_or_else(|_| {
                Err(EmberError::internal(format!(
                    "worker dropped reply for batch {}",
                    batch_id
                )))
            });
            match result {
                Ok(report) => {
                    self.collect_outputs(&report);
                    self.scheduler.complete_step(&report);
                }
                Err(err) => {
                    error!("Batch {} failed: {}", batch_id, err);
                    self.scheduler.fail_batch(batch_id, &err);
                    failure.get_or_insert(err);
                }
            }
        }

        summary.resolved = self.collect_resolutions();
        self.maybe_log_stats();

        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Step until nothing is queued or live, at most `max_cycles` times
    pub async fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64> {
        let mut cycles = 0;
        while !self.scheduler.is_idle() {
            if cycles == max_cycles {
                return Err(EmberError::scheduler(format!(
                    "still busy after {} cycles",
                    max_cycles
                )));
            }
            self.step().await?;
            cycles += 1;
        }
        Ok(cycles)
    }

    pub fn outcome(&self, id: RequestId) -> Option<&RequestOutcome> {
        self.outcomes.get(&id)
    }

    pub fn take_outcome(&mut self, id: RequestId) -> Option<RequestOutcome> {
        self.outcomes.remove(&id)
    }

    /// Stop every worker and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        for (shard, worker) in self.workers.iter().enumerate() {
            if worker.tx.send(WorkerCommand::Shutdown).await.is_err() {
                warn!("Shard {}: worker already stopped", shard);
            }
        }
        for (shard, worker) in self.workers.into_iter().enumerate() {
            worker.task.await.map_err(|e| {
                EmberError::internal(format!("worker for shard {} panicked: {}", shard, e))
            })?;
        }
        info!("Serving engine stopped");
        Ok(())
    }

    fn collect_outputs(&mut self, report: &StepReport) {
        for result in &report.results {
            let buffer = self.outputs.entry(result.request_id).or_default();
            if let Some(token) = result.new_token {
                buffer.tokens.push(token);
                buffer
                    .logprobs
                    .push(result.logprob.unwrap_or(f32::NEG_INFINITY));
            }
            if let Some(pooled) = &result.pooled {
                buffer.pooled = Some(pooled.clone());
            }
        }
    }

    fn collect_resolutions(&mut self) -> usize {
        let resolutions = self.scheduler.take_resolutions();
        let count = resolutions.len();
        for resolution in resolutions {
            self.resolve(resolution);
        }
        count
    }

    fn resolve(&mut self, resolution: Resolution) {
        let id = resolution.request_id;
        let buffer = self.outputs.remove(&id).unwrap_or_default();
        if resolution.exported {
            trace!("{} handed off after {} tokens", id, buffer.tokens.len());
            return;
        }
        let outcome = if resolution.snapshot.cur_output_len > 0 {
            RequestOutcome::Completed {
                tokens: buffer.tokens,
                logprobs: buffer.logprobs,
                pooled: buffer.pooled,
                status: resolution.status,
            }
        } else {
            RequestOutcome::Failed {
                reason: resolution
                    .reason
                    .unwrap_or_else(|| resolution.status.to_string()),
            }
        };
        debug!("{} resolved: {:?}", id, outcome.status());
        self.outcomes.insert(id, outcome);
    }

    fn maybe_log_stats(&mut self) {
        if self.router.disable_log_stats {
            return;
        }
        let interval = Duration::from_secs(self.router.log_stats_interval);
        if self.last_stats_log.elapsed() < interval {
            return;
        }
        self.last_stats_log = Instant::now();
        let stats = self.scheduler.stats();
        let hit_rate = stats
            .shards
            .iter()
            .filter_map(|s| s.prefix_hit_rate)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
        info!(
            "cycle={} waiting={} prefilling={} running={} transferring={} used_slots={}/{} finished={} aborted={} prefix_hit_rate={}",
            stats.cycle,
            stats.waiting,
            stats.prefilling,
            stats.running,
            stats.transferring,
            stats.used_slots(),
            stats.capacity(),
            stats.counters.finished,
            stats.counters.aborted,
            hit_rate.map_or_else(|| "n/a".to_string(), |r| format!("{:.2}", r))
        );
    }
}
