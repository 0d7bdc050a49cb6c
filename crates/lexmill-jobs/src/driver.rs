//! Periodic driver that keeps active jobs moving.
//!
//! Every tick the driver takes up to `max_concurrent_jobs` active jobs and, for
//! each, runs one submission batch followed by one poll pass. Each pass is a
//! complete, resumable unit of work, so a stopped driver loses nothing.
//!
//! Jobs are taken round-robin in id order: each tick resumes after the last
//! job the previous tick advanced and wraps around to the oldest.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use lexmill_core::{defaults, Error, JobStatus, Result};

use crate::engine::Engine;
use crate::poller::{PollConfig, ResultPoller};
use crate::submitter::{env_parse, BatchSubmitter, SubmitConfig};

/// Configuration for the job driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Delay between ticks in milliseconds.
    pub tick_ms: u64,
    /// Jobs advanced concurrently per tick.
    pub max_concurrent_jobs: usize,
    /// Whether the driver runs at all.
    pub enabled: bool,
    pub submit: SubmitConfig,
    pub poll: PollConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_ms: defaults::DRIVER_TICK_MS,
            max_concurrent_jobs: defaults::DRIVER_MAX_CONCURRENT_JOBS,
            enabled: true,
            submit: SubmitConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LLM_JOB_DRIVER_ENABLED` | `true` | Enable/disable the driver |
    /// | `LLM_JOB_MAX_CONCURRENT` | `4` | Jobs advanced concurrently per tick |
    /// | `LLM_JOB_TICK_MS` | `15000` | Delay between ticks |
    ///
    /// Submission and polling settings are read by
    /// [`SubmitConfig::from_env`] and [`PollConfig::from_env`].
    pub fn from_env() -> Self {
        let enabled = std::env::var("LLM_JOB_DRIVER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let max_concurrent_jobs = env_parse("LLM_JOB_MAX_CONCURRENT")
            .unwrap_or(defaults::DRIVER_MAX_CONCURRENT_JOBS)
            .max(1);
        let tick_ms = env_parse("LLM_JOB_TICK_MS").unwrap_or(defaults::DRIVER_TICK_MS);

        Self {
            tick_ms,
            max_concurrent_jobs,
            enabled,
            submit: SubmitConfig::from_env(),
            poll: PollConfig::from_env(),
        }
    }

    pub fn with_tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_submit(mut self, submit: SubmitConfig) -> Self {
        self.submit = submit;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }
}

/// Event emitted by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    DriverStarted,
    /// One job was advanced by a tick.
    JobAdvanced {
        job_id: Uuid,
        submitted: usize,
        status: JobStatus,
    },
    /// Advancing a job failed; it is retried next tick.
    JobErrored { job_id: Uuid, error: String },
    /// A tick finished.
    TickCompleted { jobs: usize },
    DriverStopped,
}

/// Handle for controlling a running driver.
pub struct DriverHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<DriverEvent>,
}

impl DriverHandle {
    /// Signal the driver to stop after the current tick.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_rx.resubscribe()
    }
}

/// Advances every active job on a fixed tick.
pub struct JobDriver {
    engine: Engine,
    config: DriverConfig,
    submitter: BatchSubmitter,
    poller: ResultPoller,
    event_tx: broadcast::Sender<DriverEvent>,
    /// Last job advanced by the previous tick.
    cursor: Mutex<Option<Uuid>>,
}

impl JobDriver {
    pub fn new(engine: Engine, config: DriverConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            submitter: BatchSubmitter::new(engine.clone(), config.submit.clone()),
            poller: ResultPoller::new(engine.clone(), config.poll.clone()),
            engine,
            config,
            event_tx,
            cursor: Mutex::new(None),
        }
    }

    /// Start the driver loop and return a handle for control.
    pub fn start(self) -> DriverHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let driver = Arc::new(self);
        tokio::spawn(async move {
            driver.run(&mut shutdown_rx).await;
        });
        DriverHandle {
            shutdown_tx,
            event_rx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "driver"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job driver is disabled, not starting");
            return;
        }
        if self.engine.provider.is_none() {
            warn!("No LLM provider configured, driver will only poll stored state");
        }
        info!(
            tick_ms = self.config.tick_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "Job driver started"
        );
        let _ = self.event_tx.send(DriverEvent::DriverStarted);

        let tick = Duration::from_millis(self.config.tick_ms);
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job driver received shutdown signal");
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Driver tick failed");
            }
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job driver received shutdown signal");
                    break;
                }
                _ = sleep(tick) => {}
            }
        }

        let _ = self.event_tx.send(DriverEvent::DriverStopped);
        info!("Job driver stopped");
    }

    /// Advance up to `max_concurrent_jobs` active jobs once. Returns how many
    /// jobs were touched.
    pub async fn tick(&self) -> Result<usize> {
        let start = Instant::now();
        let limit = self.config.max_concurrent_jobs.max(1);
        let job_ids = self.next_jobs(limit).await?;
        if job_ids.is_empty() {
            debug!("No active jobs");
            let _ = self.event_tx.send(DriverEvent::TickCompleted { jobs: 0 });
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for job_id in job_ids.iter().copied() {
            let advancer = JobAdvancer {
                submitter: self.submitter.clone(),
                poller: self.poller.clone(),
                batch_size: self.config.submit.batch_size,
                poll_limit: self.config.poll.limit,
            };
            tasks.spawn(async move { (job_id, advancer.advance(job_id).await) });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((job_id, Ok((submitted, status)))) => {
                    let _ = self.event_tx.send(DriverEvent::JobAdvanced {
                        job_id,
                        submitted,
                        status,
                    });
                }
                Ok((job_id, Err(e))) => {
                    warn!(%job_id, error = %e, "Failed to advance job");
                    let _ = self.event_tx.send(DriverEvent::JobErrored {
                        job_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => error!(error = ?e, "Driver task panicked"),
            }
        }

        debug!(
            jobs = job_ids.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Driver tick finished"
        );
        let _ = self.event_tx.send(DriverEvent::TickCompleted {
            jobs: job_ids.len(),
        });
        Ok(job_ids.len())
    }

    /// Up to `limit` active jobs following the cursor, wrapping to the start.
    async fn next_jobs(&self, limit: usize) -> Result<Vec<Uuid>> {
        let store = &self.engine.store;
        let mut cursor = self.cursor.lock().await;
        let mut job_ids = store.active_job_ids(*cursor, limit as i64).await?;
        if cursor.is_some() && job_ids.len() < limit {
            let wrapped = store
                .active_job_ids(None, (limit - job_ids.len()) as i64)
                .await?;
            for job_id in wrapped {
                if !job_ids.contains(&job_id) {
                    job_ids.push(job_id);
                }
            }
        }
        *cursor = job_ids.last().copied();
        Ok(job_ids)
    }
}

/// What a spawned tick task needs to advance one job.
struct JobAdvancer {
    submitter: BatchSubmitter,
    poller: ResultPoller,
    batch_size: usize,
    poll_limit: usize,
}

impl JobAdvancer {
    async fn advance(self, job_id: Uuid) -> Result<(usize, JobStatus)> {
        let batch = self.submitter.submit_batch(job_id, self.batch_size).await?;
        let job = self.poller.refresh(job_id, self.poll_limit).await?;
        Ok((batch.submitted, job.status))
    }
}
