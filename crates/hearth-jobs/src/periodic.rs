//! Periodic job scheduling.
//!
//! Each [`PeriodicJob`] pairs a [`Schedule`] with a factory for its args. The
//! scheduler inserts a fresh job whenever a schedule comes due, optionally
//! skipping the firing while the instance it inserted last is still unfinished.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use hearth_core::{Error, InsertOpts, JobArgs, JobKind, JobRepository, NewJob, Result};

/// When a periodic job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval between firings.
    Interval(Duration),
    /// Once a day at `hour:minute` UTC.
    Daily { hour: u32, minute: u32 },
}

impl Schedule {
    /// Interval schedule. Intervals shorter than one second are rejected.
    pub fn every(interval: Duration) -> Result<Self> {
        if interval < Duration::from_secs(1) {
            return Err(Error::Config(format!(
                "periodic interval must be at least 1s, got {interval:?}"
            )));
        }
        Ok(Schedule::Interval(interval))
    }

    /// Daily schedule at `hour:minute` UTC.
    pub fn daily(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Config(format!(
                "invalid daily schedule {hour:02}:{minute:02}"
            )));
        }
        Ok(Schedule::Daily { hour, minute })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::Interval(interval) => {
                chrono::Duration::from_std(interval.max(Duration::from_secs(1)))
                    .ok()
                    .and_then(|step| after.checked_add_signed(step))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Schedule::Daily { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0)
                    .unwrap_or(NaiveTime::MIN);
                let today = after.date_naive().and_time(time).and_utc();
                if today > after {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
        }
    }
}

type Factory = Box<dyn Fn(InsertOpts) -> Result<NewJob> + Send + Sync>;

/// A job materialized from a schedule.
pub struct PeriodicJob {
    kind: JobKind,
    schedule: Schedule,
    factory: Factory,
    opts: InsertOpts,
    run_on_start: bool,
    non_overlapping: bool,
}

impl PeriodicJob {
    /// Fire `factory()` on `schedule`.
    pub fn new<A, F>(schedule: Schedule, factory: F) -> Self
    where
        A: JobArgs + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self {
            kind: A::KIND,
            schedule,
            factory: Box::new(move |opts| NewJob::from_args(&factory(), opts)),
            opts: InsertOpts::default(),
            run_on_start: false,
            non_overlapping: false,
        }
    }

    /// Insert options applied to every materialized job. `scheduled_at` is ignored.
    pub fn with_opts(mut self, opts: InsertOpts) -> Self {
        self.opts = InsertOpts {
            scheduled_at: None,
            ..opts
        };
        self
    }

    /// Fire immediately when the scheduler starts.
    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.run_on_start = enabled;
        self
    }

    /// Skip a firing while the job this schedule inserted last has not reached
    /// a terminal state. Jobs of the same kind enqueued elsewhere do not count.
    pub fn non_overlapping(mut self, enabled: bool) -> Self {
        self.non_overlapping = enabled;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }
}

struct Entry {
    job: PeriodicJob,
    next_fire: Option<DateTime<Utc>>,
    last_job: Option<Uuid>,
}

/// Inserts periodic jobs as their schedules come due.
pub struct PeriodicScheduler {
    repo: Arc<dyn JobRepository>,
    entries: Vec<Entry>,
}

impl PeriodicScheduler {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            entries: Vec::new(),
        }
    }

    pub fn with_job(mut self, job: PeriodicJob) -> Self {
        self.entries.push(Entry {
            job,
            next_fire: None,
            last_job: None,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest upcoming firing across all entries.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.next_fire).min()
    }

    /// Insert every job due at `now`. Returns the number inserted.
    ///
    /// The first call anchors each schedule: `run_on_start` entries fire at
    /// once, the rest wait for their first `next_after(now)`. Insert failures
    /// are logged and the firing is skipped.
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut inserted = 0;

        for entry in &mut self.entries {
            let due_at = *entry.next_fire.get_or_insert_with(|| {
                if entry.job.run_on_start {
                    now
                } else {
                    entry.job.schedule.next_after(now)
                }
            });
            if due_at > now {
                continue;
            }
            entry.next_fire = Some(entry.job.schedule.next_after(now));

            let kind = entry.job.kind;
            if entry.job.non_overlapping {
                if let Some(prior) = entry.last_job {
                    match self.repo.get(prior).await {
                        Ok(Some(job)) if !job.state.is_terminal() => {
                            debug!(
                                subsystem = "jobs",
                                component = "scheduler",
                                job_kind = %kind,
                                job_id = %prior,
                                state = %job.state,
                                "Previous periodic job still unfinished, skipping firing"
                            );
                            continue;
                        }
                        // Finished, or removed from the store.
                        Ok(_) => {}
                        Err(e) => {
                            error!(
                                subsystem = "jobs",
                                component = "scheduler",
                                job_kind = %kind,
                                job_id = %prior,
                                error = %e,
                                "Failed to look up previous periodic job"
                            );
                            continue;
                        }
                    }
                }
            }

            let result = match (entry.job.factory)(entry.job.opts.clone()) {
                Ok(new_job) => self.repo.insert(new_job).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(job) => {
                    inserted += 1;
                    entry.last_job = Some(job.id);
                    info!(
                        subsystem = "jobs",
                        component = "scheduler",
                        job_id = %job.id,
                        job_kind = %kind,
                        queue = %job.queue,
                        "Periodic job enqueued"
                    );
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "scheduler",
                        job_kind = %kind,
                        error = %e,
                        "Failed to enqueue periodic job"
                    );
                }
            }
        }

        inserted
    }

    /// Run until `shutdown` turns true, sleeping between firings.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                subsystem = "jobs",
                component = "scheduler",
                periodic_jobs = self.entries.len(),
                "Periodic scheduler started"
            );
            loop {
                if *shutdown.borrow() {
                    break;
                }
                self.fire_due(Utc::now()).await;

                let wait = self
                    .next_fire()
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(wait), if self.next_fire().is_some() => {}
                }
            }
            info!(subsystem = "jobs", component = "scheduler", "Periodic scheduler stopped");
        })
    }
}
