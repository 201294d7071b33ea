//! One orchestrator invocation: a bounded worker pool and the results of
//! every job submitted to it.
//!
//! Jobs submitted with [`BatchRun::submit`] run on the pool; jobs passed to
//! [`BatchRun::run_inline`] run on the calling thread. Either way a job's
//! outcome is recorded and a failing or panicking job never stops its
//! siblings. [`BatchRun::finish`] is the completion barrier: it waits for
//! every pooled job, then drops the pool.

use rayon::ThreadPool;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, JobFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// A whole directory tree.
    Directory,
    /// A single file below a directory root.
    LooseFile,
    Archive,
}

/// Change status reported by the build driver for an input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Added,
    Changed,
    Removed,
    #[default]
    #[serde(alias = "not_changed")]
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformJob {
    pub id: usize,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: ContentKind,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Written,
    Deleted,
    Skipped,
    Failed,
}

/// What a job reports back when it does not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub state: JobState,
    /// Class units actually rewritten by this job.
    pub instrumented: usize,
}

impl Completion {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            instrumented: 0,
        }
    }

    pub fn written(instrumented: usize) -> Self {
        Self {
            state: JobState::Written,
            instrumented,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job: TransformJob,
    pub state: JobState,
    pub instrumented: usize,
    pub duration_ms: u64,
    #[serde(skip)]
    pub failures: Vec<JobFailure>,
}

pub struct BatchRun {
    pool: ThreadPool,
    tx: Sender<JobOutcome>,
    rx: Receiver<JobOutcome>,
    next_id: usize,
    submitted: usize,
    inline: Vec<JobOutcome>,
}

impl BatchRun {
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("perspective-eye-{i}"))
            .build()?;
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            pool,
            tx,
            rx,
            next_id: 0,
            submitted: 0,
            inline: Vec::new(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn job(
        &mut self,
        source: PathBuf,
        destination: PathBuf,
        kind: ContentKind,
        status: Status,
    ) -> TransformJob {
        let id = self.next_id;
        self.next_id += 1;
        TransformJob {
            id,
            source,
            destination,
            kind,
            status,
        }
    }

    /// Queues `work` on the pool.
    pub fn submit<F>(&mut self, job: TransformJob, work: F)
    where
        F: FnOnce(&TransformJob) -> Result<Completion, EngineError> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.submitted += 1;
        self.pool.spawn(move || {
            let outcome = execute(job, work);
            let _ = tx.send(outcome);
        });
    }

    /// Runs `work` now, on the calling thread.
    pub fn run_inline<F>(&mut self, job: TransformJob, work: F)
    where
        F: FnOnce(&TransformJob) -> Result<Completion, EngineError>,
    {
        let outcome = execute(job, work);
        self.inline.push(outcome);
    }

    /// Waits for every submitted job and tears the pool down. Outcomes come
    /// back in job creation order.
    pub fn finish(self) -> Vec<JobOutcome> {
        let BatchRun {
            pool,
            tx,
            rx,
            submitted,
            mut inline,
            ..
        } = self;
        drop(tx);

        let mut outcomes: Vec<JobOutcome> = rx.iter().collect();
        if outcomes.len() != submitted {
            warn!(
                expected = submitted,
                received = outcomes.len(),
                "worker pool lost job results"
            );
        }
        drop(pool);

        outcomes.append(&mut inline);
        outcomes.sort_by_key(|o| o.job.id);
        outcomes
    }
}

fn execute<F>(job: TransformJob, work: F) -> JobOutcome
where
    F: FnOnce(&TransformJob) -> Result<Completion, EngineError>,
{
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| work(&job)));
    let duration_ms = start.elapsed().as_millis() as u64;

    let (state, instrumented, failures) = match result {
        Ok(Ok(done)) => (done.state, done.instrumented, Vec::new()),
        Ok(Err(err)) => (JobState::Failed, 0, err.into_failures(&job.source)),
        Err(payload) => (
            JobState::Failed,
            0,
            vec![JobFailure {
                source: job.source.clone(),
                message: format!("job panicked: {}", panic_message(payload.as_ref())),
            }],
        ),
    };

    if state == JobState::Failed {
        for failure in &failures {
            warn!(job = job.id, "{failure}");
        }
    } else {
        debug!(
            job = job.id,
            source = %job.source.display(),
            ?state,
            instrumented,
            duration_ms,
            "job finished"
        );
    }

    JobOutcome {
        job,
        state,
        instrumented,
        duration_ms,
        failures,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Number of workers when none is configured.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
