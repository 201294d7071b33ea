//! Batch transform orchestration.
//!
//! A full run clears every prior output and reprocesses each directory tree
//! and each archive as one pooled job. An incremental run keeps prior
//! outputs: directory trees are mirrored (copying only what is missing) and
//! each reported loose-file change is handled inline, while changed
//! archives are rewritten on the pool. Any failed job fails the run with an
//! aggregate of every failure, after all jobs have completed.

use serde::Serialize;
use std::fs;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::archive::{ensure_parent, process_archive};
use crate::batch::{BatchRun, Completion, ContentKind, JobOutcome, JobState};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::filter::is_instrumentable;
use crate::inputs::{
    ArchiveInput, ContentFormat, DirectoryInput, OutputProvider, Status, TransformInputs,
};
use crate::instrument::{ClassTransform, MethodTimer};
use crate::scan::{mirror_path, scan_files};

pub use crate::batch::TransformJob;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    pub incremental: bool,
    pub enabled: bool,
    pub threads: usize,
    pub jobs: usize,
    pub written: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub units_instrumented: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<JobOutcome>,
}

impl TransformReport {
    fn tally(&mut self, outcomes: Vec<JobOutcome>) {
        self.jobs = outcomes.len();
        for o in &outcomes {
            match o.state {
                JobState::Written => self.written += 1,
                JobState::Deleted => self.deleted += 1,
                JobState::Skipped => self.skipped += 1,
                JobState::Failed => self.failed += 1,
            }
            self.units_instrumented += o.instrumented;
        }
        self.outcomes = outcomes;
    }
}

/// What one run actually does once configuration and inputs are combined.
#[derive(Debug, Clone, Copy)]
struct RunFlags {
    enabled: bool,
    incremental: bool,
}

/// Entry point for a build driver.
pub struct Transformer {
    config: EngineConfig,
    class_transform: Arc<dyn ClassTransform>,
}

impl Transformer {
    pub fn new(config: EngineConfig) -> Self {
        let timer = MethodTimer::from_config(&config);
        Self::with_class_transform(config, Arc::new(timer))
    }

    pub fn with_class_transform(
        config: EngineConfig,
        class_transform: Arc<dyn ClassTransform>,
    ) -> Self {
        Self {
            config,
            class_transform,
        }
    }

    pub fn supports_incremental(&self) -> bool {
        self.config.enable_incremental
    }

    pub fn transform(
        &self,
        inputs: &TransformInputs,
        output: &dyn OutputProvider,
    ) -> Result<TransformReport, EngineError> {
        let start = Instant::now();
        let flags = RunFlags {
            enabled: self.config.enabled,
            incremental: inputs.incremental && self.supports_incremental(),
        };
        info!(
            incremental = flags.incremental,
            enabled = flags.enabled,
            directories = inputs.directories.len(),
            archives = inputs.archives.len(),
            "transform start"
        );

        let (dir_dests, archive_dests) = output_locations(inputs, output)?;
        if !flags.incremental {
            output.delete_all()?;
        }

        let mut run = BatchRun::new(self.config.worker_threads())?;
        let transform = flags.enabled.then(|| self.class_transform.clone());

        for (dir, dest) in inputs.directories.iter().zip(dir_dests) {
            if flags.incremental {
                incremental_directory(&mut run, dir, &dest, transform.as_deref());
            } else {
                let job = run.job(dir.root.clone(), dest, ContentKind::Directory, Status::Added);
                let transform = transform.clone();
                run.submit(job, move |job| {
                    process_directory(&job.source, &job.destination, transform.as_deref())
                });
            }
        }

        for (archive, dest) in inputs.archives.iter().zip(archive_dests) {
            if flags.incremental {
                incremental_archive(&mut run, archive, &dest, &transform);
            } else {
                let job = run.job(archive.file.clone(), dest, ContentKind::Archive, Status::Added);
                let transform = transform.clone();
                run.submit(job, move |job| {
                    archive_job(&job.source, &job.destination, transform.as_deref())
                });
            }
        }

        let threads = run.threads();
        let outcomes = run.finish();

        let mut report = TransformReport {
            incremental: flags.incremental,
            enabled: flags.enabled,
            threads,
            ..Default::default()
        };
        report.tally(outcomes);
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            jobs = report.jobs,
            written = report.written,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            units_instrumented = report.units_instrumented,
            duration_ms = report.duration_ms,
            "transform finished"
        );

        let failures: Vec<_> = report
            .outcomes
            .iter()
            .flat_map(|o| o.failures.iter().cloned())
            .collect();
        if !failures.is_empty() {
            return Err(EngineError::Aggregate(failures));
        }
        Ok(report)
    }
}

/// Output location of every directory and every archive input. Fails when
/// two inputs would write to the same place.
fn output_locations(
    inputs: &TransformInputs,
    output: &dyn OutputProvider,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), EngineError> {
    let dirs: Vec<PathBuf> = inputs
        .directories
        .iter()
        .map(|d| output.content_location(&d.name, ContentFormat::Directory))
        .collect();
    let archives: Vec<PathBuf> = inputs
        .archives
        .iter()
        .map(|a| output.content_location(&a.name, ContentFormat::Archive))
        .collect();

    let names = inputs
        .directories
        .iter()
        .map(|d| &d.name)
        .chain(inputs.archives.iter().map(|a| &a.name));
    let mut seen: HashMap<&Path, &String> = HashMap::new();
    for (name, location) in names.zip(dirs.iter().chain(&archives)) {
        if let Some(first) = seen.insert(location.as_path(), name) {
            return Err(EngineError::OutputCollision {
                first: first.clone(),
                second: name.clone(),
                location: location.clone(),
            });
        }
    }
    Ok((dirs, archives))
}

fn incremental_directory(
    run: &mut BatchRun,
    dir: &DirectoryInput,
    dest: &Path,
    transform: Option<&dyn ClassTransform>,
) {
    let mirror = run.job(
        dir.root.clone(),
        dest.to_path_buf(),
        ContentKind::Directory,
        Status::Unchanged,
    );
    run.run_inline(mirror, |job| mirror_missing(&job.source, &job.destination));

    for change in &dir.changed_files {
        let source = if change.path.is_absolute() {
            change.path.clone()
        } else {
            dir.root.join(&change.path)
        };
        let target = mirror_path(&dir.root, dest, &change.path);
        let job = run.job(
            source,
            target.clone().unwrap_or_default(),
            ContentKind::LooseFile,
            change.status,
        );
        let root = &dir.root;
        run.run_inline(job, |job| {
            if target.is_none() {
                return Err(EngineError::io(
                    &job.source,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("changed file is not below {}", root.display()),
                    ),
                ));
            }
            match job.status {
                Status::Added | Status::Changed => {
                    process_file(&job.source, &job.destination, transform).map(|changed| {
                        Completion::written(changed as usize)
                    })
                }
                Status::Removed => delete_output(&job.destination),
                Status::Unchanged => Ok(Completion::new(JobState::Skipped)),
            }
        });
    }
}

fn incremental_archive(
    run: &mut BatchRun,
    archive: &ArchiveInput,
    dest: &Path,
    transform: &Option<Arc<dyn ClassTransform>>,
) {
    let job = run.job(
        archive.file.clone(),
        dest.to_path_buf(),
        ContentKind::Archive,
        archive.status,
    );
    match archive.status {
        Status::Added | Status::Changed => {
            let transform = transform.clone();
            run.submit(job, move |job| {
                archive_job(&job.source, &job.destination, transform.as_deref())
            });
        }
        Status::Removed => run.run_inline(job, |job| delete_output(&job.destination)),
        Status::Unchanged => run.run_inline(job, |job| {
            if job.destination.exists() {
                return Ok(Completion::new(JobState::Skipped));
            }
            copy_file(&job.source, &job.destination)?;
            Ok(Completion::written(0))
        }),
    }
}

/// Writes every file under `root` to the same relative path under `dest`,
/// instrumenting candidates. A failing file does not stop the walk; the
/// failures are returned together.
pub fn process_directory(
    root: &Path,
    dest: &Path,
    transform: Option<&dyn ClassTransform>,
) -> Result<Completion, EngineError> {
    if !root.is_dir() {
        return Ok(Completion::new(JobState::Skipped));
    }
    fs::create_dir_all(dest).map_err(|e| EngineError::io(dest, e))?;

    let mut instrumented = 0;
    let mut failures = Vec::new();
    for file in scan_files(root)? {
        let Some(target) = mirror_path(root, dest, &file) else {
            continue;
        };
        match process_file(&file, &target, transform) {
            Ok(true) => instrumented += 1,
            Ok(false) => {}
            Err(e) => failures.extend(e.into_failures(&file)),
        }
    }

    if failures.is_empty() {
        Ok(Completion::written(instrumented))
    } else {
        Err(EngineError::Aggregate(failures))
    }
}

/// Copies `source` to `target`, instrumenting it on the way when it is a
/// candidate class file. Returns whether the unit was rewritten. Nothing is
/// written for a unit that fails.
pub fn process_file(
    source: &Path,
    target: &Path,
    transform: Option<&dyn ClassTransform>,
) -> Result<bool, EngineError> {
    let name = source.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(transform) = transform.filter(|_| is_instrumentable(name)) else {
        copy_file(source, target)?;
        return Ok(false);
    };

    let bytes = fs::read(source).map_err(|e| EngineError::io(source, e))?;
    let rewritten = transform
        .transform_class(&bytes)
        .map_err(|e| EngineError::instrumentation(source, e))?;
    let changed = rewritten.is_some();
    ensure_parent(target)?;
    fs::write(target, rewritten.as_deref().unwrap_or(&bytes[..]))
        .map_err(|e| EngineError::io(target, e))?;
    Ok(changed)
}

fn archive_job(
    source: &Path,
    dest: &Path,
    transform: Option<&dyn ClassTransform>,
) -> Result<Completion, EngineError> {
    match transform {
        Some(transform) => {
            let stats = process_archive(source, dest, is_instrumentable, transform)?;
            Ok(Completion::written(stats.instrumented))
        }
        None => {
            copy_file(source, dest)?;
            Ok(Completion::written(0))
        }
    }
}

/// Copies files under `root` that do not exist under `dest` yet.
fn mirror_missing(root: &Path, dest: &Path) -> Result<Completion, EngineError> {
    if !root.is_dir() {
        return Ok(Completion::new(JobState::Skipped));
    }
    fs::create_dir_all(dest).map_err(|e| EngineError::io(dest, e))?;
    for file in scan_files(root)? {
        if let Some(target) = mirror_path(root, dest, &file) {
            if !target.exists() {
                copy_file(&file, &target)?;
            }
        }
    }
    Ok(Completion::written(0))
}

fn delete_output(path: &Path) -> Result<Completion, EngineError> {
    if path.is_dir() {
        fs::remove_dir_all(path).map_err(|e| EngineError::io(path, e))?;
    } else if path.exists() {
        fs::remove_file(path).map_err(|e| EngineError::io(path, e))?;
    } else {
        return Ok(Completion::new(JobState::Skipped));
    }
    Ok(Completion::new(JobState::Deleted))
}

fn copy_file(source: &Path, target: &Path) -> Result<(), EngineError> {
    ensure_parent(target)?;
    fs::copy(source, target).map_err(|e| EngineError::io(source, e))?;
    Ok(())
}
