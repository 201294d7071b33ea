use anyhow::{Context, Result};
use clap::Parser;
use perspective_eye::archive::process_archive;
use perspective_eye::classfile;
use perspective_eye::cli::{Cli, Commands};
use perspective_eye::config::EngineConfig;
use perspective_eye::filter::is_instrumentable;
use perspective_eye::inputs::Manifest;
use perspective_eye::instrument::{ClassTransform, MethodTimer};
use perspective_eye::transform::Transformer;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EngineConfig::resolve(&cli.engine.overrides())?;

    match cli.command.clone() {
        Commands::Transform { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            let transformer = Transformer::new(config);
            let report = transformer
                .transform(&manifest.inputs, &manifest.output_provider())
                .context("Transform failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Instrument { class_file, output } => {
            let output = output.unwrap_or_else(|| class_file.clone());
            let result = instrument_file(&config, &class_file, &output)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Rewrite { archive, output } => {
            let result = rewrite_file(&config, &archive, &output)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Inspect { class_file } => {
            let bytes = std::fs::read(&class_file)
                .with_context(|| format!("Failed to read class file: {}", class_file.display()))?;
            let unit = classfile::decode(&bytes)
                .with_context(|| format!("Failed to decode {}", class_file.display()))?;
            println!("{}", serde_json::to_string_pretty(&unit.summary())?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct InstrumentResult {
    class_file: PathBuf,
    output: PathBuf,
    instrumented: bool,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct RewriteResult {
    archive: PathBuf,
    output: PathBuf,
    entries: usize,
    instrumented: usize,
    duration_ms: u64,
}

fn instrument_file(
    config: &EngineConfig,
    class_file: &Path,
    output: &Path,
) -> Result<InstrumentResult> {
    let start = Instant::now();
    let bytes = std::fs::read(class_file)
        .with_context(|| format!("Failed to read class file: {}", class_file.display()))?;

    let rewritten = if config.enabled {
        MethodTimer::from_config(config)
            .transform_class(&bytes)
            .with_context(|| format!("Failed to instrument {}", class_file.display()))?
    } else {
        None
    };
    let instrumented = rewritten.is_some();

    write_output(output, rewritten.as_deref().unwrap_or(&bytes[..]))?;
    Ok(InstrumentResult {
        class_file: class_file.to_path_buf(),
        output: output.to_path_buf(),
        instrumented,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn rewrite_file(config: &EngineConfig, archive: &Path, output: &Path) -> Result<RewriteResult> {
    let start = Instant::now();
    let (entries, instrumented) = if config.enabled {
        let timer = MethodTimer::from_config(config);
        let stats = process_archive(archive, output, is_instrumentable, &timer)
            .with_context(|| format!("Failed to rewrite {}", archive.display()))?;
        (stats.entries, stats.instrumented)
    } else {
        let bytes = std::fs::read(archive)
            .with_context(|| format!("Failed to read archive: {}", archive.display()))?;
        write_output(output, &bytes)?;
        (0, 0)
    };

    Ok(RewriteResult {
        archive: archive.to_path_buf(),
        output: output.to_path_buf(),
        entries,
        instrumented,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn write_output(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write output: {}", path.display()))?;
    Ok(())
}
