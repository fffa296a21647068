//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::Overrides;
use anyhow::Context;
use moleval_core::checkpoint::{filter_models, find_checkpoint};
use moleval_core::config::workspace_config_path;
use moleval_core::python::{PythonBackend, PythonRuntime};
use moleval_core::{
    ArtifactStore, BatchReport, CheckpointId, DriverSettings, EvalError, EvalOutcome,
    EvaluationDriver, FailurePolicy, MetricsTable, MolevalConfig, ReferenceDataset,
    discover_checkpoints, load_config,
};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Discover => handle_discover(&resolve_config(workspace, overrides)?),
        Commands::Evaluate {
            model,
            checkpoint,
            overwrite,
        } => {
            let config = resolve_config(workspace, overrides)?;
            handle_evaluate(&config, workspace, CheckpointId::new(model, checkpoint), overwrite)
                .await
        }
        Commands::Run {
            model,
            continue_on_error,
        } => {
            let mut config = resolve_config(workspace, overrides)?;
            if continue_on_error {
                config.failure_policy = FailurePolicy::Continue;
            }
            handle_run(&config, workspace, &model).await
        }
        Commands::Summary { csv } => {
            handle_summary(&resolve_config(workspace, overrides)?, csv.as_deref())
        }
        Commands::Config { action } => handle_config(action, workspace, overrides),
        Commands::Doctor => handle_doctor(&resolve_config(workspace, overrides)?, workspace).await,
    }
}

/// Merge every config layer, apply command-line overrides and resolve
/// relative paths against the workspace.
pub(crate) fn resolve_config(
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<MolevalConfig> {
    let mut config = load_config(Some(workspace), overrides.config.as_deref())
        .map_err(EvalError::from)
        .context("Failed to load configuration")?;
    apply_overrides(&mut config, overrides);
    config.resolve_paths(workspace);
    Ok(config)
}

fn apply_overrides(config: &mut MolevalConfig, overrides: &Overrides) {
    if let Some(device) = overrides.device {
        config.device = device;
    }
    if let Some(jobs) = overrides.jobs {
        config.n_jobs = jobs;
    }
}

fn handle_discover(config: &MolevalConfig) -> anyhow::Result<()> {
    let root = &config.paths.checkpoints_dir;
    let checkpoints = discover_checkpoints(root)
        .with_context(|| format!("Failed to scan '{}'", root.display()))?;
    if checkpoints.is_empty() {
        println!("No checkpoints found under {}", root.display());
        return Ok(());
    }

    let store = ArtifactStore::new(&config.paths.metrics_dir);
    let mut pending = 0;
    for checkpoint in &checkpoints {
        let status = if store.exists(&checkpoint.id) {
            "done"
        } else {
            pending += 1;
            "pending"
        };
        println!(
            "  {:<20} {:>8}  {:<8} {}",
            checkpoint.id.model_name,
            checkpoint.id.index,
            status,
            checkpoint.path.display()
        );
    }
    println!("\n{} checkpoint(s), {} pending", checkpoints.len(), pending);
    Ok(())
}

fn build_driver(
    config: &MolevalConfig,
    workspace: &Path,
) -> anyhow::Result<(EvaluationDriver, PythonBackend)> {
    let reference =
        ReferenceDataset::load(&config.dataset).context("Failed to load reference dataset")?;
    let backend = PythonBackend::new(&config.python, workspace);
    let driver = EvaluationDriver::new(
        DriverSettings::from_config(config),
        Arc::new(reference),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        ArtifactStore::new(&config.paths.metrics_dir),
    );
    Ok((driver, backend))
}

/// Run `work` against the backend, stopping the worker afterwards. Ctrl-C
/// drops the work and kills the worker so nothing stays on the device.
async fn with_backend<T>(
    backend: &PythonBackend,
    work: impl Future<Output = T>,
) -> anyhow::Result<T> {
    tokio::select! {
        out = work => {
            if let Err(e) = backend.shutdown().await {
                warn!(error = %e, "Python worker did not shut down cleanly");
            }
            Ok(out)
        }
        _ = tokio::signal::ctrl_c() => {
            backend.kill().await;
            anyhow::bail!("Interrupted")
        }
    }
}

async fn handle_evaluate(
    config: &MolevalConfig,
    workspace: &Path,
    id: CheckpointId,
    overwrite: bool,
) -> anyhow::Result<()> {
    let checkpoint = find_checkpoint(&config.paths.checkpoints_dir, &id)?;
    let (driver, backend) = build_driver(config, workspace)?;

    let outcome = with_backend(&backend, driver.evaluate(&checkpoint, overwrite))
        .await?
        .with_context(|| format!("Evaluation of {id} failed"))?;

    match outcome {
        EvalOutcome::Evaluated {
            path,
            sample_size,
            duration,
        } => println!(
            "Evaluated {id} ({sample_size} molecules, {:.1}s) -> {}",
            duration.as_secs_f64(),
            path.display()
        ),
        EvalOutcome::AlreadyExists { path } => println!(
            "Metrics for {id} already exist at {} (use --overwrite to replace)",
            path.display()
        ),
    }
    Ok(())
}

async fn handle_run(
    config: &MolevalConfig,
    workspace: &Path,
    models: &[String],
) -> anyhow::Result<()> {
    let root = &config.paths.checkpoints_dir;
    let checkpoints = filter_models(
        discover_checkpoints(root)
            .with_context(|| format!("Failed to scan '{}'", root.display()))?,
        models,
    );
    if checkpoints.is_empty() {
        println!("No checkpoints to evaluate under {}", root.display());
        return Ok(());
    }

    let (driver, backend) = build_driver(config, workspace)?;
    let report = with_backend(&backend, driver.run_batch(&checkpoints))
        .await?
        .context("Batch evaluation aborted")?;

    print_report(&report);
    if !report.failures.is_empty() {
        anyhow::bail!("{} checkpoint(s) failed", report.failures.len());
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!(
        "\nEvaluated: {}  Skipped: {}  Failed: {}",
        report.evaluated.len(),
        report.skipped.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.id, failure.error);
    }
}

fn handle_summary(config: &MolevalConfig, csv: Option<&Path>) -> anyhow::Result<()> {
    let store = ArtifactStore::new(&config.paths.metrics_dir);
    let artifacts = store.list().context("Failed to read metrics artifacts")?;
    let table = MetricsTable::from_artifacts(&artifacts);
    if table.is_empty() {
        println!("No metrics under {}", store.root().display());
        return Ok(());
    }

    print!("{}", table.render());
    if let Some(path) = csv {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;
        table.write_csv(file)?;
        println!("\nWrote {}", path.display());
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&config_path, MolevalConfig::default().to_toml_string()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = resolve_config(workspace, overrides)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn handle_doctor(config: &MolevalConfig, workspace: &Path) -> anyhow::Result<()> {
    let runtime = PythonRuntime::from_config(&config.python, workspace);
    let info = match runtime.detect().await {
        Ok(info) => info,
        Err(e) => {
            println!("  ✗ Python: {e}");
            anyhow::bail!("No usable Python interpreter");
        }
    };
    println!("  ✓ {} ({})", info.version, info.path.display());
    if let Some(venv) = &info.venv_path {
        println!("    venv: {}", venv.display());
    }

    let packages = runtime.check_packages(&config.python.required_packages).await;
    let missing: Vec<&String> = packages
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(name, _)| name)
        .collect();
    for (name, ok) in &packages {
        println!("  {} {name}", if *ok { "✓" } else { "✗" });
    }

    for (label, path) in [
        ("checkpoints", &config.paths.checkpoints_dir),
        ("test set", &config.dataset.test),
        ("train set", &config.dataset.train),
    ] {
        let mark = if path.exists() { "✓" } else { "✗" };
        println!("  {mark} {label}: {}", path.display());
    }

    if !missing.is_empty() {
        anyhow::bail!(
            "Missing Python packages: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}
