use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stampede::cli::config::Options;
use stampede::cli::{cloud, har, Cli, Commands};
use stampede::exec::cancel::cancel_pair;
use stampede::exec::vu::{Runner, Summary};
use stampede::exec::LocalScheduler;
use stampede::js::ScriptRunner;
use stampede::stats::{sample_channel, Aggregator};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STAMPEDE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            script,
            vus,
            duration,
            paused,
            config,
            execution_segment,
            execution_segment_sequence,
            export_json,
        } => run(
            script,
            vus,
            duration,
            paused,
            config,
            execution_segment,
            execution_segment_sequence,
            export_json,
        ),
        Commands::Convert { input, output } => convert(input, output),
        Commands::Login { token, api_url } => login(&token, api_url.as_deref()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    script: PathBuf,
    vus: Option<u64>,
    duration: Option<String>,
    paused: bool,
    config_path: Option<PathBuf>,
    execution_segment: Option<String>,
    execution_segment_sequence: Option<String>,
    export_json: Option<PathBuf>,
) -> Result<()> {
    let runner = Arc::new(ScriptRunner::from_file(&script)?);

    // Script options, then the config file, then CLI flags.
    let mut options = runner.options();
    if let Some(path) = &config_path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let from_file: Options = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        options = options.apply(from_file);
    }
    options = options.apply(Options {
        vus,
        duration,
        paused: paused.then_some(true),
        execution_segment,
        execution_segment_sequence,
        ..Options::default()
    });

    let scheduler = LocalScheduler::new(Arc::clone(&runner) as Arc<dyn Runner>, options)?;

    // Scale the pipeline with the pool so senders only block when the
    // consumer genuinely lags.
    let capacity = (scheduler.state().max_possible_vus() as usize * 10).clamp(1024, 100_000);
    let (samples_tx, samples_rx) = sample_channel(capacity);
    let consumer = std::thread::spawn(move || Aggregator::new().consume(samples_rx));

    let (_global_canceller, global_token) = cancel_pair();
    let (_run_canceller, run_token) = cancel_pair();

    scheduler.init(&run_token, &samples_tx)?;
    let run_result = scheduler.run(&global_token, &run_token, &samples_tx);

    let summary_base = {
        let state = scheduler.state();
        Summary {
            test_run_duration: state.get_current_test_run_duration(),
            full_iterations: state.full_iteration_count(),
            interrupted_iterations: state.interrupted_iteration_count(),
            report: Default::default(),
        }
    };

    // Dropping the scheduler releases the last internal sample senders, which
    // lets the consumer drain out and hang up.
    drop(scheduler);
    drop(samples_tx);
    let aggregator = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("the sample consumer panicked"))?;
    let report = aggregator.to_report();

    let summary = Summary {
        report: report.clone(),
        ..summary_base
    };
    match runner.handle_summary(&global_token, &summary) {
        Ok(artifacts) if !artifacts.is_empty() => {
            for (file, content) in artifacts {
                if file == "stdout" {
                    print!("{content}");
                } else {
                    std::fs::write(&file, content)
                        .with_context(|| format!("could not write {file}"))?;
                }
            }
        }
        Ok(_) => {
            println!();
            print!("{}", report.render());
        }
        Err(err) => {
            tracing::warn!(error = %err, "handleSummary failed, using the default report");
            print!("{}", report.render());
        }
    }

    if let Some(path) = export_json {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("could not write {}", path.display()))?;
    }

    run_result?;
    Ok(())
}

fn convert(input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let script = har::convert_to_script(&input)?;
    match output {
        Some(path) => {
            std::fs::write(&path, script)
                .with_context(|| format!("could not write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => print!("{script}"),
    }
    Ok(())
}

fn login(token: &str, api_url: Option<&str>) -> Result<()> {
    cloud::save_token(token, api_url).context("could not save the token")?;
    println!("Token saved.");
    Ok(())
}
