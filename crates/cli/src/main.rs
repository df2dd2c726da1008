use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use comfybatch_comfyui::client::{ServerEndpoints, DEFAULT_SERVER_ADDRESS};
use comfybatch_core::prompts::PromptFile;
use comfybatch_core::workflow::{JobTemplate, Polarity};
use comfybatch_pipeline::config::DEFAULT_OUTPUT_DIR;
use comfybatch_pipeline::{BatchRunner, RunConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "comfybatch=info";

#[derive(Parser, Debug)]
#[command(name = "comfybatch", version)]
#[command(about = "Render a batch of prompt pairs through a ComfyUI workflow", long_about = None)]
struct Args {
    /// Workflow template in ComfyUI API format.
    #[arg(short, long, env = "COMFYBATCH_WORKFLOW")]
    workflow: PathBuf,

    /// Prompt file: {"prompts": [{"id", "positive", "negative"}]}.
    #[arg(short, long, env = "COMFYBATCH_PROMPTS", default_value = "prompts.json")]
    prompts: PathBuf,

    /// Directory for the generated images.
    #[arg(short, long, env = "COMFYBATCH_OUTPUT", default_value = DEFAULT_OUTPUT_DIR)]
    output: PathBuf,

    /// ComfyUI address, `host:port` or a full http(s) URL.
    #[arg(short, long, env = "COMFYBATCH_SERVER", default_value = DEFAULT_SERVER_ADDRESS)]
    server: String,

    /// Refuse templates without both a positive and a negative encoder.
    #[arg(long, action)]
    strict: bool,

    /// Seconds to wait for each job to finish.
    #[arg(long, value_name = "SECS")]
    job_timeout: Option<u64>,

    /// Write the run summary as JSON to this file.
    #[arg(long, value_name = "PATH")]
    summary: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, action)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let workflow_path = expand_tilde(&args.workflow);
    let prompts_path = expand_tilde(&args.prompts);
    for (label, path) in [("Workflow file", &workflow_path), ("Prompt file", &prompts_path)] {
        if !path.is_file() {
            anyhow::bail!("{label} not found: {}", path.display());
        }
    }

    let config = build_config(&args)?;

    let template = JobTemplate::load(&workflow_path, &config.patcher)
        .with_context(|| format!("Failed to load workflow {}", workflow_path.display()))?;
    let prompts = PromptFile::load(&prompts_path)
        .with_context(|| format!("Failed to load prompts {}", prompts_path.display()))?;

    tracing::info!(
        workflow = %workflow_path.display(),
        prompts = prompts.len(),
        positive_nodes = ?template.node_ids(Polarity::Positive),
        negative_nodes = ?template.node_ids(Polarity::Negative),
        output = %config.output_dir.display(),
        "Inputs loaded",
    );

    let mut runner = BatchRunner::new(template, &config).context("Failed to build HTTP client")?;
    let summary = runner.run(&prompts.prompts).await;

    for failure in &summary.failures {
        tracing::warn!(
            prompt_id = failure.prompt_id,
            kind = %failure.kind,
            "Failed: {}",
            failure.error,
        );
    }
    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        total = summary.total,
        "Done, images saved to {}",
        config.output_dir.display(),
    );

    if let Some(path) = &args.summary {
        summary
            .write_json(path)
            .with_context(|| format!("Failed to write summary {}", path.display()))?;
        tracing::info!(path = %path.display(), "Summary written");
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Environment settings, overridden by the flags that were given.
fn build_config(args: &Args) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig::from_env().context("Invalid configuration in environment")?;
    config.server = ServerEndpoints::from_address(&args.server);
    config.output_dir = expand_tilde(&args.output);
    if args.strict {
        config.patcher.strict = true;
    }
    if let Some(secs) = args.job_timeout {
        config.job_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

/// Replace a leading `~` with the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
