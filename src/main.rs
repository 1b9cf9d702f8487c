use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use reviser::config::Backend;
use reviser::generation::{Generator, WhitespaceTokenCounter};
use reviser::hf_inference::HfInferenceClient;
use reviser::manuscript::docx::source_stem;
use reviser::manuscript::DocxStore;
use reviser::ollama::OllamaClient;
use reviser::revise::RevisionEngine;
use reviser::run_log::RunLog;
use reviser::{AppConfig, Reviser};

#[derive(Parser, Debug)]
#[command(name = "reviser")]
#[command(about = "Revise DOCX manuscripts chapter by chapter with an LLM")]
struct Cli {
    /// Manuscripts to revise; defaults to every .docx under the input directory.
    files: Vec<PathBuf>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_lines: Option<usize>,
    #[arg(long)]
    input_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

struct Dirs {
    output: PathBuf,
    logs: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(backend) = cli.backend {
        config.models.backend = backend;
    }
    if let Some(model) = cli.model {
        config.models.model = model;
    }
    if let Some(max_lines) = cli.max_lines {
        config.revision.max_lines = max_lines;
    }
    let dirs = Dirs {
        output: cli.output_dir.unwrap_or_else(|| config.output_dir()),
        logs: cli.log_dir.unwrap_or_else(|| config.log_dir()),
    };

    let inputs = if cli.files.is_empty() {
        let input_dir = cli.input_dir.unwrap_or_else(|| config.input_dir());
        find_manuscripts(&input_dir)?
    } else {
        cli.files
    };
    if inputs.is_empty() {
        anyhow::bail!("no manuscripts to revise");
    }

    let timeout = Duration::from_secs(config.models.request_timeout_secs);
    match config.models.backend {
        Backend::Ollama => {
            let client = OllamaClient::new(
                config.models.ollama_base_url.clone(),
                config.models.model.clone(),
                config.models.batch_size,
                timeout,
            )?;
            run_all(client, &config, &dirs, &inputs).await
        }
        Backend::Hf => {
            let client = HfInferenceClient::new(
                config.models.hf_inference_url.clone(),
                config.models.hf_api_token.clone(),
                timeout,
            )?;
            run_all(client, &config, &dirs, &inputs).await
        }
    }
}

async fn run_all<G: Generator>(
    generator: G,
    config: &AppConfig,
    dirs: &Dirs,
    inputs: &[PathBuf],
) -> Result<()> {
    let engine = RevisionEngine::new(generator, WhitespaceTokenCounter, config.revision.clone());
    let reviser = Reviser::new(engine);

    let mut failed = 0usize;
    for input in inputs {
        match revise_one(&reviser, input, dirs).await {
            Ok(log_path) => println!("Log written to {}", log_path.display()),
            Err(err) => {
                failed += 1;
                let reason = format!("{err:#}");
                tracing::error!(input = %input.display(), error = %reason, "manuscript failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} manuscripts failed", inputs.len());
    }
    Ok(())
}

async fn revise_one<G: Generator>(
    reviser: &Reviser<G, WhitespaceTokenCounter>,
    input: &Path,
    dirs: &Dirs,
) -> Result<PathBuf> {
    let store = DocxStore::with_output_dir(input, &dirs.output);
    let (mut log, log_path) = RunLog::create(&dirs.logs, &source_stem(input))?;
    log.record_source_digest(&file_sha256(input).await?)?;

    let report = reviser.revise_document(&store, log).await?;
    println!(
        "Revised {} -> {} chapters={} blocks={} try1={} try2={} kept={}",
        input.display(),
        report.output.display(),
        report.summary.chapters,
        report.summary.blocks,
        report.summary.first_try,
        report.summary.second_try,
        report.summary.kept_original,
    );
    Ok(log_path)
}

fn find_manuscripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        let path = entry.path();
        let is_docx = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("docx"))
            .unwrap_or(false);
        let is_lock_file = entry.file_name().to_string_lossy().starts_with("~$");
        if entry.file_type().is_file() && is_docx && !is_lock_file {
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading file for hash: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
