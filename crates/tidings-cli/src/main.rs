use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tidings_client::{FsArticleWriter, HtmdConverter, SessionConfig, SessionPool};
use tidings_core::{
    BatchReport, ContentPipeline, EngineConfig, NullMediaProcessor, Services, SourceFactory,
    SourceRegistry, TracingBatchReporter,
};

#[derive(Parser)]
#[command(name = "tidings", version, about = "Polite, failure-tolerant news fetcher")]
struct Cli {
    /// Directory of JSON source definitions
    #[arg(long, global = true, env = "TIDINGS_SOURCES_DIR", default_value = "sources")]
    sources_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BatchArgs {
    /// Source ids to run (repeatable). Defaults to every enabled source.
    #[arg(short, long = "source")]
    sources: Vec<String>,

    /// Articles to discover per source
    #[arg(short, long, default_value_t = 10)]
    count: usize,

    /// Sources processed at once
    #[arg(short, long, env = "TIDINGS_MAX_PARALLEL")]
    parallel: Option<usize>,

    /// Print circuit breaker, rate limiter and timeout stats afterwards
    #[arg(long, default_value_t = false)]
    stats: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List every discovered source and any registration problems
    Sources,

    /// Check source definitions and report problems per source
    Validate,

    /// Discover articles from sources
    Discover {
        #[command(flatten)]
        batch: BatchArgs,

        /// Print the full report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Discover articles, then fetch, convert and write them
    Fetch {
        #[command(flatten)]
        batch: BatchArgs,

        /// Output root; articles land in <output>/<source>/<index>
        #[arg(short, long, default_value = "output")]
        output: PathBuf,

        /// Concurrent conversion jobs
        #[arg(short, long, env = "TIDINGS_PROCESSING_WORKERS")]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tidings=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().context("Invalid TIDINGS_* configuration")?;

    match cli.command {
        Commands::Sources => {
            let registry = load_registry(&cli.sources_dir)?;
            cmd_sources(&registry);
        }
        Commands::Validate => {
            let registry = load_registry(&cli.sources_dir)?;
            cmd_validate(&registry)?;
        }
        Commands::Discover { batch, json } => {
            if let Some(parallel) = batch.parallel {
                config.batch.max_parallel = parallel;
            }
            let factory = build_factory(&cli.sources_dir, &config)?;
            let report = run_batch(&factory, &batch, &config, &shutdown_token()).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if batch.stats {
                print_stats(&factory)?;
            }
        }
        Commands::Fetch {
            batch,
            output,
            workers,
        } => {
            if let Some(parallel) = batch.parallel {
                config.batch.max_parallel = parallel;
            }
            if let Some(workers) = workers {
                config.batch.processing_workers = workers;
            }
            let factory = build_factory(&cli.sources_dir, &config)?;
            let cancel = shutdown_token();
            let report = run_batch(&factory, &batch, &config, &cancel).await?;
            cmd_fetch(&factory, &report, &output, &config, &cancel).await;
            if batch.stats {
                print_stats(&factory)?;
            }
        }
    }

    Ok(())
}

/// Cancelled on Ctrl-C. Running sources finish; nothing new starts.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight sources");
            trigger.cancel();
        }
    });
    token
}

/// Built-in sources plus every definition in `dir`.
///
/// A missing directory only costs the declarative sources.
fn load_registry(dir: &Path) -> Result<SourceRegistry<tidings_client::ReqwestTransport>> {
    let mut registry = SourceRegistry::with_builtins();
    if dir.is_dir() {
        registry
            .load_dir(dir)
            .with_context(|| format!("Failed to load sources from {}", dir.display()))?;
    } else {
        tracing::warn!(dir = %dir.display(), "Source directory not found, using built-ins only");
    }
    Ok(registry)
}

fn build_factory(dir: &Path, config: &EngineConfig) -> Result<SourceFactory<SessionPool>> {
    let registry = load_registry(dir)?;
    let sessions =
        SessionPool::new(SessionConfig::default()).context("Failed to create HTTP sessions")?;
    Ok(SourceFactory::new(registry, sessions, Services::new(config)))
}

async fn run_batch(
    factory: &SourceFactory<SessionPool>,
    args: &BatchArgs,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let ids: Vec<String> = if args.sources.is_empty() {
        factory.discover_sources().into_iter().collect()
    } else {
        args.sources.clone()
    };
    if ids.is_empty() {
        bail!("No sources to run. Add definitions to the sources directory or pass --source.");
    }

    Ok(factory
        .batch_discover_with(
            &ids,
            args.count,
            config.batch.max_parallel,
            cancel,
            &TracingBatchReporter,
        )
        .await)
}

fn cmd_sources(registry: &SourceRegistry<tidings_client::ReqwestTransport>) {
    let enabled = registry.discover_sources();
    println!("Sources:\n");
    for descriptor in registry.descriptors() {
        let kind = if registry.is_code_defined(&descriptor.id) {
            "code"
        } else {
            descriptor.discovery_method.as_str()
        };
        let status = if enabled.contains(&descriptor.id) {
            ""
        } else {
            " (disabled)"
        };
        println!(
            "  {:<20} {:<6} {:<12} {}{}",
            descriptor.id, kind, descriptor.category, descriptor.display_name, status
        );
    }
    println!("\nTotal: {} enabled", enabled.len());

    let errors = registry.registration_errors();
    if !errors.is_empty() {
        println!("\nRegistration problems:");
        for (key, messages) in errors {
            for message in messages {
                println!("  {key}: {message}");
            }
        }
    }
}

fn cmd_validate(registry: &SourceRegistry<tidings_client::ReqwestTransport>) -> Result<()> {
    let report = registry.validate_sources();
    let mut invalid = 0;
    for (id, problems) in &report {
        if problems.is_empty() {
            println!("  [ok]    {id}");
            continue;
        }
        invalid += 1;
        println!("  [error] {id}");
        for problem in problems {
            println!("          - {problem}");
        }
    }

    // Files that never produced a descriptor
    for (file, messages) in registry.registration_errors() {
        if report.contains_key(&file) {
            continue;
        }
        invalid += 1;
        for message in messages {
            println!("  [error] {file}: {message}");
        }
    }

    if invalid > 0 {
        bail!("{invalid} source definition(s) failed validation");
    }
    Ok(())
}

async fn cmd_fetch(
    factory: &SourceFactory<SessionPool>,
    report: &BatchReport,
    output: &Path,
    config: &EngineConfig,
    cancel: &CancellationToken,
) {
    let pipeline = ContentPipeline::new(
        HtmdConverter::new(),
        NullMediaProcessor,
        FsArticleWriter::new(),
        output,
        &config.batch,
    );
    let results = pipeline.run(factory, report, cancel).await;

    for result in &results {
        match result.outcome.as_completed() {
            Some(path) => println!("  [written] {}", path.display()),
            None => {
                let reason = result
                    .outcome
                    .skipped()
                    .map(|r| r.reason.as_str())
                    .unwrap_or_default();
                println!("  [skipped] {} ({reason})", result.url);
            }
        }
    }
    let written = results.iter().filter(|r| r.outcome.is_completed()).count();
    println!("\nWrote {written} of {} article(s) to {}", results.len(), output.display());
    print_skips(factory);
}

fn print_report(report: &BatchReport) {
    println!("Batch {}:\n", report.run_id);
    for (id, articles) in report.articles() {
        println!("{id} ({} article(s))", articles.len());
        for article in &articles {
            println!("  - {} <{}>", article.title, article.url);
        }
    }

    let skips = report.skip_report();
    if !skips.is_empty() {
        println!("\nSkipped:");
        for records in skips.values() {
            for record in records {
                println!(
                    "  {} [{}] after {} attempt(s): {}",
                    record.source_id, record.error_kind, record.attempts_made, record.reason
                );
            }
        }
    }
    println!("\n{}", report.summary());
}

fn print_skips(factory: &SourceFactory<SessionPool>) {
    let summary = factory.services().skips.summary();
    println!("{summary}");
}

fn print_stats(factory: &SourceFactory<SessionPool>) -> Result<()> {
    let stats = serde_json::json!({
        "circuits": factory.get_all_circuit_stats(),
        "rate_limiters": factory.get_all_rate_limiter_stats(),
        "timeouts": factory.get_all_timeout_stats(),
    });
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
