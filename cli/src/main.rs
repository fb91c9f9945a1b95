//! CLI entrypoint for prompt-relay
//!
//! This is the main binary that wires together all layers using
//! dependency injection. Every subcommand runs one side of the relay
//! against its own broker session; `demo` runs all sides in one process.

use anyhow::{Context, Result};
use clap::Parser;
use relay_application::session::redact_url;
use relay_application::{
    AnswerSink, BrokerSession, CancelListener, CancellationRegistry, ConsumerStats, FanOutSink,
    GenerateAnswersUseCase, PublishPromptUseCase, QueueTopology, RelayAnswersUseCase,
};
use relay_domain::PromptId;
use relay_infrastructure::{
    ConfigLoader, FileConfig, FileSinkKind, JsonlAnswerSink, LiveStreamSink, MemoryBroker,
    PlaceholderEngine, connector_for_url,
};
use relay_presentation::{Cli, Command, ConsoleAnswerSink, ConsoleFormatter, SinkArg};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Cancel requests that may arrive before their prompt does
const EARLY_CANCEL_CAPACITY: usize = 256;

/// Per-prompt buffer of the demo's live streams
const DEMO_STREAM_CAPACITY: usize = 16;

const DEMO_URL: &str = "memory://demo";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    if cli.command == Command::Config {
        ConfigLoader::print_config_sources(cli.config.as_ref());
        println!();
    }

    let mut config = load_config(&cli)?;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Command::Publish { text, id } => {
            let id = id.map(PromptId::try_new).transpose()?;
            let session = connect(&config).await?;
            let publisher = PublishPromptUseCase::new(Arc::clone(&session), config.topology());
            let id = publisher.execute(&text, id).await?;
            println!("{}", ConsoleFormatter::format_published(&id));
            close(&session).await;
        }
        Command::Cancel { id } => {
            let id = PromptId::try_new(id)?;
            let session = connect(&config).await?;
            let publisher = PublishPromptUseCase::new(Arc::clone(&session), config.topology());
            publisher.request_cancel(&id).await?;
            println!("{}", ConsoleFormatter::format_cancel_requested(&id));
            close(&session).await;
        }
        Command::Generate {
            fragments,
            delay_ms,
        } => {
            if let Some(count) = fragments {
                config.generator.fragment_count = count;
            }
            if let Some(delay) = delay_ms {
                config.generator.fragment_delay_ms = delay;
            }
            let session = connect(&config).await?;
            let result = run_generator(&session, &config, &shutdown).await;
            close(&session).await;
            let (generated, cancels) = result?;
            eprintln!("{}", ConsoleFormatter::format_stats("generator", &generated));
            eprintln!("{}", ConsoleFormatter::format_stats("cancel listener", &cancels));
        }
        Command::Relay { sink, jsonl } => {
            if let Some(sink) = sink {
                config.relay.sink = match sink {
                    SinkArg::Console => FileSinkKind::Console,
                    SinkArg::Jsonl => FileSinkKind::Jsonl,
                    SinkArg::Both => FileSinkKind::Both,
                };
            }
            if let Some(path) = jsonl {
                config.relay.jsonl_path = path;
            }
            let sink = build_sink(&config)?;
            let session = connect(&config).await?;
            let relay = RelayAnswersUseCase::with_params(
                Arc::clone(&session),
                sink,
                config.topology(),
                config.relay_params(),
            );
            let result = relay.run(&shutdown).await;
            close(&session).await;
            eprintln!("{}", ConsoleFormatter::format_stats("relay", &result?));
        }
        Command::Demo {
            prompts,
            fragments,
            delay_ms,
        } => {
            config.generator.fragment_count = fragments;
            config.generator.fragment_delay_ms = delay_ms;
            run_demo(&config, prompts, &shutdown).await?;
        }
        Command::Config => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // RUST_LOG wins over -v
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        },
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("could not create {}", directory.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<FileConfig> {
    let config = if cli.no_config {
        ConfigLoader::load_defaults()
    } else {
        ConfigLoader::load(cli.config.as_ref()).context("failed to load configuration")?
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn connect(config: &FileConfig) -> Result<Arc<BrokerSession>> {
    let url = &config.broker.url;
    let connector = connector_for_url(url, config.broker.publisher_confirms)?;
    let session = BrokerSession::connect(connector.as_ref(), url)
        .await
        .with_context(|| format!("could not connect to {}", redact_url(url)))?;
    config
        .topology()
        .declare_on(&session)
        .await
        .context("could not declare queues")?;
    Ok(Arc::new(session))
}

async fn close(session: &BrokerSession) {
    if let Err(e) = session.shutdown().await {
        warn!("Broker session did not close cleanly: {}", e);
    }
}

fn placeholder_engine(config: &FileConfig) -> Arc<PlaceholderEngine> {
    Arc::new(PlaceholderEngine::new(
        config.generator.fragment_count,
        config.fragment_delay(),
    ))
}

/// Run the generator and its cancel listener until shutdown.
async fn run_generator(
    session: &Arc<BrokerSession>,
    config: &FileConfig,
    shutdown: &CancellationToken,
) -> Result<(ConsumerStats, ConsumerStats)> {
    let topology = config.topology();
    let registry = Arc::new(CancellationRegistry::new(EARLY_CANCEL_CAPACITY));
    let engine = placeholder_engine(config);
    let generator = GenerateAnswersUseCase::new(Arc::clone(session), engine, topology.clone())
        .with_params(config.generator_params())
        .with_cancellations(Arc::clone(&registry));
    let listener = CancelListener::new(Arc::clone(session), registry, topology)
        .with_params(config.cancel_params());

    let stats = tokio::try_join!(generator.run(shutdown), listener.run(shutdown))?;
    Ok(stats)
}

fn build_sink(config: &FileConfig) -> Result<Arc<dyn AnswerSink>> {
    let mut sinks: Vec<Arc<dyn AnswerSink>> = Vec::new();
    if config.relay.sink.uses_console() {
        sinks.push(Arc::new(ConsoleAnswerSink::stdout()));
    }
    if config.relay.sink.uses_jsonl() {
        let path = &config.relay.jsonl_path;
        let sink = JsonlAnswerSink::open(path)
            .with_context(|| format!("could not open answer log {}", path.display()))?;
        info!("Appending answers to {}", sink.path().display());
        sinks.push(Arc::new(sink));
    }

    if sinks.len() == 1 {
        Ok(sinks.remove(0))
    } else {
        Ok(Arc::new(FanOutSink::new(sinks)))
    }
}

async fn demo_session(
    broker: &MemoryBroker,
    topology: &QueueTopology,
) -> Result<Arc<BrokerSession>> {
    let session = BrokerSession::connect(broker, DEMO_URL).await?;
    topology.declare_on(&session).await?;
    Ok(Arc::new(session))
}

/// Publisher, generator and relay in one process over a shared in-memory
/// broker. Each prompt's answer is printed as it streams in.
async fn run_demo(
    config: &FileConfig,
    prompts: Vec<String>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let broker = MemoryBroker::new();
    let topology = config.topology();
    let generator_session = demo_session(&broker, &topology).await?;
    let relay_session = demo_session(&broker, &topology).await?;
    let publisher_session = demo_session(&broker, &topology).await?;

    println!("{}", ConsoleFormatter::header("prompt-relay demo"));

    let workers = shutdown.child_token();
    let generator_task = {
        let session = Arc::clone(&generator_session);
        let config = config.clone();
        let workers = workers.clone();
        tokio::spawn(async move { run_generator(&session, &config, &workers).await })
    };

    let sink = Arc::new(LiveStreamSink::new(DEMO_STREAM_CAPACITY));
    let relay_task = {
        let relay = RelayAnswersUseCase::with_params(
            Arc::clone(&relay_session),
            sink.clone(),
            topology.clone(),
            config.relay_params(),
        );
        let workers = workers.clone();
        tokio::spawn(async move { relay.run(&workers).await })
    };

    let publisher = PublishPromptUseCase::new(Arc::clone(&publisher_session), topology.clone());
    let mut readers = JoinSet::new();
    for text in prompts {
        let id = PromptId::generate();
        // Attach first so the relay finds a reader for the first fragment
        let mut stream = sink.attach(id.clone());
        publisher.execute(&text, Some(id.clone())).await?;
        println!("{} {}", ConsoleFormatter::format_published(&id), text);
        readers.spawn(async move {
            while let Some(fragment) = stream.next().await {
                println!("{}", ConsoleFormatter::format_fragment(&fragment));
            }
        });
    }

    tokio::select! {
        _ = async { while readers.join_next().await.is_some() {} } => {}
        _ = shutdown.cancelled() => warn!("Demo interrupted"),
    }
    workers.cancel();

    let (generated, cancels) = generator_task.await.context("generator task panicked")??;
    let relayed = relay_task.await.context("relay task panicked")??;
    eprintln!("{}", ConsoleFormatter::format_stats("generator", &generated));
    eprintln!("{}", ConsoleFormatter::format_stats("cancel listener", &cancels));
    eprintln!("{}", ConsoleFormatter::format_stats("relay", &relayed));

    for session in [generator_session, relay_session, publisher_session] {
        close(&session).await;
    }
    if broker.unacked_count(&topology.answer) > 0 {
        error!("Answer fragments left unacknowledged after the demo");
    }
    Ok(())
}
