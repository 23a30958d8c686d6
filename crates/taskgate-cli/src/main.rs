//! taskgate CLI - run, stop and inspect interruptible tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt, stream};
use taskgate_core::{
    BackendConfig, BoxError, CoordinatorBuilder, InterruptConfig, InterruptCoordinator,
    InterruptError, TaskKey, TaskState,
};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interruptible task runner backed by a local or Redis coordinator
#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML config file (backend, TTLs, channel prefix)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL; overrides the backend from the config file
    #[arg(long, global = true, env = "TASKGATE_REDIS_URL")]
    redis_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulated producer and print what it yields
    Run {
        #[command(flatten)]
        target: Target,

        /// Number of items to produce (0 = until stopped)
        #[arg(long, default_value = "10")]
        items: u64,

        /// Delay between items, in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,

        /// Make the producer fail after this many items
        #[arg(long)]
        fail_after: Option<u64>,
    },
    /// Send a stop signal to whichever process runs the task
    Stop {
        #[command(flatten)]
        target: Target,
    },
    /// Print the persisted state of a task
    State {
        #[command(flatten)]
        target: Target,
    },
    /// Delete the persisted state of a task
    Reset {
        #[command(flatten)]
        target: Target,
    },
    /// Start a run, stop it from a second handle, and report the outcome
    Demo {
        /// How long the run goes before it is stopped, in milliseconds
        #[arg(long, default_value = "1000")]
        stop_after_ms: u64,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    #[arg(short, long)]
    user: String,

    #[arg(short, long)]
    session: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(&args)?;
    let coordinator = CoordinatorBuilder::from_config(&config)
        .await
        .context("failed to initialize the interrupt coordinator")?;

    let result = dispatch(&coordinator, args.command).await;
    coordinator
        .close()
        .await
        .context("failed to close the interrupt coordinator")?;
    result
}

fn load_config(args: &Args) -> anyhow::Result<InterruptConfig> {
    let mut config = match &args.config {
        Some(path) => InterruptConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => InterruptConfig::default(),
    };
    if let Some(url) = &args.redis_url {
        config.backend = BackendConfig::Redis { url: url.clone() };
    }
    config.validate()?;
    Ok(config)
}

async fn dispatch(coordinator: &InterruptCoordinator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            target,
            items,
            interval_ms,
            fail_after,
        } => {
            let interval = Duration::from_millis(interval_ms);
            run(coordinator, &target, move || ticks(items, interval, fail_after)).await
        }
        Command::Stop { target } => {
            coordinator.stop(&target.user, &target.session).await?;
            println!("stop signal sent to {}:{}", target.user, target.session);
            Ok(())
        }
        Command::State { target } => {
            match coordinator.state(&target.user, &target.session).await? {
                Some(state) => println!("{state}"),
                None => println!("(absent)"),
            }
            Ok(())
        }
        Command::Reset { target } => {
            coordinator.reset(&target.user, &target.session).await?;
            println!("state cleared for {}:{}", target.user, target.session);
            Ok(())
        }
        Command::Demo { stop_after_ms } => {
            demo(coordinator, Duration::from_millis(stop_after_ms)).await
        }
    }
}

/// Stream every item to stdout; Ctrl-C abandons the stream, which stops the run.
async fn run<F, S>(
    coordinator: &InterruptCoordinator,
    target: &Target,
    producer: F,
) -> anyhow::Result<()>
where
    F: FnOnce() -> S + Send + 'static,
    S: Stream<Item = Result<String, BoxError>> + Send + 'static,
{
    let mut stream = match coordinator
        .run_and_stream(&target.user, &target.session, producer)
        .await
    {
        Ok(stream) => stream,
        Err(err @ InterruptError::AlreadyRunning(_)) => {
            anyhow::bail!("conflict: {err}");
        }
        Err(err) => return Err(err.into()),
    };

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(item)) => println!("data: {item}"),
                Some(Err(err)) => {
                    println!("error: {err}");
                    break;
                }
                None => {
                    println!("done");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, abandoning the stream");
                break;
            }
        }
    }
    drop(stream);

    match settle(coordinator, &target.user, &target.session).await? {
        Some(state) if state.is_terminal() => println!("final state: {state}"),
        Some(state) => println!("state: {state} (not settled)"),
        None => println!("final state: (absent)"),
    }
    Ok(())
}

/// Wait (up to the shutdown grace) for the local teardown of a run, then read
/// its persisted state.
async fn settle(
    coordinator: &InterruptCoordinator,
    user: &str,
    session: &str,
) -> anyhow::Result<Option<TaskState>> {
    let key = TaskKey::new(user, session);
    let settled = tokio::time::timeout(coordinator.config().shutdown_grace, async {
        while coordinator.is_active_locally(&key) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if settled.is_err() {
        warn!(task = %key, "run still tearing down");
    }
    Ok(coordinator.state(user, session).await?)
}

fn ticks(
    items: u64,
    interval: Duration,
    fail_after: Option<u64>,
) -> impl Stream<Item = Result<String, BoxError>> + Send + 'static {
    stream::unfold(0u64, move |n| async move {
        if items != 0 && n >= items {
            return None;
        }
        sleep(interval).await;
        if fail_after.is_some_and(|limit| n >= limit) {
            let err: BoxError = format!("simulated failure after {n} items").into();
            return Some((Err(err), n + 1));
        }
        Some((Ok(format!("tick {n}")), n + 1))
    })
}

async fn demo(coordinator: &InterruptCoordinator, stop_after: Duration) -> anyhow::Result<()> {
    let (user, session) = ("demo", "session-1");
    let mut stream = coordinator
        .run_and_stream(user, session, || ticks(0, Duration::from_millis(100), None))
        .await?;

    let second = coordinator
        .run_and_stream(user, session, || ticks(1, Duration::ZERO, None))
        .await;
    match second {
        Err(err) if err.is_contention() => println!("second run rejected: {err}"),
        Err(err) => return Err(err.into()),
        Ok(_) => anyhow::bail!("second run was admitted while the first was running"),
    }

    let stopper = coordinator.clone();
    tokio::spawn(async move {
        sleep(stop_after).await;
        if let Err(err) = stopper.stop(user, session).await {
            tracing::error!(error = %err, "failed to send stop signal");
        }
    });

    while let Some(item) = stream.next().await {
        println!("data: {}", item?);
    }
    println!(
        "final state: {}",
        coordinator
            .state(user, session)
            .await?
            .map_or_else(|| "(absent)".to_string(), |s| s.to_string())
    );
    Ok(())
}
