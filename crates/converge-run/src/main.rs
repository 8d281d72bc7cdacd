//! Converge Run - Drives a built-in scenario and prints what happened
//!
//! Every tick report is printed as one JSON line, followed by the
//! diagnostics events the scenario produced and the final state of each
//! instance.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use converge_foundation::ModuleKey;
use converge_runtime::{
    DiagnosticsConfig, DiagnosticsLevel, MemorySink, Priority, Runtime, RuntimeConfig,
    TickConfig, TickReport, TxnMeta,
};
use converge_tests::scenarios;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// One computed field over one input
    A,
    /// A computed field feeding a link
    B,
    /// Debounced deferred step behind a fast echo
    C,
    /// A cycle bounded by the urgent step cap
    Cycle,
    /// Urgent and background instances sharing a tick
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Level {
    Off,
    Light,
    Sampled,
    Full,
}

impl From<Level> for DiagnosticsLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => Self::Off,
            Level::Light => Self::Light,
            Level::Sampled => Self::Sampled,
            Level::Full => Self::Full,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "converge-run")]
#[command(about = "Run a convergence scenario and print tick reports and diagnostics")]
struct Cli {
    /// Scenario to run
    #[arg(long, value_enum, default_value = "a")]
    scenario: Scenario,

    /// Diagnostics level
    #[arg(long, value_enum, default_value = "full")]
    diagnostics: Level,

    /// Urgent step cap per tick
    #[arg(long, default_value = "512")]
    urgent_step_cap: usize,

    /// Units accepted per tick before background work is deferred
    #[arg(long, default_value = "64")]
    max_steps: usize,

    /// Print the compiled IR of every instance
    #[arg(long)]
    export_ir: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge_run=info,converge_runtime=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig {
        tick: TickConfig {
            urgent_step_cap: cli.urgent_step_cap,
            max_steps: cli.max_steps,
            ..TickConfig::default()
        },
        diagnostics: DiagnosticsConfig {
            level: cli.diagnostics.into(),
            ..DiagnosticsConfig::default()
        },
        ..RuntimeConfig::default()
    };

    // Lane tasks need a reactor; the runtime picks up the handle on creation.
    let tokio = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build tokio runtime")?;
    let _guard = tokio.enter();

    let sink = Arc::new(MemorySink::new());
    let runtime = Runtime::with_sink(config, sink.clone());
    info!(scenario = ?cli.scenario, "running scenario");

    let (keys, reports) = match cli.scenario {
        Scenario::A => run_a(&runtime)?,
        Scenario::B => run_b(&runtime)?,
        Scenario::C => tokio.block_on(run_c(&runtime))?,
        Scenario::Cycle => run_cycle(&runtime)?,
        Scenario::Priority => run_priority(&runtime)?,
    };

    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    for event in sink.take() {
        println!("{}", serde_json::to_string(&event)?);
    }
    for key in &keys {
        println!(
            "{}",
            json!({"instance": key.to_string(), "state": runtime.state(key)?})
        );
        if cli.export_ir {
            println!("{}", serde_json::to_string(&runtime.export_ir(key)?)?);
        }
    }
    Ok(())
}

type Outcome = (Vec<ModuleKey>, Vec<TickReport>);

fn run_a(runtime: &Runtime) -> Result<Outcome> {
    let key = runtime.register_module(&scenarios::scenario_a(), "a", scenarios::scenario_a_initial())?;
    runtime.set(&key, "a", json!(5))?;
    let reports = runtime.flush_until_idle(8);
    Ok((vec![key], reports))
}

fn run_b(runtime: &Runtime) -> Result<Outcome> {
    let key = runtime.register_module(&scenarios::checkout(), "cart", scenarios::checkout_initial())?;
    runtime.set(&key, "profile.firstName", json!("Grace"))?;
    let reports = runtime.flush_until_idle(8);
    Ok((vec![key], reports))
}

async fn run_c(runtime: &Runtime) -> Result<Outcome> {
    let runs = Arc::new(AtomicUsize::new(0));
    let key = runtime.register_module(
        &scenarios::search(50, runs, None),
        "box",
        scenarios::search_initial(),
    )?;
    let mut reports = Vec::new();
    for query in ["a", "ab"] {
        runtime.set(&key, "query", json!(query))?;
        reports.push(runtime.flush_now());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The lane flushes on its own once the debounce window closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if runtime.lane_pending(&key)? {
        bail!("deferred lane still pending after its window");
    }
    Ok((vec![key], reports))
}

fn run_cycle(runtime: &Runtime) -> Result<Outcome> {
    let key = runtime.register_module(&scenarios::clamp_cycle(20), "c", scenarios::clamp_initial())?;
    runtime.set(&key, "y", json!(1))?;
    let reports = runtime.flush_until_idle(64);
    Ok((vec![key], reports))
}

fn run_priority(runtime: &Runtime) -> Result<Outcome> {
    let urgent = runtime.register_module(&scenarios::counter(), "urgent", scenarios::counter_initial())?;
    let background =
        runtime.register_module(&scenarios::counter(), "background", scenarios::counter_initial())?;
    runtime.run_with_state_transaction(
        &background,
        TxnMeta::action("prefetch").with_priority(Priority::Low),
        |txn| txn.set("n", json!(7)),
    )?;
    runtime.run_with_state_transaction(&urgent, TxnMeta::action("type"), |txn| {
        txn.set("n", json!(3))
    })?;
    let reports = runtime.flush_until_idle(8);
    Ok((vec![urgent, background], reports))
}
