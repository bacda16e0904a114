//! bpmn-engine-runner - run or resume a BPMN definition from the command line
//!
//! Usage:
//!   bpmn-engine-runner run process.yaml --signal approve --state-out state.json
//!   bpmn-engine-runner resume process.yaml state.json --signal approve

use anyhow::{bail, Context, Result};
use bpmn_engine_core::{
    Definition, DefinitionContext, DefinitionState, EngineError, EngineSettings, Environment,
};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "bpmn-engine-runner")]
#[command(about = "Run BPMN definitions authored as YAML or JSON")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and run a definition
    Run {
        /// Definition document (.yaml, .yml or .json)
        definition: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Recover a stopped or saved run and resume it
    Resume {
        /// Definition document the state was taken from
        definition: PathBuf,
        /// State JSON written by `run --state-out`
        state: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Args)]
struct RunOpts {
    /// Signal a waiting activity by id, in order (repeatable)
    #[arg(long = "signal")]
    signals: Vec<String>,

    /// Register a service that completes after a delay, as `name` or `name:millis`
    #[arg(long = "service")]
    services: Vec<String>,

    /// Engine settings YAML
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write the definition state here when the command finishes
    #[arg(long)]
    state_out: Option<PathBuf>,

    /// How long to wait for the run to leave before reporting it as running
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Engine handles are single-threaded; services complete on local tasks.
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            match cli.command {
                Command::Run { definition, opts } => run(&definition, None, opts).await,
                Command::Resume {
                    definition,
                    state,
                    opts,
                } => run(&definition, Some(&state), opts).await,
            }
        })
        .await
}

async fn run(path: &Path, state: Option<&Path>, opts: RunOpts) -> Result<()> {
    let definition = load_definition(path, opts.settings.as_deref())?;
    for arg in &opts.services {
        register_service(definition.environment(), arg)?;
    }

    definition.on("wait", |msg| {
        tracing::info!(activity_id = %msg.content.id, "waiting");
    });

    let (tx, rx) = oneshot::channel();
    let settled = Rc::new(RefCell::new(Some(tx)));
    let done = move |result: Result<(), EngineError>| {
        if let Some(tx) = settled.borrow_mut().take() {
            let _ = tx.send(result);
        }
    };

    match state {
        None => definition.run_with(done)?,
        Some(state_path) => {
            let state = read_state(state_path)?;
            definition.recover(&state)?;
            // Recovered runs settle through the same leave/stop/error events.
            let done = RefCell::new(Some(done));
            definition.on("definition.#", move |msg| {
                let result = match msg.routing_key() {
                    "definition.leave" => Ok(()),
                    "definition.error" => Err(EngineError::from(
                        msg.content
                            .error
                            .clone()
                            .unwrap_or_else(|| bpmn_engine_core::ActivityError::new("definition failed")),
                    )),
                    _ => return,
                };
                if let Some(done) = done.borrow_mut().take() {
                    done(result);
                }
            });
            definition.resume()?;
        }
    }

    let timeout = Duration::from_millis(opts.timeout_ms);
    for id in &opts.signals {
        if !wait_postponed(&definition, id, timeout).await {
            tracing::warn!(signal = %id, "activity is not waiting, signal skipped");
            continue;
        }
        definition.signal(json!({ "id": id }))?;
    }

    let outcome = tokio::time::timeout(timeout, rx).await;
    report(&definition, outcome);

    if let Some(out) = &opts.state_out {
        let json = serde_json::to_string_pretty(&definition.get_state())?;
        std::fs::write(out, json).with_context(|| format!("writing state to {}", out.display()))?;
        println!("state written to {}", out.display());
    }
    Ok(())
}

/// Poll until activity `id` is running, so signals sent after pending
/// services still find their target.
async fn wait_postponed(definition: &Definition, id: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !definition.is_running() {
            return false;
        }
        if definition
            .get_activity_by_id(id)
            .is_some_and(|activity| activity.is_running())
        {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn load_definition(path: &Path, settings: Option<&Path>) -> Result<Definition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading definition {}", path.display()))?;
    let context = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => DefinitionContext::from_json(&source)?,
        _ => DefinitionContext::from_yaml(&source)?,
    };
    let Some(settings) = settings else {
        return Ok(Definition::new(context));
    };
    let yaml = std::fs::read_to_string(settings)
        .with_context(|| format!("reading settings {}", settings.display()))?;
    let environment = Environment::new(EngineSettings::from_yaml(&yaml)?);
    Ok(Definition::with_environment(&context, environment))
}

fn read_state(path: &Path) -> Result<DefinitionState> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading state {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing state {}", path.display()))
}

/// `name` completes on the next tick, `name:millis` after a delay.
fn register_service(environment: &Environment, arg: &str) -> Result<()> {
    let (name, delay) = match arg.split_once(':') {
        Some((name, millis)) => {
            let millis: u64 = millis
                .parse()
                .with_context(|| format!("invalid service delay in {arg:?}"))?;
            (name, Duration::from_millis(millis))
        }
        None => (arg, Duration::ZERO),
    };
    if name.is_empty() {
        bail!("service name is empty in {arg:?}");
    }
    let service = name.to_string();
    environment.add_service(name, move |call| {
        let service = service.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(service = %service, activity_id = %call.message().content.id, "service completed");
            call.complete(Some(json!({ "service": service })));
        });
    });
    Ok(())
}

type Outcome = Result<Result<Result<(), EngineError>, oneshot::error::RecvError>, tokio::time::error::Elapsed>;

fn report(definition: &Definition, outcome: Outcome) {
    match outcome {
        Ok(Ok(Ok(()))) if definition.is_stopped() => println!("{}: stopped", definition.id()),
        Ok(Ok(Ok(()))) => {
            println!("{}: completed", definition.id());
            let output = definition.environment().output();
            if !output.is_empty() {
                println!("output: {}", serde_json::Value::Object(output));
            }
        }
        Ok(Ok(Err(err))) => println!("{}: failed: {err}", definition.id()),
        Ok(Err(_)) => println!("{}: run abandoned", definition.id()),
        Err(_) => {
            let waiting: Vec<String> = definition
                .get_postponed()
                .iter()
                .map(|activity| activity.id().to_string())
                .collect();
            println!("{}: running, waiting on [{}]", definition.id(), waiting.join(", "));
        }
    }
    let counters = definition.counters();
    println!(
        "completed: {}, discarded: {}",
        counters.completed, counters.discarded
    );
}
