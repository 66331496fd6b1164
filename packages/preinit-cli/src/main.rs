//! CLI for exercising the pre-initialization layer against a simulated engine
//!
//! `preinit replay` prints the engine's invocation log as JSON lines, so the
//! output can be diffed or piped into `jq`.

mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use preinit::inspector::{Inspector, InspectorHost, Trace};
use preinit::{
    flush_in_new_task, read_snippet, CallKind, Dispatched, FacadeBuilder, FlushMode, Operation,
    PreInitConfig, SnippetSource,
};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::sim::{sim_loader, LogEntry, SimEngine, TrackedScheduler, INTEGRATIONS};

#[derive(Parser)]
#[command(name = "preinit")]
#[command(about = "Buffer calls before an engine loads, then replay them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a snippet and extra calls against a simulated engine
    Replay(ReplayArgs),

    /// List every deferrable operation and how it is proxied
    Ops,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ReplayArgs {
    /// JSON file holding the snippet (overrides configuration)
    #[arg(long)]
    snippet: Option<PathBuf>,

    /// How long the simulated engine takes to load
    #[arg(long, default_value_t = 100)]
    load_delay_ms: u64,

    /// Make the simulated engine fail to load
    #[arg(long)]
    fail_load: bool,

    /// Extra call issued before readiness, as `name:json-args`
    #[arg(long = "call", value_name = "NAME:ARGS")]
    calls: Vec<String>,

    /// Connect an inspector that prints traces to stderr
    #[arg(long)]
    inspect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,preinit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ops => print_ops(),
        Commands::Replay(args) => {
            let config = PreInitConfig::from_env().context("Failed to load configuration")?;
            for entry in replay(&args, &config).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }

    Ok(())
}

fn print_ops() {
    println!("{:<28} {}", "OPERATION".bold(), "KIND".bold());
    for op in Operation::ALL {
        let kind = match op.kind() {
            CallKind::Deferred => "deferred".green(),
            CallKind::Chainable => "chainable".cyan(),
            CallKind::FireAndForget => "fire-and-forget".yellow(),
        };
        println!("{:<28} {}", op.as_str(), kind);
    }
}

/// Parse `name:json-args`. A JSON array spreads into positional arguments;
/// any other value is a single argument; nothing after the colon means none.
fn parse_call(arg: &str) -> Result<(Operation, Vec<Value>)> {
    let (name, raw) = arg.split_once(':').unwrap_or((arg, ""));
    let operation: Operation = name.trim().parse()?;
    let args = match raw.trim() {
        "" => Vec::new(),
        raw => match serde_json::from_str::<Value>(raw)
            .with_context(|| format!("arguments for {operation} are not valid JSON"))?
        {
            Value::Array(args) => args,
            single => vec![single],
        },
    };
    Ok((operation, args))
}

/// Run one replay and return the engine's invocation log.
async fn replay(args: &ReplayArgs, config: &PreInitConfig) -> Result<Vec<LogEntry>> {
    let calls = args
        .calls
        .iter()
        .map(|arg| parse_call(arg))
        .collect::<Result<Vec<_>>>()?;

    let host = InspectorHost::new(config.inspector_docking);
    host.set_integrations(INTEGRATIONS.iter().copied());
    let engine = Arc::new(SimEngine::new(host.clone(), Duration::from_millis(5)));
    let scheduler = Arc::new(TrackedScheduler::new(Handle::current()));

    let builder = match &args.snippet {
        Some(path) => FacadeBuilder::new()
            .flush_plan(config.flush.plan())
            .seed(read_snippet(&[SnippetSource::File(path.clone())])),
        None => FacadeBuilder::from_config(config),
    };
    let facade = builder.scheduler(scheduler.clone()).build(sim_loader(
        engine.clone(),
        Duration::from_millis(args.load_delay_ms),
        args.fail_load,
    ))?;
    tracing::info!(buffered = facade.buffer().len(), "façade created");

    let mut pending = Vec::new();
    for (operation, call_args) in calls {
        if let Dispatched::Pending(call) = facade.dispatch(operation, call_args) {
            pending.push((operation, call));
        }
    }

    if let Err(err) = facade.wait_flushed().await {
        bail!("engine never became ready: {err}");
    }
    if config.flush == FlushMode::None {
        // Nothing was flushed at readiness, so the loader side does it.
        flush_in_new_task(&engine, facade.buffer(), scheduler.as_ref()).await;
    }
    scheduler.drain().await;

    for (operation, call) in pending {
        match call.await {
            Ok(value) => tracing::debug!(%operation, %value, "call settled"),
            Err(err) => tracing::warn!(%operation, error = %err, "call failed"),
        }
    }

    if args.inspect {
        host.connect(
            Arc::new(StderrInspector),
            &json!({ "user": { "id": null, "traits": null } }),
        );
    }

    Ok(engine.log())
}

/// Prints each trace as one JSON line on stderr.
struct StderrInspector;

impl Inspector for StderrInspector {
    fn start(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn trace(&self, trace: &Trace) {
        match serde_json::to_string(trace) {
            Ok(line) => eprintln!("{line}"),
            Err(err) => tracing::warn!(error = %err, "unprintable trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> PreInitConfig {
        PreInitConfig {
            import_snippet: false,
            ..PreInitConfig::default()
        }
    }

    #[test]
    fn test_parse_call_forms() {
        assert_eq!(parse_call("page").unwrap(), (Operation::Page, vec![]));
        assert_eq!(
            parse_call(r#"track:["signup", {"plan": "pro"}]"#).unwrap(),
            (Operation::Track, vec![json!("signup"), json!({"plan": "pro"})])
        );
        assert_eq!(
            parse_call(r#"identify:"user-1""#).unwrap(),
            (Operation::Identify, vec![json!("user-1")])
        );
        assert!(parse_call("launch:[]").is_err());
        assert!(parse_call("track:{oops").is_err());
    }

    #[tokio::test]
    async fn test_replay_runs_every_call_once() {
        let args = ReplayArgs {
            load_delay_ms: 10,
            calls: vec![
                r#"track:["a"]"#.to_string(),
                r#"on:["ready"]"#.to_string(),
                r#"track:["b"]"#.to_string(),
                r#"addSourceMiddleware:["mw"]"#.to_string(),
            ],
            ..ReplayArgs::default()
        };

        let log = replay(&args, &quiet_config()).await.unwrap();

        let ops: Vec<_> = log.iter().map(|e| e.operation).collect();
        // Standard plan: middleware, then listeners, then the rest.
        assert_eq!(
            ops,
            vec![
                Operation::AddSourceMiddleware,
                Operation::On,
                Operation::Track,
                Operation::Track
            ]
        );
        assert_eq!(log[2].args, vec![json!("a")]);
        assert_eq!(log[3].args, vec![json!("b")]);
    }

    #[tokio::test]
    async fn test_replay_seeds_snippet_file() {
        let path = std::env::temp_dir().join(format!("preinit-cli-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"[["page"], ["identify", "u1"]]"#).unwrap();
        let args = ReplayArgs {
            snippet: Some(path.clone()),
            load_delay_ms: 1,
            calls: vec![r#"identify:["u2"]"#.to_string()],
            ..ReplayArgs::default()
        };

        let log = replay(&args, &quiet_config()).await;
        std::fs::remove_file(&path).unwrap();
        let log = log.unwrap();

        let identified: Vec<_> = log
            .iter()
            .filter(|e| e.operation == Operation::Identify)
            .map(|e| e.args.clone())
            .collect();
        assert_eq!(identified, vec![vec![json!("u1")], vec![json!("u2")]]);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_replay_with_empty_plan_flushes_by_hand() {
        let config = PreInitConfig {
            flush: FlushMode::None,
            ..quiet_config()
        };
        let args = ReplayArgs {
            load_delay_ms: 1,
            calls: vec!["reset".to_string()],
            ..ReplayArgs::default()
        };

        let log = replay(&args, &config).await.unwrap();
        let ops: Vec<_> = log.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Reset]);
    }

    #[tokio::test]
    async fn test_replay_reports_load_failure() {
        let args = ReplayArgs {
            load_delay_ms: 1,
            fail_load: true,
            ..ReplayArgs::default()
        };
        let err = replay(&args, &quiet_config()).await.unwrap_err();
        assert!(err.to_string().contains("simulated engine failed to load"));
    }
}
