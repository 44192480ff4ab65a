use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use verbena_engine::Engine;
use verbena_events::{ChannelNotifier, Envelope};
use verbena_workflow::{ExecutionStrategy, Priority, TaskDefinition, work_fn};

/// Verbena - a cooperative multi-agent task-orchestration engine
#[derive(Parser)]
#[command(name = "verbena")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Log filter, e.g. "info" or "verbena_sync=debug"
  #[arg(long, default_value = "info")]
  log: String,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a sample three-stage workflow on a local engine
  Demo {
    /// Agent id to run under
    #[arg(long, default_value = "agent1")]
    agent: String,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  match cli.command {
    Some(Commands::Demo { agent }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_demo(agent))?;
    }
    None => {
      println!("verbena - use --help to see available commands");
    }
  }

  Ok(())
}

async fn run_demo(agent: String) -> Result<()> {
  let (notifier, mut events) = ChannelNotifier::channel();
  let engine = Engine::new(agent, Arc::new(notifier));
  engine.start();

  // Print events the way a transport would forward them to peers.
  let printer = tokio::spawn(async move {
    while let Some(Envelope { from_agent, event, .. }) = events.recv().await {
      println!("[{from_agent}] {}", serde_json::to_string(&event).unwrap_or_default());
    }
  });

  let mut workflow = engine.create_workflow("data-pipeline", ExecutionStrategy::Adaptive);

  let load = engine
    .create_task(
      "load",
      work_fn(|| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(serde_json::json!({ "rows": 1024 }))
      }),
    )
    .with_resources(["input.csv"]);
  let load_id = load.task_id.clone();
  workflow.add_task(load)?;

  let process = engine
    .create_task(
      "process",
      work_fn(|| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(serde_json::json!({ "rows": 1024, "clean": true }))
      }),
    )
    .with_dependencies([load_id.clone()])
    .with_resources(["processing-engine"])
    .with_priority(Priority::High);
  let process_id = process.task_id.clone();
  workflow.add_task(process)?;

  let save = TaskDefinition::new(
    "save",
    "save",
    work_fn(|| async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(serde_json::json!({ "written": true }))
    }),
  )
  .with_dependencies([process_id])
  .with_resources(["output.csv"]);
  workflow.add_task(save)?;

  let workflow_id = engine.submit_workflow(workflow)?;
  println!("submitted workflow {workflow_id}");

  loop {
    tokio::time::sleep(Duration::from_millis(200)).await;
    let Some(report) = engine.workflow_status(&workflow_id) else {
      break;
    };
    println!(
      "status={:?} progress={:.0}% ({}/{} tasks)",
      report.status, report.progress, report.completed_tasks, report.total_tasks
    );
    if report.status.is_terminal() {
      break;
    }
  }

  let health = engine.health_check();
  println!(
    "health: agent={} active_workflows={} locks_held={}",
    health.agent_id, health.active_workflows, health.locks_held
  );

  engine.shutdown();
  printer.abort();
  Ok(())
}
