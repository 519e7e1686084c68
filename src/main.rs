use std::io::{self, BufRead, Write};

use agent_broker::config::EngineConfig;
use agent_broker::Engine;
use clap::Parser;
use tracing::{error, info, Level};

/// Reads newline-delimited `{"tool": "...", "args": {...}}` tool calls from
/// stdin and writes one envelope per line to stdout. Stands in for the
/// out-of-scope HTTP/WebSocket transport.
#[derive(Parser, Debug)]
#[command(name = "agent-broker", about = "Agent orchestration broker")]
struct Cli {
    /// Overrides BROKER_SCHEDULER_INTERVAL_MS for this run.
    #[arg(long)]
    scheduler_interval_ms: Option<u64>,
}

#[derive(serde::Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load()?;
    if let Some(interval) = cli.scheduler_interval_ms {
        config.scheduler_interval_ms = interval;
    }

    info!("starting agent broker");
    let engine = Engine::new(config);
    engine.start().await;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let call: ToolCall = match serde_json::from_str(&line) {
            Ok(call) => call,
            Err(err) => {
                error!(%err, "malformed tool call");
                continue;
            }
        };
        let envelope = engine.dispatch(&call.tool, call.args).await;
        writeln!(stdout, "{}", serde_json::to_string(&envelope)?)?;
    }

    engine.shutdown().await;
    info!("agent broker stopped");
    Ok(())
}
