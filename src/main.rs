//! cp-sim — OCPP 1.6J charge point simulator CLI
//!
//! Connects a simulated charge point to a CSMS and drives it from an
//! interactive prompt.
//!
//! ```sh
//! # Connect CP-001 with two connectors to a local CSMS
//! cp-sim --url ws://localhost:9000/ocpp/ --id CP-001 --connectors 2
//!
//! # Run from a config file, then script a connector
//! cp-sim --config sim.toml --scenario charge-session.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use cp_sim::config::{default_config_path, ConfigStore, SimulatorConfig, TomlConfigStore};
use cp_sim::domain::charge_point::ChargePoint;
use cp_sim::domain::fsm::ConnectorStatus;
use cp_sim::ports::{FileScenarioRepository, NullUploadSink};
use cp_sim::scenario::{ChargePointScenarioTarget, ExecutionMode, ScenarioExecutor};
use cp_sim::support::clock::SystemClock;
use cp_sim::support::errors::SimulatorError;
use cp_sim::transport::ws::{WsTransport, WsTransportConfig};
use cp_sim::transport::Transport;

/// OCPP 1.6J charge point simulator.
#[derive(Parser, Debug)]
#[command(
    name = "cp-sim",
    version,
    about = "Simulate OCPP 1.6J charge points against a CSMS",
    long_about = "Interactive charge point simulator. Connects to a CSMS over \
                  OCPP 1.6J (JSON over WebSocket) and drives connectors from a \
                  REPL or a scripted scenario.\n\n\
                  Default config: ~/.config/cp-sim/config.toml"
)]
struct Cli {
    /// CSMS base URL; the charge point id is appended (ws:// or wss://).
    #[arg(short, long, env = "CP_SIM_URL")]
    url: Option<String>,

    /// Charge point identity.
    #[arg(short, long, env = "CP_SIM_ID")]
    id: Option<String>,

    /// Number of connectors.
    #[arg(short = 'n', long)]
    connectors: Option<u32>,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenario to attach: a definition file (JSON) or a scenario
    /// repository directory resolved for this charge point.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Connect immediately instead of waiting for the connect command.
    #[arg(long)]
    auto_connect: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .clone()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), SimulatorError> {
    // ── Configuration ──────────────────────────────────────
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let store = TomlConfigStore::new(&config_path);
    let mut config = match store.load()? {
        Some(config) => config,
        None if cli.url.is_some() && cli.id.is_some() => SimulatorConfig::new(
            cli.id.clone().unwrap(),
            cli.url.clone().unwrap(),
        ),
        None => {
            return Err(SimulatorError::Config(format!(
                "no config at {} and no --url/--id given",
                config_path.display()
            )))
        }
    };
    if let Some(url) = cli.url {
        config.ws_url = url;
    }
    if let Some(id) = cli.id {
        config.cp_id = id;
    }
    if let Some(n) = cli.connectors {
        config.connector_count = n;
    }
    config.validate()?;

    // ── Wiring ─────────────────────────────────────────────
    let mut ws_config = WsTransportConfig::new(&config.ws_url, &config.cp_id);
    if let Some(auth) = config.basic_auth.clone() {
        ws_config = ws_config.with_basic_auth(auth);
    }
    let transport = Arc::new(WsTransport::new(ws_config));
    let cp = ChargePoint::new(
        config.clone(),
        transport,
        Arc::new(NullUploadSink),
        Arc::new(SystemClock),
    )?;
    cp.reservations().start_sweeper();

    let executor = match &cli.scenario {
        Some(path) => {
            let scenario = FileScenarioRepository::load_path(path, &config.cp_id)
                .await?
                .ok_or_else(|| {
                    SimulatorError::Config(format!(
                        "no scenario for {} under {}",
                        config.cp_id,
                        path.display()
                    ))
                })?;
            scenario
                .validate()
                .map_err(|e| SimulatorError::Scenario(e.to_string()))?;
            let connector_id = scenario.target_connector().unwrap_or(1);
            let callbacks = Arc::new(ChargePointScenarioTarget::new(cp.clone(), connector_id));
            Some(Arc::new(ScenarioExecutor::new(
                scenario,
                callbacks,
                cp.bus().clone(),
            )))
        }
        None => None,
    };

    if cli.auto_connect {
        cp.connect().await?;
    }

    println!("cp-sim — charge point {} → {}", config.cp_id, config.ws_url);
    println!("Type 'help' for commands.");

    // ── REPL ───────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| SimulatorError::Config(format!("stdin: {e}")))?
    {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        match dispatch(&cp, executor.as_deref(), &words).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    if let Some(executor) = &executor {
        executor.stop().await;
    }
    cp.disconnect().await;
    Ok(())
}

/// Execute one REPL command. `Ok(true)` exits.
async fn dispatch(
    cp: &Arc<ChargePoint>,
    executor: Option<&ScenarioExecutor>,
    words: &[&str],
) -> Result<bool, SimulatorError> {
    match words {
        ["connect"] => cp.connect().await?,
        ["disconnect"] => cp.disconnect().await,
        ["status"] => {
            println!(
                "charge point {}: {} (transport {})",
                cp.id(),
                cp.status(),
                if cp.transport().is_open() { "open" } else { "closed" }
            );
            if let Some(error) = cp.error() {
                println!("  error: {error}");
            }
            for connector in cp.connectors() {
                let snapshot = connector.snapshot();
                let tx = snapshot
                    .transaction
                    .map(|t| format!(", tx {}", t.id))
                    .unwrap_or_default();
                let soc = snapshot
                    .soc
                    .map(|s| format!(", soc {s:.1}%"))
                    .unwrap_or_default();
                println!(
                    "  connector {}: {} ({:?}, {} Wh{soc}{tx})",
                    snapshot.id, snapshot.status, snapshot.availability, snapshot.meter_value
                );
            }
        }
        ["start", connector, tag] => {
            cp.start_transaction(parse_connector(connector)?, tag, None, None)?;
        }
        ["stop", connector] => cp.stop_transaction(parse_connector(connector)?)?,
        ["meter", connector, value] => {
            let value = value
                .parse()
                .map_err(|_| SimulatorError::Config(format!("not a meter value: {value}")))?;
            cp.set_meter_value(parse_connector(connector)?, value)?;
        }
        ["send-meter", connector] => cp.send_meter_value(parse_connector(connector)?)?,
        ["heartbeat"] => cp.send_heartbeat(),
        ["heartbeat", "start", seconds] => {
            let seconds = seconds
                .parse()
                .map_err(|_| SimulatorError::Config(format!("not a period: {seconds}")))?;
            cp.start_heartbeat(seconds)?;
        }
        ["heartbeat", "stop"] => cp.stop_heartbeat(),
        ["authorize", tag] => cp.authorize(tag),
        ["connector-status", connector, status] => {
            let status = ConnectorStatus::parse(status)
                .ok_or_else(|| SimulatorError::Config(format!("unknown status: {status}")))?;
            cp.update_connector_status(parse_connector(connector)?, status)?;
        }
        ["scenario", "start"] => scenario_command(executor)?.start(ExecutionMode::Oneshot)?,
        ["scenario", "step-mode"] => scenario_command(executor)?.start(ExecutionMode::Step)?,
        ["scenario", "step"] => scenario_command(executor)?.step(),
        ["scenario", "stop"] => scenario_command(executor)?.stop().await,
        ["scenario", "state"] => {
            let context = scenario_command(executor)?.context();
            println!(
                "scenario: {:?} (node {:?}{})",
                context.state,
                context.current_node,
                context
                    .error
                    .map(|e| format!(", error: {e}"))
                    .unwrap_or_default()
            );
        }
        ["history"] => {
            println!("{}", cp.state_history().export_json());
        }
        ["help"] => print_help(),
        ["exit"] | ["quit"] => return Ok(true),
        other => {
            eprintln!("Error: unknown command: {}", other.join(" "));
        }
    }
    Ok(false)
}

fn parse_connector(raw: &str) -> Result<u32, SimulatorError> {
    raw.parse()
        .map_err(|_| SimulatorError::Config(format!("not a connector id: {raw}")))
}

fn scenario_command(
    executor: Option<&ScenarioExecutor>,
) -> Result<&ScenarioExecutor, SimulatorError> {
    executor.ok_or_else(|| SimulatorError::Scenario("no scenario loaded (use --scenario)".into()))
}

fn print_help() {
    println!(
        "\
commands:
  connect                         open the link to the CSMS
  disconnect                      close the link (no reconnect)
  status                          charge point and connector overview
  start <connector> <tagId>       start a transaction
  stop <connector>                stop the active transaction
  meter <connector> <value>       set the meter register (Wh)
  send-meter <connector>          send a MeterValues message
  heartbeat [start <s> | stop]    one-shot, or arm/disarm the timer
  authorize <tagId>               send an Authorize request
  connector-status <c> <status>   drive a connector (0 = charge point)
  scenario start|step-mode|step|stop|state
  history                         dump the state history as JSON
  help                            this text
  exit                            quit"
    );
}
