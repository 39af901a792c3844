use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use cable_loadgen_rs::config::{parse_scenario_kind, Config, ScenarioKind};
use cable_loadgen_rs::runtime::{LoadRuntime, RunSummary};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "ActionCable load generator")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "CABLE_LOADGEN_CONFIG",
        default_value = "cable-loadgen.toml"
    )]
    config: PathBuf,

    /// Override the cable websocket URL.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "CABLE_LOADGEN_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the configured load scenario.
    Run(RunArgs),
    /// Validate configuration and report pass/warn/fail checks.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Scenario to run: echo, chat, broadcast or turbo.
    #[arg(long, value_parser = parse_scenario_arg)]
    scenario: Option<ScenarioKind>,
    /// Number of concurrent virtual users.
    #[arg(long)]
    vus: Option<usize>,
    /// Iterations per virtual user.
    #[arg(long)]
    iterations: Option<usize>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct DoctorArgs {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| CliCommand::Run(RunArgs::default()));
    match command {
        CliCommand::Run(args) => run_load(&cli, args).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, cli.url.as_deref(), args),
    }
}

async fn run_load(cli: &Cli, args: RunArgs) -> Result<()> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.url.as_deref(), args.scenario, args.vus, args.iterations);
    cfg.validate()?;

    let summary = LoadRuntime::new(cfg).run().await?;
    print_run_summary(&summary, args.json);
    if summary.ok() {
        return Ok(());
    }
    Err(anyhow!("load run reported failed checks or errors"))
}

fn run_doctor(config_path: &Path, url: Option<&str>, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path)
        .and_then(|mut cfg| {
            cfg.apply_cli_overrides(url, None, None, None);
            cfg.validate()?;
            Ok(cfg)
        })
        .map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn parse_scenario_arg(raw: &str) -> std::result::Result<ScenarioKind, String> {
    parse_scenario_kind(raw)
        .ok_or_else(|| format!("unknown scenario `{raw}` (expected echo, chat, broadcast, turbo)"))
}

fn build_doctor_report(config_result: Result<Config, String>, config_path: &Path) -> DoctorReport {
    let mut checks = Vec::new();
    let cfg = match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: "config loaded".to_owned(),
                detail: Some(config_path.display().to_string()),
            });
            Some(cfg)
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: "config failed to load".to_owned(),
                detail: Some(err),
            });
            None
        }
    };

    if let Some(cfg) = cfg {
        let secure = cfg.target.url.trim().starts_with("wss://");
        checks.push(DoctorCheck {
            id: "target.url".to_owned(),
            status: "pass".to_owned(),
            message: format!("target {}", cfg.target.url),
            detail: Some(if secure {
                "tls via rustls".to_owned()
            } else {
                "plaintext websocket".to_owned()
            }),
        });

        checks.push(DoctorCheck {
            id: "target.scenario".to_owned(),
            status: "pass".to_owned(),
            message: format!(
                "scenario {} on {}",
                cfg.target.scenario.as_str(),
                cfg.channel_name()
            ),
            detail: Some(format!(
                "vus={} iterations={}",
                cfg.load.vus, cfg.load.iterations
            )),
        });

        checks.push(DoctorCheck {
            id: "connect.codec".to_owned(),
            status: "pass".to_owned(),
            message: format!("codec {}", cfg.connect.codec.as_str()),
            detail: None,
        });

        let receive_ms = cfg.connect.receive_timeout().as_millis();
        checks.push(DoctorCheck {
            id: "connect.receive_timeout".to_owned(),
            status: if receive_ms < 100 { "warn" } else { "pass" }.to_owned(),
            message: format!("receive timeout {receive_ms}ms"),
            detail: (receive_ms < 100)
                .then(|| "very short timeouts turn slow replies into failed checks".to_owned()),
        });

        let unbounded = cfg.connect.inbox_capacity.is_none();
        let buffering = cfg.target.scenario != ScenarioKind::Broadcast;
        checks.push(DoctorCheck {
            id: "connect.inbox_capacity".to_owned(),
            status: if unbounded && buffering && cfg.load.vus > 1_000 {
                "warn"
            } else {
                "pass"
            }
            .to_owned(),
            message: match cfg.connect.inbox_capacity {
                Some(limit) => format!("inbox bounded at {limit} messages (drop oldest)"),
                None => "inbox unbounded".to_owned(),
            },
            detail: None,
        });

        checks.push(DoctorCheck {
            id: "connect.cookies".to_owned(),
            status: "pass".to_owned(),
            message: if cfg.connect.cookies.is_some() {
                "cookies configured".to_owned()
            } else {
                "no cookies configured".to_owned()
            },
            detail: matches!(
                cfg.target.scenario,
                ScenarioKind::Chat | ScenarioKind::Turbo
            )
            .then(|| "per-user uid cookies are generated when unset".to_owned()),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn print_run_summary(summary: &RunSummary, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_owned())
        );
        return;
    }

    let report = &summary.report;
    println!(
        "scenario {}: {} iterations across {} vus in {}ms{}",
        summary.scenario,
        report.iterations,
        summary.vus,
        summary.elapsed_ms,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    for (name, tally) in &report.checks {
        let status = if tally.failed == 0 { "PASS" } else { "FAIL" };
        let total = tally.passed + tally.failed;
        println!("[{status}] {name}: {}/{total}", tally.passed);
    }
    println!(
        "messages received={} broadcasts sent={} errors={}",
        report.messages_received, report.broadcasts_sent, report.errors
    );
    println!(
        "frames sent={} received={} dropped={} callback failures={} evictions={}",
        report.stats.sent,
        report.stats.received,
        report.stats.dropped,
        report.stats.callback_failures,
        report.stats.evictions
    );
    if let Some(rtt) = &summary.rtt {
        println!(
            "rtt ms: min={} avg={:.1} p50={} p95={} max={} (n={})",
            rtt.min, rtt.avg, rtt.p50, rtt.p95, rtt.max, rtt.count
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
