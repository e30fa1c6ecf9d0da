use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use outpost_core::{Outpost, ReconcileReport};
use outpost_kubehub::{KubeStore, StoreConfig};
use outpost_reconcile::{render, Driver, DriverError, OutpostContext, Stores};
use tokio::sync::watch;
use tracing::{error, info, warn};

mod config;

#[derive(Parser, Debug)]
#[command(name = "outpostctl", version, about = "Keep outpost deployments converged")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge every outpost in FILE, then keep converging
    Reconcile {
        /// Outpost definitions (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Seconds between passes
        #[arg(long = "interval", env = "OUTPOST_INTERVAL_SECS", default_value_t = 30)]
        interval: u64,
        /// Run a single pass and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
    /// Delete every object owned by the outposts in FILE
    Teardown {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print reference objects without contacting the cluster
    Render {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("OUTPOST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OUTPOST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OUTPOST_METRICS_ADDR; expected host:port");
        }
    }
}

/// Delay before the next pass. Clean passes wait the full interval; each
/// consecutive failed pass doubles a one-second base, capped at the interval.
fn next_delay(consecutive_failures: u32, interval: Duration) -> Duration {
    if consecutive_failures == 0 {
        return interval;
    }
    let exp = consecutive_failures.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(interval)
}

fn print_report(output: Output, verb: &str, report: &ReconcileReport) {
    match output {
        Output::Human => {
            for (kind, outcome) in &report.outcomes {
                println!("{} • {} • {}", report.unit, kind, outcome);
            }
        }
        Output::Json => {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "action": verb,
                "unit": report.unit,
                "clean": report.is_clean(),
                "outcomes": report.outcomes.iter().map(|(k, o)| serde_json::json!({ "kind": k, "result": o })).collect::<Vec<_>>(),
            });
            println!("{}", line);
        }
    }
}

fn print_abort(output: Output, err: &DriverError) {
    if let DriverError::Aborted { partial, .. } = err {
        print_report(output, "reconcile", partial);
    }
    match output {
        Output::Human => eprintln!("reconcile error: {}", err),
        Output::Json => println!(
            "{}",
            serde_json::json!({ "ts": chrono::Utc::now().to_rfc3339(), "action": "reconcile", "error": err.to_string() })
        ),
    }
}

/// One outpost's sequential reconcile loop. Returns whether the last pass was clean.
async fn run_outpost(driver: Driver, output: Output, interval: Duration, once: bool, mut stop: watch::Receiver<bool>) -> bool {
    let mut failures: u32 = 0;
    loop {
        let clean = match driver.reconcile_all().await {
            Ok(report) => {
                print_report(output, "reconcile", &report);
                report.is_clean()
            }
            Err(e) => {
                print_abort(output, &e);
                false
            }
        };
        failures = if clean { 0 } else { failures.saturating_add(1) };
        if once {
            return clean;
        }
        let delay = next_delay(failures, interval);
        if !clean {
            warn!(unit = driver.unit(), failures, retry_in_ms = delay.as_millis() as u64, "pass not clean; backing off");
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {
                info!(unit = driver.unit(), "stopping");
                return clean;
            }
        }
    }
}

fn drivers(outposts: Vec<Outpost>, stores: &Stores) -> Result<Vec<Driver>> {
    outposts
        .into_iter()
        .map(|o| {
            let name = o.name.clone();
            let ctx = OutpostContext::shared(o).with_context(|| format!("outpost {:?}", name))?;
            Driver::for_outpost(ctx, stores).with_context(|| format!("outpost {:?}", name))
        })
        .collect()
}

async fn kube_stores() -> Result<Stores> {
    let cfg = StoreConfig::from_env();
    info!(timeout_s = cfg.request_timeout.as_secs(), field_manager = %cfg.field_manager, force = cfg.force_apply, "connecting to cluster");
    let store = KubeStore::try_default(cfg).await.context("building kube client")?;
    Ok(Stores::kube(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { file } => {
            let outposts = config::load(&file)?;
            let mut rendered = Vec::new();
            for o in outposts {
                let unit = o.unit_key();
                for (kind, obj) in render(o).with_context(|| format!("rendering {}", unit))? {
                    rendered.push((unit.clone(), kind, obj));
                }
            }
            match cli.output {
                Output::Human => {
                    for (unit, kind, obj) in &rendered {
                        println!("---\n# {} {}", unit, kind);
                        print!("{}", serde_yaml::to_string(obj)?);
                    }
                }
                Output::Json => {
                    let objs: Vec<_> = rendered.into_iter().map(|(_, _, obj)| obj).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
        }
        Commands::Teardown { file } => {
            let outposts = config::load(&file)?;
            let stores = kube_stores().await?;
            let drivers = drivers(outposts, &stores)?;
            info!(outposts = drivers.len(), "teardown invoked");
            let reports = join_all(drivers.iter().map(|d| d.teardown_all())).await;
            let mut failed = 0usize;
            for report in &reports {
                print_report(cli.output, "teardown", report);
                if !report.is_clean() {
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("teardown failed for {} of {} outposts", failed, reports.len());
            }
        }
        Commands::Reconcile { file, interval, once } => {
            let outposts = config::load(&file)?;
            let stores = kube_stores().await?;
            let drivers = drivers(outposts, &stores)?;
            let interval = Duration::from_secs(interval.max(1));
            info!(outposts = drivers.len(), interval_s = interval.as_secs(), once, "reconcile invoked");

            let (stop_tx, stop_rx) = watch::channel(false);
            if !once {
                tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => info!("interrupt received"),
                        Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
                    }
                    let _ = stop_tx.send(true);
                });
            }

            let results = join_all(drivers.into_iter().map(|d| run_outpost(d, cli.output, interval, once, stop_rx.clone()))).await;
            let failed = results.iter().filter(|clean| !**clean).count();
            if once && failed > 0 {
                bail!("{} of {} outposts did not converge", failed, results.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_interval() {
        let interval = Duration::from_secs(30);
        assert_eq!(next_delay(0, interval), interval);
        assert_eq!(next_delay(1, interval), Duration::from_secs(1));
        assert_eq!(next_delay(2, interval), Duration::from_secs(2));
        assert_eq!(next_delay(5, interval), Duration::from_secs(16));
        assert_eq!(next_delay(6, interval), interval);
        assert_eq!(next_delay(u32::MAX, interval), interval);
    }

    #[test]
    fn cli_parses_reconcile_flags() {
        let cli = Cli::try_parse_from(["outpostctl", "-o", "json", "reconcile", "-f", "outposts.yaml", "--once", "--interval", "5"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Reconcile { file, interval, once } => {
                assert_eq!(file, PathBuf::from("outposts.yaml"));
                assert_eq!(interval, 5);
                assert!(once);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn once_mode_reports_clean_pass_against_memory_store() {
        let outposts = config::parse(
            "outposts:\n  - uuid: 00000000-0000-0000-0000-000000000001\n    name: proxy\n    namespace: auth\n    image: img:1\n    token: t\n    ports: [{ name: http, port: 9000 }]\n",
        )
        .unwrap();
        let stores = Stores::memory();
        let (_tx, rx) = watch::channel(false);
        let mut ds = drivers(outposts, &stores).unwrap();
        assert!(run_outpost(ds.remove(0), Output::Json, Duration::from_secs(1), true, rx).await);
    }
}
