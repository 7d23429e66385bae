//! regiocache - Regional case totals served through a freshness-aware cache
//!
//! A command-line front end for the refresh coordinator: one-shot queries,
//! or a long-running watch session that keeps the latest day warm while
//! answering queries typed on stdin.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use regiocache::cache::CacheKey;
use regiocache::cli::{parse_date_arg, Cli, Command};
use regiocache::config::{load_config, Config};
use regiocache::coordinator::{QueryOutcome, RefreshCoordinator};
use regiocache::data::{find_region, DpcClient, RegionStatistics, RegionSummary};
use regiocache::refresh::RefreshHandle;

/// Logs go to stderr so stdout carries only query output
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regiocache=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn build_coordinator(config: &Config) -> Result<RefreshCoordinator, Box<dyn std::error::Error>> {
    let upstream = DpcClient::new(&config.upstream)?;
    Ok(RefreshCoordinator::new(config, Arc::new(upstream)))
}

/// Renders region summaries as a fixed-width table
fn print_table(regions: &[RegionSummary]) {
    println!("{:<24} {:>12} {:>10}", "Region", "Cases", "Provinces");
    for region in regions {
        println!(
            "{:<24} {:>12} {:>10}",
            region.region_name, region.total_cases, region.province_count
        );
    }
}

fn print_outcome(outcome: &QueryOutcome, limit: Option<usize>, region: Option<&str>, json: bool) {
    let regions: Vec<RegionSummary> = match region {
        Some(name) => find_region(&outcome.data, name).cloned().into_iter().collect(),
        None => outcome
            .data
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect(),
    };

    if json {
        let body = serde_json::json!({
            "data": regions,
            "metadata": {
                "query": outcome.key.to_string(),
                "data_date": outcome.data_date,
                "as_of": outcome.as_of,
                "served_from_cache": outcome.served_from_cache,
                "freshness": outcome.freshness,
                "statistics": RegionStatistics::from_summaries(&outcome.data),
            }
        });
        println!("{}", body);
        return;
    }

    println!(
        "Data for {} (fetched {}, {:?}{})",
        outcome.data_date,
        outcome.as_of.format("%Y-%m-%d %H:%M UTC"),
        outcome.freshness,
        if outcome.served_from_cache { ", cached" } else { "" }
    );
    if regions.is_empty() {
        println!("No matching regions");
    } else {
        print_table(&regions);
    }
    if let Some(stats) = RegionStatistics::from_summaries(&outcome.data) {
        println!(
            "Total {} cases across {} regions (avg {:.2})",
            stats.total_cases, stats.total_regions, stats.average_cases_per_region
        );
    }
}

async fn run_query(
    coordinator: &RefreshCoordinator,
    key: CacheKey,
    limit: Option<usize>,
    region: Option<&str>,
    json: bool,
) -> ExitCode {
    match coordinator.query(key).await {
        Ok(outcome) => {
            print_outcome(&outcome, limit, region, json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Handles one stdin command; returns false when the session should end
async fn handle_line(coordinator: &RefreshCoordinator, line: &str) -> bool {
    coordinator.record_activity_now();

    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("quit") | Some("exit") => return false,
        Some("status") => {
            let status = coordinator.status();
            println!(
                "fresh={} stale={} frozen={} missing={} in_flight={}",
                status.fresh, status.stale, status.frozen, status.missing, status.in_flight
            );
            let dates: Vec<String> = coordinator
                .cached_dates()
                .iter()
                .map(|d| d.to_string())
                .collect();
            println!("cached dates: {}", dates.join(", "));
        }
        Some("invalidate") => match parts.next().map(parse_date_arg) {
            Some(Ok(key)) => {
                let removed = coordinator.invalidate(key);
                println!("invalidated {} ({})", key, if removed { "removed" } else { "not cached" });
            }
            Some(Err(e)) => eprintln!("{}", e),
            None => eprintln!("usage: invalidate <date|latest>"),
        },
        Some(word) => match parse_date_arg(word) {
            Ok(key) => {
                let _ = run_query(coordinator, key, Some(10), None, false).await;
            }
            Err(e) => eprintln!("{}", e),
        },
    }
    true
}

async fn run_watch(coordinator: RefreshCoordinator, config: &Config) -> ExitCode {
    let mut refresh = RefreshHandle::spawn(coordinator.clone(), config.refresh_config());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Watching; type a date, 'latest', 'status', 'invalidate <date>' or 'quit'");

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&coordinator, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            Some(message) = refresh.receiver.recv() => {
                info!(?message, "Background refresh");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    refresh.shutdown().await;
    coordinator.shutdown().await;
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let coordinator = match build_coordinator(&config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Query {
            date,
            limit,
            region,
            json,
        } => {
            let code = run_query(&coordinator, date, limit, region.as_deref(), json).await;
            coordinator.shutdown().await;
            code
        }
        Command::Watch => run_watch(coordinator, &config).await,
    }
}
