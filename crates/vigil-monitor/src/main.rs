//! CLI entry point for the Vigil network monitor.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use vigil_core::events::{EventPayload, MonitorEvent};
use vigil_core::types::{ScanProfile, SnapshotDiff, SnapshotId};
use vigil_monitor::config::MonitorConfig;
use vigil_monitor::orchestrator::Orchestrator;
use vigil_monitor::scanner::CommandScanner;
use vigil_store::FsSnapshotStore;

#[derive(Parser)]
#[command(name = "vigil-monitor")]
#[command(about = "Continuous network inventory monitor")]
struct Cli {
    /// Target to scan (CIDR, dashed range, or IP). Defaults to the first
    /// configured target.
    #[arg(short, long)]
    target: Option<String>,

    /// Scan profile: quick, discovery, comprehensive.
    #[arg(short, long, default_value = "discovery")]
    profile: String,

    /// Run a single scan, print the snapshot as JSON, and exit.
    #[arg(long)]
    once: bool,

    /// Run continuously with scheduled scans until interrupted.
    #[arg(long)]
    daemon: bool,

    /// Config file prefix (default: vigil).
    #[arg(short, long, default_value = "vigil")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::load(&cli.config)?;

    let scanner = CommandScanner::new(&config.scanner_path);
    let version = scanner.verify_installation().await?;
    tracing::info!(scanner_version = %version.trim(), "Scan tool verified");

    let store = FsSnapshotStore::new(&config.storage_dir);
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(scanner), Arc::new(store)));

    if cli.once {
        let profile = parse_profile(&cli.profile)?;
        orchestrator.start().await?;
        let mut events = orchestrator.subscribe();

        let result = orchestrator
            .trigger_manual_scan(cli.target.as_deref(), Some(profile), None)
            .await;

        match result {
            Ok(snapshot) => {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                if let Some(diff) = recorded_diff(&orchestrator, &mut events, snapshot.id).await {
                    println!("{}", serde_json::to_string_pretty(&diff.summary)?);
                }
                orchestrator.stop().await?;
            }
            Err(e) => {
                let _ = orchestrator.stop().await;
                return Err(e.into());
            }
        }
    } else if cli.daemon {
        orchestrator.start().await?;

        // Stand-in notification sink: forward alert events to the log.
        let mut events = orchestrator.subscribe();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match event.payload {
                        EventPayload::SignificantChange {
                            diff_id,
                            total_changes,
                            threshold,
                            ..
                        } => {
                            tracing::warn!(
                                diff_id = %diff_id,
                                total_changes,
                                threshold,
                                "Significant change notification"
                            );
                        }
                        EventPayload::ScanFailed {
                            target,
                            error,
                            attempts,
                            ..
                        } => {
                            tracing::warn!(
                                target = %target,
                                error = %error,
                                attempts,
                                "Scan failure notification"
                            );
                        }
                        _ => {}
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Notification stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
        orchestrator.stop().await?;
        forwarder.abort();
    } else {
        anyhow::bail!("Specify --once (one-shot scan) or --daemon (continuous monitoring)");
    }

    Ok(())
}

/// Wait for the pipeline to record the snapshot, then fetch the diff it
/// computed against the prior latest, if one existed.
async fn recorded_diff(
    orchestrator: &Orchestrator,
    events: &mut broadcast::Receiver<MonitorEvent>,
    id: SnapshotId,
) -> Option<SnapshotDiff> {
    let recorded = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let EventPayload::SnapshotRecorded { snapshot_id, .. } = event.payload {
                        if snapshot_id == id {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), recorded)
        .await
        .is_err()
    {
        tracing::warn!(snapshot_id = %id, "Timed out waiting for the snapshot to be recorded");
        return None;
    }

    let diffs = orchestrator.get_recent_changes(1).await.ok()?;
    diffs.into_iter().rev().find(|d| d.to_snapshot == id)
}

fn parse_profile(s: &str) -> anyhow::Result<ScanProfile> {
    match s.to_lowercase().as_str() {
        "quick" => Ok(ScanProfile::Quick),
        "discovery" => Ok(ScanProfile::Discovery),
        "comprehensive" => Ok(ScanProfile::Comprehensive),
        _ => anyhow::bail!("Invalid profile: {s}. Choose: quick, discovery, comprehensive"),
    }
}
