#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use clap::Parser;
use eyre::bail;
use lwa_fcfg::{
    args::{Cli, Command, Query},
    common::{ActiveBoards, BOARDS, STREAMS_PER_BOARD},
    control::{ControlPlane, DryRun, EtcdControl},
    load::load_settings,
    monitoring::{
        adc_power, clip_count_eq, get_all_histograms_input, get_new_spectra_autocorr,
        get_overflow_count_pfb, monitor_task, start_web_server, Partial,
    },
    runlog::RunLogEntry,
    settings::Settings,
};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn load(
    etcd: &str,
    settings_path: &Path,
    boards: &[u8],
    log_file: &Path,
    dry_run: bool,
) -> eyre::Result<()> {
    let settings = Settings::from_file(settings_path)?;
    info!("Read settings file {}", settings_path.display());
    let active = if boards.is_empty() {
        ActiveBoards::all()
    } else {
        ActiveBoards::new(boards.iter().map(|b| usize::from(*b)))?
    };

    let report = if dry_run {
        load_settings(&settings, &DryRun, &DryRun, &active)
    } else {
        let feng = EtcdControl::snap(etcd)?;
        let arx = EtcdControl::arx(etcd)?;
        info!("Connected to etcd at {etcd}");
        load_settings(&settings, &feng, &arx, &active)
    };

    if !dry_run {
        RunLogEntry::now(settings_path, settings.time)?.append_to(log_file)?;
    }

    info!(
        "Sent {} commands, skipped {} signals on inactive boards",
        report.issued, report.skipped
    );
    if !report.is_clean() {
        for f in &report.failures {
            error!("{}: {} - {}", f.category, f.subject, f.error);
        }
        bail!("{} of {} commands failed", report.failures.len(), report.issued);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_partial<T: Serialize>(query: &str, partial: &Partial<T>) -> eyre::Result<()> {
    partial.report_failures(query);
    print_json(&partial.value)
}

fn query<C: ControlPlane>(control: &C, what: Query, board: Option<u8>) -> eyre::Result<()> {
    match what {
        Query::Spectra => {
            let spec = get_new_spectra_autocorr(control)?;
            spec.report_failures("spectra");
            let rows: Vec<Vec<f64>> = spec.value.outer_iter().map(|r| r.to_vec()).collect();
            print_json(&rows)
        }
        Query::AdcPower => {
            let streams: Vec<_> = (0..STREAMS_PER_BOARD).collect();
            let boards = match board {
                Some(b) => vec![usize::from(b)],
                None => (1..=BOARDS).collect(),
            };
            let mut levels = BTreeMap::new();
            for b in boards {
                match adc_power(control, b, &streams) {
                    Ok(p) => {
                        levels.insert(b, p);
                    }
                    Err(e) => warn!("adc_power: board {b} - {e}"),
                }
            }
            print_json(&levels)
        }
        Query::Overflow => print_partial("pfb_overflow", &get_overflow_count_pfb(control)?),
        Query::Histograms => print_partial("histograms", &get_all_histograms_input(control)?),
        Query::ClipCount => print_partial("eq_clip", &clip_count_eq(control)?),
    }
}

fn serve(etcd: &str, metrics_port: u16, interval: u64) -> eyre::Result<()> {
    let control = EtcdControl::snap(etcd)?;
    let (sd_send, sd_recv) = broadcast::channel(1);
    let monitor_thread = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn(move || monitor_task(&control, Duration::from_secs(interval), sd_recv))?;

    // Runs until interrupted
    actix_web::rt::System::new().block_on(async move {
        start_web_server(metrics_port)?.await?;
        Ok::<_, eyre::Report>(())
    })?;

    info!("Stopping monitor");
    let _ = sd_send.send(());
    match monitor_thread.join() {
        Ok(r) => r,
        Err(_) => bail!("Monitor thread panicked"),
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    // Get the CLI options
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Command::Load {
            settings,
            boards,
            log_file,
            dry_run,
        } => load(&cli.etcd, &settings, &boards, &log_file, dry_run),
        Command::Query { what, board } => query(&EtcdControl::snap(&cli.etcd)?, what, board),
        Command::Serve {
            metrics_port,
            interval,
        } => serve(&cli.etcd, metrics_port, interval),
    }
}
