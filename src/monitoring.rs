//! F-engine monitoring queries, and the task that exports them as metrics

use crate::{
    common::{FengInput, BOARDS, CHANNELS, SIGNALS, STREAMS_PER_BOARD},
    control::{ControlError, ControlPlane, Responses, Target},
};
use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use lazy_static::lazy_static;
use ndarray::{Array2, ArrayView1};
use prometheus::{
    register_gauge_vec, register_int_counter_vec, register_int_gauge_vec, GaugeVec,
    IntCounterVec, IntGaugeVec, TextEncoder,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};

/// How long broadcast queries wait for every board
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(30);
/// Autocorrelations are read out in this many blocks of signals per board
const SIGNAL_BLOCKS: usize = 4;
const SIGNALS_PER_BLOCK: usize = STREAMS_PER_BOARD / SIGNAL_BLOCKS;
/// ADC counts at full scale
const ADC_FULL_SCALE: f64 = 512.0;
/// Input impedance in ohms
const ADC_IMPEDANCE: f64 = 100.0;
/// How often the monitor task looks for the shutdown signal
const BLOCK_TIMEOUT: Duration = Duration::from_millis(100);

lazy_static! {
    static ref PFB_OVFL_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "pfb_overflow_count",
        "Counter of PFB overflows",
        &["board"]
    )
    .unwrap();
    static ref EQ_CLIP_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "eq_clip_count",
        "Counter of samples clipped in the equalizer",
        &["board"]
    )
    .unwrap();
    static ref ADC_RMS_GAUGE: GaugeVec = register_gauge_vec!(
        "adc_rms",
        "RMS value of raw adc values",
        &["dsig"]
    )
    .unwrap();
    static ref ADC_POWER_GAUGE: GaugeVec = register_gauge_vec!(
        "adc_power_watts",
        "Input power at the adc",
        &["dsig"]
    )
    .unwrap();
    static ref QUERY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "monitor_query_failures",
        "Number of board queries that failed",
        &["query"]
    )
    .unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("Board {board} sent a malformed {what} - {source}")]
    Malformed {
        board: usize,
        what: String,
        source: serde_json::Error,
    },
    #[error("Board {board} sent a {what} of the wrong shape")]
    Shape { board: usize, what: String },
    #[error("Board {0} isn't part of the array")]
    UnknownBoard(usize),
    #[error("Board {board} has no stream {stream}")]
    NoStream { board: usize, stream: usize },
}

/// A reading from the whole array, along with the boards that couldn't contribute
#[derive(Debug)]
pub struct Partial<T> {
    pub value: T,
    pub failures: Vec<(usize, MonitorError)>,
}

impl<T> Partial<T> {
    /// Log every failure, counting them against `query`
    pub fn report_failures(&self, query: &str) {
        for (board, e) in &self.failures {
            warn!("{query}: board {board} - {e}");
            QUERY_FAILURES.with_label_values(&[query]).inc();
        }
    }
}

/// Decode each board's answer to a broadcast, recording the boards that
/// failed or never answered
fn per_board<T: DeserializeOwned>(
    responses: Responses,
    block: &str,
    method: &str,
) -> Partial<BTreeMap<usize, T>> {
    let mut value = BTreeMap::new();
    let mut failures = vec![];
    for board in 1..=BOARDS {
        if !responses.contains_key(&board) {
            failures.push((
                board,
                ControlError::NoResponse {
                    unit: board,
                    block: block.to_owned(),
                    method: method.to_owned(),
                }
                .into(),
            ));
        }
    }
    for (board, reply) in responses {
        let decoded = reply.map_err(MonitorError::from).and_then(|v| {
            serde_json::from_value(v).map_err(|source| MonitorError::Malformed {
                board,
                what: format!("{block}.{method} response"),
                source,
            })
        });
        match decoded {
            Ok(v) => {
                value.insert(board, v);
            }
            Err(e) => failures.push((board, e)),
        }
    }
    Partial { value, failures }
}

fn query_all<C: ControlPlane + ?Sized, T: DeserializeOwned>(
    control: &C,
    block: &str,
    method: &str,
    kwargs: Value,
) -> Result<Partial<BTreeMap<usize, T>>, ControlError> {
    let responses =
        control.send_command(Target::All, block, method, kwargs, MONITOR_TIMEOUT, BOARDS)?;
    Ok(per_board(responses, block, method))
}

/// Copy one board's block of autocorrelations into its rows of the array spectrum
fn place_spectra(
    spec: &mut Array2<f64>,
    board: usize,
    signal_block: usize,
    spectra: &[Vec<f64>],
) -> Result<(), MonitorError> {
    if !(1..=BOARDS).contains(&board) {
        return Err(MonitorError::UnknownBoard(board));
    }
    if spectra.len() != SIGNALS_PER_BLOCK || spectra.iter().any(|s| s.len() != CHANNELS) {
        return Err(MonitorError::Shape {
            board,
            what: format!("block {signal_block} of spectra"),
        });
    }
    let start = (board - 1) * STREAMS_PER_BOARD + signal_block * SIGNALS_PER_BLOCK;
    for (i, s) in spectra.iter().enumerate() {
        spec.row_mut(start + i).assign(&ArrayView1::from(s.as_slice()));
    }
    Ok(())
}

/// Get the latest autocorrelation spectrum of every digital signal as a
/// (signal, channel) array. Rows of boards that fail are left as zeros.
pub fn get_new_spectra_autocorr<C: ControlPlane + ?Sized>(
    control: &C,
) -> Result<Partial<Array2<f64>>, ControlError> {
    let mut spec = Array2::zeros((SIGNALS, CHANNELS));
    let mut failures = vec![];
    for kk in 0..SIGNAL_BLOCKS {
        // Get data from all SNAPs at once
        let blocks: Partial<BTreeMap<usize, Vec<Vec<f64>>>> = query_all(
            control,
            "autocorr",
            "get_new_spectra",
            json!({ "signal_block": kk }),
        )?;
        failures.extend(blocks.failures);
        for (board, spectra) in blocks.value {
            if let Err(e) = place_spectra(&mut spec, board, kk, &spectra) {
                failures.push((board, e));
            }
        }
    }
    Ok(Partial {
        value: spec,
        failures,
    })
}

/// Level of a set of ADC inputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdcPower {
    /// Standard deviation in ADC counts
    pub std: Vec<f64>,
    /// Power in watts
    pub power: Vec<f64>,
}

/// Convert bit statistics (per-stream mean and mean square) of the requested
/// streams to rms and power. Returns the first stream with no statistics as
/// the error.
pub fn bit_stats_to_power(
    means: &[f64],
    mean_squares: &[f64],
    streams: &[usize],
) -> Result<AdcPower, usize> {
    let mut std = Vec::with_capacity(streams.len());
    let mut power = Vec::with_capacity(streams.len());
    for &s in streams {
        let (Some(mean), Some(ms)) = (means.get(s), mean_squares.get(s)) else {
            return Err(s);
        };
        let var = (ms - mean * mean).max(0.0);
        std.push(var.sqrt());
        power.push(var / ADC_FULL_SCALE / ADC_FULL_SCALE / ADC_IMPEDANCE);
    }
    Ok(AdcPower { std, power })
}

/// ADC input levels of `streams` on `board`
pub fn adc_power<C: ControlPlane + ?Sized>(
    control: &C,
    board: usize,
    streams: &[usize],
) -> Result<AdcPower, MonitorError> {
    let stats = control.call(board, "input", "get_bit_stats", json!({}), MONITOR_TIMEOUT)?;
    let stats: Vec<Vec<f64>> =
        serde_json::from_value(stats).map_err(|source| MonitorError::Malformed {
            board,
            what: "input.get_bit_stats response".to_owned(),
            source,
        })?;
    let [means, mean_squares, ..] = stats.as_slice() else {
        return Err(MonitorError::Shape {
            board,
            what: "bit statistics".to_owned(),
        });
    };
    bit_stats_to_power(means, mean_squares, streams)
        .map_err(|stream| MonitorError::NoStream { board, stream })
}

/// PFB overflow count of every board
pub fn get_overflow_count_pfb<C: ControlPlane + ?Sized>(
    control: &C,
) -> Result<Partial<BTreeMap<usize, u64>>, ControlError> {
    query_all(control, "pfb", "get_overflow_count", json!({}))
}

/// Histogram of ADC sample values for every input of a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputHistograms {
    /// Bin values
    pub vals: Vec<i64>,
    /// Counts per bin, one histogram per input
    pub hists: Vec<Vec<u64>>,
}

/// Input histograms of every board
pub fn get_all_histograms_input<C: ControlPlane + ?Sized>(
    control: &C,
) -> Result<Partial<BTreeMap<usize, InputHistograms>>, ControlError> {
    query_all(control, "input", "get_all_histograms", json!({}))
}

/// Equalizer clip count of every board
pub fn clip_count_eq<C: ControlPlane + ?Sized>(
    control: &C,
) -> Result<Partial<BTreeMap<usize, u64>>, ControlError> {
    query_all(control, "eq", "clip_count", json!({}))
}

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    match encoder.encode_to_string(&metric_families) {
        Ok(body_str) => HttpResponse::Ok().body(body_str),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

fn set_counts(gauge: &IntGaugeVec, counts: &BTreeMap<usize, u64>) {
    for (board, count) in counts {
        gauge
            .with_label_values(&[&board.to_string()])
            .set(i64::try_from(*count).unwrap_or(i64::MAX));
    }
}

fn update_counters<C: ControlPlane + ?Sized>(control: &C) -> Result<(), ControlError> {
    let ovfl = get_overflow_count_pfb(control)?;
    ovfl.report_failures("pfb_overflow");
    set_counts(&PFB_OVFL_GAUGE, &ovfl.value);

    let clips = clip_count_eq(control)?;
    clips.report_failures("eq_clip");
    set_counts(&EQ_CLIP_GAUGE, &clips.value);
    Ok(())
}

fn update_adc<C: ControlPlane + ?Sized>(control: &C) {
    let streams: Vec<_> = (0..STREAMS_PER_BOARD).collect();
    for board in 1..=BOARDS {
        match adc_power(control, board, &streams) {
            Ok(p) => {
                for (stream, (std, power)) in p.std.iter().zip(&p.power).enumerate() {
                    let dsig = FengInput { board, stream }.dsig().to_string();
                    ADC_RMS_GAUGE.with_label_values(&[&dsig]).set(*std);
                    ADC_POWER_GAUGE.with_label_values(&[&dsig]).set(*power);
                }
            }
            Err(e) => {
                warn!("adc_power: board {board} - {e}");
                QUERY_FAILURES.with_label_values(&["adc_power"]).inc();
            }
        }
    }
}

/// Poll the F-engines every `interval`, updating the metrics, until told to stop
pub fn monitor_task<C: ControlPlane + ?Sized>(
    control: &C,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting monitoring task!");
    let mut last_poll: Option<Instant> = None;
    loop {
        // Look for shutdown signal
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => {
                info!("Monitoring task stopping");
                break;
            }
            Err(_) => (),
        }
        if last_poll.is_some_and(|t| t.elapsed() < interval) {
            std::thread::sleep(BLOCK_TIMEOUT);
            continue;
        }
        last_poll = Some(Instant::now());

        if let Err(e) = update_counters(control) {
            warn!("F-engine Error - {e}");
        }
        update_adc(control);
    }
    Ok(())
}

pub fn start_web_server(metrics_port: u16) -> eyre::Result<Server> {
    info!("Starting metrics webserver");
    let server = HttpServer::new(|| App::new().service(metrics))
        .bind(("0.0.0.0", metrics_port))?
        .workers(1)
        .run();
    Ok(server)
}
