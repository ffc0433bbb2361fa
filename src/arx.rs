//! Analog receiver (ARX) board settings
//!
//! Each ARX board carries 16 channels. A board is configured in one shot with
//! a `SETA` command followed by four hex digits per channel.

use crate::{
    control::ControlPlane,
    fanout::{FanoutReport, Subject},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Channels on a single ARX board
pub const ARX_CHANNELS: usize = 16;
/// Attenuator step size in dB
const ATTEN_STEP_DB: f64 = 2.0;
/// Largest setting of any attenuator, in steps
const ATTEN_MAX_STEPS: u16 = 15;
/// Largest filter selection
const FILTER_MAX: u16 = 7;
/// How long an ARX board gets to acknowledge a command
pub const ARX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, PartialEq)]
pub enum ArxError {
    #[error("Attenuation of {0} dB isn't a multiple of 2 dB between 0 and 30")]
    Attenuation(f64),
    #[error("Filter selection {0} isn't between 0 and 7")]
    Filter(f64),
    #[error("ARX boards have 16 channels, but {0} were given")]
    ChannelCount(usize),
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn atten_steps(db: f64) -> Result<u16, ArxError> {
    let steps = db / ATTEN_STEP_DB;
    if steps.fract() != 0.0 || !(0.0..=f64::from(ATTEN_MAX_STEPS)).contains(&steps) {
        return Err(ArxError::Attenuation(db));
    }
    Ok(steps as u16)
}

/// Encode one channel's settings as four hex digits.
///
/// Bits 0-2 select the filter, bits 3-6 the first attenuator, bits 7-10 the
/// second attenuator and bits 11-14 the split attenuator. Bit 15 is unused.
pub fn chan_code(at1: f64, at2: f64, at_split: f64, filter: f64) -> Result<String, ArxError> {
    if filter.fract() != 0.0 || !(0.0..=f64::from(FILTER_MAX)).contains(&filter) {
        return Err(ArxError::Filter(filter));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filter = filter as u16;
    let word = filter
        | atten_steps(at1)? << 3
        | atten_steps(at2)? << 7
        | atten_steps(at_split)? << 11;
    Ok(format!("{word:04X}"))
}

/// The full `SETA` command configuring every channel of a board
pub fn board_command(channels: &[[f64; 4]]) -> Result<String, ArxError> {
    if channels.len() != ARX_CHANNELS {
        return Err(ArxError::ChannelCount(channels.len()));
    }
    let codes = channels
        .iter()
        .map(|[at1, at2, at_split, filter]| chan_code(*at1, *at2, *at_split, *filter))
        .collect::<Result<String, _>>()?;
    Ok(format!("SETA{codes}"))
}

/// Send channel settings to each ARX address in turn, recording failures and
/// carrying on to the next address
pub fn load_arx<C: ControlPlane + ?Sized>(
    control: &C,
    addresses: &[usize],
    settings: &[Vec<[f64; 4]>],
    report: &mut FanoutReport,
) {
    for (&adr, channels) in addresses.iter().zip(settings) {
        let command = match board_command(channels) {
            Ok(c) => c,
            Err(e) => {
                warn!("ARX address {adr}: {e}");
                continue;
            }
        };
        let result = control.call(adr, "arx", "raw", json!({ "command": command }), ARX_TIMEOUT);
        if result.is_ok() {
            info!("Loaded ARX {adr}: {command}");
        }
        report.record("arx", Subject::Arx(adr), result);
    }
}
