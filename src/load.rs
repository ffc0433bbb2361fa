//! Loading a settings file onto the F-engines and ARX boards

use crate::{
    arx::load_arx,
    common::{ActiveBoards, AssignedSet, SIGNALS},
    control::ControlPlane,
    fanout::{Fanout, FanoutReport, Payload},
    runlog::utc_string,
    settings::{DelayPlan, Settings},
};
use hifitime::Epoch;
use tracing::info;

/// EQ profile given to every signal not in any group (the reference cable length)
const REFERENCE_PROFILE: usize = 0;

/// Push every setting in `settings` out to the active boards, in order:
/// FFT shift, equalization, delays, input selection, then ARX.
///
/// Nothing here stops early. Failed calls are collected in the returned report.
pub fn load_settings<F, A>(
    settings: &Settings,
    feng: &F,
    arx: &A,
    active: &ActiveBoards,
) -> FanoutReport
where
    F: ControlPlane + ?Sized,
    A: ControlPlane + ?Sized,
{
    info!(
        "Settings generated at {}",
        utc_string(Epoch::from_unix_seconds(settings.time))
    );
    info!(
        "Loading settings to SNAP2 boards: {:?}",
        active.iter().collect::<Vec<_>>()
    );
    let mut fanout = Fanout::new(feng, active);

    // FFT shift schedule
    let shift = settings.fft_shift();
    fanout.boards("fft shift", &Payload::fft_shift(shift));
    info!("All FFT shifts set to {shift:04X}");

    // Equalization
    info!("Loading equalization coefficients");
    let mut assigned = AssignedSet::new();
    for (k, group) in settings.eq_groups() {
        fanout.grouped(
            &format!("eq{k}"),
            group,
            &Payload::eq_coeffs(&settings.coef[k]),
            &mut assigned,
        );
        info!("eq{k}: {group:?}");
    }
    let n = fanout.default_to_unassigned(
        "eq default",
        &assigned,
        &Payload::eq_coeffs(&settings.coef[REFERENCE_PROFILE]),
    );
    info!("{n} remaining signals set to the eq{REFERENCE_PROFILE} profile");

    // Delays
    match settings.delay_dsig.as_deref().and_then(DelayPlan::from_ns) {
        Some(plan) => {
            info!("Loading delays");
            info!("Maximum delay: {} ns", plan.max_delay_ns);
            info!("Maximum delay: {} ADC clocks", plan.max_delay_clocks);
            info!("Maximum relative delay: {} ADC clocks", plan.max_relative_clocks);
            info!("Maximum delay to be applied: {} ADC clocks", plan.max_applied());
            info!("Minimum delay to be applied: {} ADC clocks", plan.min_applied());
            for (dsig, &clocks) in plan.applied.iter().enumerate() {
                fanout.signal("delay", dsig, &Payload::delay(clocks));
            }
        }
        None => info!("No delays given, skipping"),
    }

    // Input selection
    info!("Setting unused F-engine inputs to zero");
    let unused = settings
        .unused_flags()
        .unwrap_or_else(|| vec![false; SIGNALS]);
    let (zero, adc) = fanout.unused_inputs(&unused);
    info!("Set {zero} inputs to use_zero and {adc} inputs to use_adc");

    // ARX
    let mut report = fanout.into_report();
    match settings.arx() {
        Some((adrs, channels)) => {
            info!("Loading ARX settings to addresses {adrs:?}");
            load_arx(arx, adrs, channels, &mut report);
        }
        None => info!("No ARX settings given, skipping"),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arx::ARX_CHANNELS,
        common::DELAY_OFFSET,
        control::{testing::Recorder, Target},
        settings::Flag,
    };
    use serde_json::json;
    use std::collections::BTreeSet;

    fn settings() -> Settings {
        let mut unused = vec![Flag::Int(0); SIGNALS];
        unused[10] = Flag::Bool(true);
        Settings {
            time: 1_686_700_000.0,
            fft_shift: None,
            coef: vec![vec![0.5], vec![1.5], vec![2.5]],
            eq0: None,
            eq1: Some(vec![3, 700]),
            eq2: Some(vec![64]),
            eq3: None,
            eq4: None,
            eq5: None,
            eq6: None,
            delay_dsig: Some(vec![0.0, 51.02]),
            unused: Some(unused),
            adrs: Some(vec![15, 16]),
            arx_settings: Some(vec![vec![[0.0, 0.0, 0.0, 1.0]; ARX_CHANNELS]; 2]),
        }
    }

    fn dsig_of(target: Target, kwargs: &serde_json::Value) -> usize {
        match target {
            Target::Unit(b) => (b - 1) * 64 + kwargs["stream"].as_u64().unwrap() as usize,
            Target::All => panic!("Per-signal calls are never broadcast"),
        }
    }

    #[test]
    fn test_full_load() {
        let feng = Recorder::new();
        let arx = Recorder::new();
        let report = load_settings(&settings(), &feng, &arx, &ActiveBoards::all());
        assert!(report.is_clean());
        assert_eq!(report.skipped, 0);

        let shifts = feng.calls("pfb", "set_fft_shift");
        assert_eq!(shifts.len(), 11);
        assert!(shifts.iter().all(|s| s.kwargs == json!({"shift": 0x1FFC})));

        let eq = feng.calls("eq", "set_coeffs");
        assert_eq!(eq.len(), SIGNALS);
        let eq_targets: BTreeSet<_> = eq.iter().map(|s| dsig_of(s.target, &s.kwargs)).collect();
        assert_eq!(eq_targets.len(), SIGNALS);
        // Groups first, in order, then the reference profile for everything else
        assert_eq!(dsig_of(eq[0].target, &eq[0].kwargs), 3);
        assert_eq!(eq[0].kwargs["coeffs"], json!([1.5]));
        assert_eq!(dsig_of(eq[2].target, &eq[2].kwargs), 64);
        assert_eq!(eq[2].kwargs["coeffs"], json!([2.5]));
        assert!(eq[3..].iter().all(|s| s.kwargs["coeffs"] == json!([0.5])));

        let delays = feng.calls("delay", "set_delay");
        assert_eq!(delays.len(), 2);
        assert_eq!(delays[0].kwargs["delay"], json!(DELAY_OFFSET + 10));
        assert_eq!(delays[1].kwargs["delay"], json!(DELAY_OFFSET));

        assert_eq!(feng.calls("input", "use_zero").len(), 1);
        assert_eq!(feng.calls("input", "use_adc").len(), SIGNALS - 1);

        let raw = arx.calls("arx", "raw");
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[1].target, Target::Unit(16));
        assert!(feng.calls("arx", "raw").is_empty());

        assert_eq!(report.issued, 11 + SIGNALS + 2 + SIGNALS + 2);
    }

    #[test]
    fn test_partial_array() {
        let feng = Recorder::new();
        let arx = Recorder::new();
        let mut s = settings();
        s.unused = None;
        s.adrs = None;
        s.arx_settings = None;
        s.delay_dsig = None;
        let active = ActiveBoards::new([1, 2, 3]).unwrap();
        let report = load_settings(&s, &feng, &arx, &active);

        assert_eq!(feng.calls("pfb", "set_fft_shift").len(), 3);
        // Signal 700 lives on board 11
        let eq = feng.calls("eq", "set_coeffs");
        assert_eq!(eq.len(), 3 * 64);
        assert!(eq.iter().all(|s| s.target != Target::Unit(11)));
        assert!(feng.calls("delay", "set_delay").is_empty());
        assert_eq!(feng.calls("input", "use_adc").len(), 3 * 64);
        assert!(arx.sent().is_empty());
        assert!(report.skipped > 0);
    }
}
