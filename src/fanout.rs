//! Fanning per-signal and per-board settings out across the F-engine array

use crate::{
    common::{try_dsig_to_feng, ActiveBoards, AssignedSet, CONFIG_TIMEOUT, SIGNALS},
    control::{ControlError, ControlPlane},
};
use serde_json::{json, Map, Value};
use std::fmt::Display;
use tracing::{debug, warn};

/// A block method call, minus the stream it applies to
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub block: &'static str,
    pub method: &'static str,
    pub kwargs: Map<String, Value>,
}

impl Payload {
    fn new(block: &'static str, method: &'static str, kwargs: Value) -> Self {
        let kwargs = match kwargs {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Self {
            block,
            method,
            kwargs,
        }
    }

    #[must_use]
    pub fn fft_shift(shift: u32) -> Self {
        Self::new("pfb", "set_fft_shift", json!({ "shift": shift }))
    }

    #[must_use]
    pub fn eq_coeffs(coeffs: &[f64]) -> Self {
        Self::new("eq", "set_coeffs", json!({ "coeffs": coeffs }))
    }

    #[must_use]
    pub fn delay(clocks: i64) -> Self {
        Self::new("delay", "set_delay", json!({ "delay": clocks }))
    }

    #[must_use]
    pub fn use_zero() -> Self {
        Self::new("input", "use_zero", json!({}))
    }

    #[must_use]
    pub fn use_adc() -> Self {
        Self::new("input", "use_adc", json!({}))
    }

    /// The kwargs of this call scoped to a single stream
    fn for_stream(&self, stream: usize) -> Value {
        let mut kwargs = self.kwargs.clone();
        kwargs.insert("stream".to_owned(), stream.into());
        Value::Object(kwargs)
    }
}

/// The thing a failed call was trying to configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Signal(usize),
    Board(usize),
    Arx(usize),
}

impl Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Signal(n) => write!(f, "digital signal {n}"),
            Subject::Board(n) => write!(f, "board {n}"),
            Subject::Arx(n) => write!(f, "ARX address {n}"),
        }
    }
}

#[derive(Debug)]
pub struct Failure {
    pub category: String,
    pub subject: Subject,
    pub error: ControlError,
}

/// Bookkeeping for a whole configuration run
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// Calls that were sent (successful or not)
    pub issued: usize,
    /// Signals passed over because their board isn't active
    pub skipped: usize,
    pub failures: Vec<Failure>,
}

impl FanoutReport {
    pub fn record(&mut self, category: &str, subject: Subject, result: Result<Value, ControlError>) {
        self.issued += 1;
        if let Err(error) = result {
            warn!("{category}: {subject} failed - {error}");
            self.failures.push(Failure {
                category: category.to_owned(),
                subject,
                error,
            });
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies settings to the streams and boards of the active part of the array.
///
/// Every call is attempted exactly once. A failed call is logged and recorded
/// in the [`FanoutReport`], and never stops the calls after it.
pub struct Fanout<'a, C: ?Sized> {
    control: &'a C,
    active: &'a ActiveBoards,
    report: FanoutReport,
}

impl<'a, C: ControlPlane + ?Sized> Fanout<'a, C> {
    pub fn new(control: &'a C, active: &'a ActiveBoards) -> Self {
        Self {
            control,
            active,
            report: FanoutReport::default(),
        }
    }

    pub fn report(&self) -> &FanoutReport {
        &self.report
    }

    pub fn into_report(self) -> FanoutReport {
        self.report
    }

    /// Send `payload` to the stream digitizing `dsig`. Returns false if the
    /// signal doesn't exist or its board isn't active, in which case nothing
    /// is sent.
    pub fn signal(&mut self, category: &str, dsig: usize, payload: &Payload) -> bool {
        let Some(loc) = try_dsig_to_feng(dsig).filter(|l| self.active.contains(l.board)) else {
            self.report.skipped += 1;
            return false;
        };
        let result = self.control.call(
            loc.board,
            payload.block,
            payload.method,
            payload.for_stream(loc.stream),
            CONFIG_TIMEOUT,
        );
        self.report.record(category, Subject::Signal(dsig), result);
        true
    }

    /// Send a board-wide `payload` once to every active board
    pub fn boards(&mut self, category: &str, payload: &Payload) {
        for board in self.active.iter() {
            let result = self.control.call(
                board,
                payload.block,
                payload.method,
                Value::Object(payload.kwargs.clone()),
                CONFIG_TIMEOUT,
            );
            self.report.record(category, Subject::Board(board), result);
        }
    }

    /// Apply one setting to every member of a group, in order, marking the
    /// members on active boards as assigned
    pub fn grouped(
        &mut self,
        category: &str,
        members: &[usize],
        payload: &Payload,
        assigned: &mut AssignedSet,
    ) {
        for &dsig in members {
            if self.signal(category, dsig, payload) && !assigned.insert(dsig) {
                warn!("{category}: digital signal {dsig} was already assigned, overwriting");
            }
        }
    }

    /// Apply `payload` to every digital signal that isn't in `assigned`
    pub fn default_to_unassigned(
        &mut self,
        category: &str,
        assigned: &AssignedSet,
        payload: &Payload,
    ) -> usize {
        let mut n = 0;
        for dsig in (0..SIGNALS).filter(|d| !assigned.contains(d)) {
            if self.signal(category, dsig, payload) {
                n += 1;
            }
        }
        debug!("{category}: defaulted {n} signals");
        n
    }

    /// Select the zero source for every flagged signal and the ADC for every
    /// other one. Returns how many of each were sent.
    pub fn unused_inputs(&mut self, unused: &[bool]) -> (usize, usize) {
        let zero = Payload::use_zero();
        let adc = Payload::use_adc();
        let mut counts = (0, 0);
        for (dsig, &flag) in unused.iter().enumerate() {
            if flag {
                if self.signal("use_zero", dsig, &zero) {
                    counts.0 += 1;
                }
            } else if self.signal("use_adc", dsig, &adc) {
                counts.1 += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{
        testing::{ack, Recorder},
        Target,
    };
    use std::collections::BTreeSet;

    fn stream_of(kwargs: &Value) -> usize {
        kwargs["stream"].as_u64().unwrap() as usize
    }

    #[test]
    fn test_grouped_skips_inactive_boards() {
        let control = Recorder::new();
        let active = ActiveBoards::new([1, 2, 3]).unwrap();
        let mut fanout = Fanout::new(&control, &active);
        let mut assigned = AssignedSet::new();
        fanout.grouped("eq1", &[700, 75, 5], &Payload::eq_coeffs(&[1.0, 2.0]), &mut assigned);

        let sent = control.calls("eq", "set_coeffs");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].target, Target::Unit(2));
        assert_eq!(stream_of(&sent[0].kwargs), 11);
        assert_eq!(sent[0].kwargs["coeffs"], json!([1.0, 2.0]));
        assert_eq!(sent[1].target, Target::Unit(1));
        assert_eq!(stream_of(&sent[1].kwargs), 5);
        assert_eq!(assigned, BTreeSet::from([5, 75]));
        assert_eq!(fanout.report().skipped, 1);
        assert!(fanout.report().is_clean());
    }

    #[test]
    fn test_default_fills_the_rest() {
        let control = Recorder::new();
        let active = ActiveBoards::all();
        let mut fanout = Fanout::new(&control, &active);
        let mut assigned = AssignedSet::new();
        let groups: [&[usize]; 3] = [&[0, 1, 2], &[64, 100], &[703, 1]];
        for (k, group) in groups.iter().enumerate() {
            fanout.grouped(
                &format!("eq{k}"),
                group,
                &Payload::eq_coeffs(&[k as f64]),
                &mut assigned,
            );
        }
        let union: BTreeSet<usize> = groups.iter().flat_map(|g| g.iter().copied()).collect();
        assert_eq!(assigned, union);

        let before = control.sent().len();
        let n = fanout.default_to_unassigned("eq default", &assigned, &Payload::eq_coeffs(&[0.0]));
        assert_eq!(n, SIGNALS - union.len());
        let defaulted: Vec<_> = control.sent()[before..]
            .iter()
            .map(|s| match s.target {
                Target::Unit(b) => (b - 1) * 64 + stream_of(&s.kwargs),
                Target::All => panic!("Defaults are never broadcast"),
            })
            .collect();
        assert_eq!(defaulted.len(), n);
        assert!(defaulted.iter().all(|d| !union.contains(d)));
    }

    #[test]
    fn test_unused_inputs_partition() {
        let control = Recorder::new();
        let active = ActiveBoards::all();
        let mut fanout = Fanout::new(&control, &active);
        let unused: Vec<bool> = (0..SIGNALS).map(|i| i % 7 == 0).collect();
        let (zero, adc) = fanout.unused_inputs(&unused);
        assert_eq!(zero + adc, SIGNALS);
        assert_eq!(zero, unused.iter().filter(|f| **f).count());
        assert_eq!(control.calls("input", "use_zero").len(), zero);
        assert_eq!(control.calls("input", "use_adc").len(), adc);
        assert_eq!(control.sent().len(), SIGNALS);
    }

    #[test]
    fn test_unused_inputs_respect_active_boards() {
        let control = Recorder::new();
        let active = ActiveBoards::new([11]).unwrap();
        let mut fanout = Fanout::new(&control, &active);
        let (zero, adc) = fanout.unused_inputs(&[false; SIGNALS]);
        assert_eq!((zero, adc), (0, 64));
        assert_eq!(fanout.report().skipped, SIGNALS - 64);
    }

    #[test]
    fn test_boards_once_each() {
        let control = Recorder::new();
        let active = ActiveBoards::new([2, 9]).unwrap();
        let mut fanout = Fanout::new(&control, &active);
        fanout.boards("fft shift", &Payload::fft_shift(0x1FFC));
        let sent = control.calls("pfb", "set_fft_shift");
        assert_eq!(
            sent.iter().map(|s| s.target).collect::<Vec<_>>(),
            vec![Target::Unit(2), Target::Unit(9)]
        );
        assert_eq!(sent[0].kwargs, json!({"shift": 0x1FFC}));
    }

    #[test]
    fn test_failures_are_recorded_and_continue() {
        let control = Recorder::with_responder(|sent| {
            if sent.target == Target::Unit(2) {
                Ok([(
                    2,
                    Err(ControlError::Remote {
                        unit: 2,
                        status: "error".to_owned(),
                        response: "boom".to_owned(),
                    }),
                )]
                .into())
            } else {
                ack(sent)
            }
        });
        let active = ActiveBoards::all();
        let mut fanout = Fanout::new(&control, &active);
        let mut assigned = AssignedSet::new();
        fanout.grouped("eq3", &[1, 65, 129], &Payload::eq_coeffs(&[]), &mut assigned);
        let report = fanout.into_report();
        assert_eq!(report.issued, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subject, Subject::Signal(65));
        assert_eq!(assigned.len(), 3);
    }

    #[test]
    fn test_nonexistent_signal_is_skipped() {
        let control = Recorder::new();
        let active = ActiveBoards::all();
        let mut fanout = Fanout::new(&control, &active);
        assert!(!fanout.signal("delay", SIGNALS, &Payload::delay(12)));
        assert!(control.sent().is_empty());
        assert_eq!(fanout.report().skipped, 1);
    }

    #[test]
    fn test_missing_reply_is_a_failure() {
        let control = Recorder::with_responder(|_| Ok(Default::default()));
        let active = ActiveBoards::all();
        let mut fanout = Fanout::new(&control, &active);
        fanout.signal("delay", 10, &Payload::delay(12));
        let report = fanout.into_report();
        assert!(matches!(
            report.failures[0].error,
            ControlError::NoResponse { unit: 1, .. }
        ));
    }
}
