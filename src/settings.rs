//! The settings file handed to the loader

use crate::{
    arx::{board_command, ArxError},
    common::{ADC_CLOCK, DELAY_OFFSET, DEFAULT_FFT_SHIFT, SIGNALS},
};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// Number of equalization categories (`eq0` through `eq6`)
pub const EQ_GROUPS: usize = 7;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Couldn't read settings file {path:?} - {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Couldn't decode toml structure from {0:?}:\n{1}")]
    Toml(PathBuf, toml::de::Error),
    #[error("Couldn't decode json structure from {0:?}:\n{1}")]
    Json(PathBuf, serde_json::Error),
    #[error("Settings file {0:?} must end in .toml or .json")]
    UnknownType(PathBuf),
    #[error("{key} lists digital signal {dsig}, but there are only 704 of them")]
    SignalOutOfRange { key: String, dsig: usize },
    #[error("{key} has {len} entries, more than the 704 digital signals")]
    TooLong { key: String, len: usize },
    #[error("unused must flag all 704 digital signals, but has {0} entries")]
    UnusedLength(usize),
    #[error("coef must hold at least the reference profile")]
    NoCoefficients,
    #[error("eq{0} is present, but coef has no profile {0}")]
    MissingProfile(usize),
    #[error("adrs names {0} ARX boards, but settings has {1}")]
    ArxMismatch(usize, usize),
    #[error("adrs and settings must be given together")]
    ArxIncomplete,
    #[error("Bad settings for ARX address {address} - {source}")]
    Arx { address: usize, source: ArxError },
}

/// A flag that may be written as a bool, as 0/1 or as 0.0/1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Flag {
    #[must_use]
    pub fn is_set(self) -> bool {
        match self {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
            Flag::Float(f) => f != 0.0,
        }
    }
}

/// A whole number, which settings exported from double-precision arrays
/// write as `3.0`
#[derive(Deserialize)]
#[serde(untagged)]
enum Whole {
    Int(u64),
    Float(f64),
}

impl Whole {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn into_u64<E: de::Error>(self) -> Result<u64, E> {
        match self {
            Whole::Int(i) => Ok(i),
            Whole::Float(f) if f.fract() == 0.0 && (0.0..=u64::MAX as f64).contains(&f) => {
                Ok(f as u64)
            }
            Whole::Float(f) => Err(E::custom(format!("{f} isn't a non-negative whole number"))),
        }
    }

    fn into_int<T: TryFrom<u64>, E: de::Error>(self) -> Result<T, E> {
        let n = self.into_u64()?;
        T::try_from(n).map_err(|_| E::custom(format!("{n} is out of range")))
    }
}

fn whole_list<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<usize>>, D::Error> {
    Option::<Vec<Whole>>::deserialize(d)?
        .map(|v| v.into_iter().map(Whole::into_int).collect())
        .transpose()
}

fn whole_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    Option::<Whole>::deserialize(d)?.map(Whole::into_int).transpose()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// When these settings were generated, in seconds since the unix epoch
    pub time: f64,
    #[serde(rename = "fftShift", default, deserialize_with = "whole_u32")]
    pub fft_shift: Option<u32>,
    /// Equalization profiles, `coef[k]` goes with `eqk`
    pub coef: Vec<Vec<f64>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq0: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq1: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq2: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq3: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq4: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq5: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "whole_list")]
    pub eq6: Option<Vec<usize>>,
    /// Cable delay of each digital signal in ns
    #[serde(default)]
    pub delay_dsig: Option<Vec<f64>>,
    #[serde(default)]
    pub unused: Option<Vec<Flag>>,
    /// ARX board addresses
    #[serde(default, deserialize_with = "whole_list")]
    pub adrs: Option<Vec<usize>>,
    /// Per ARX board, per channel: first, second and split attenuation (dB) and filter
    #[serde(rename = "settings", default)]
    pub arx_settings: Option<Vec<Vec<[f64; 4]>>>,
}

impl Settings {
    /// Read and validate a settings file, picking the format from its extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let settings: Self = match ext.as_deref() {
            Some("toml") => {
                debug!("Parsing toml file...");
                toml::from_str(&contents).map_err(|e| SettingsError::Toml(path.to_owned(), e))?
            }
            Some("json") => {
                debug!("Parsing json file...");
                serde_json::from_str(&contents)
                    .map_err(|e| SettingsError::Json(path.to_owned(), e))?
            }
            _ => return Err(SettingsError::UnknownType(path.to_owned())),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The equalization groups that are present, with their category number
    pub fn eq_groups(&self) -> impl Iterator<Item = (usize, &[usize])> {
        let groups: [&Option<Vec<usize>>; EQ_GROUPS] = [
            &self.eq0, &self.eq1, &self.eq2, &self.eq3, &self.eq4, &self.eq5, &self.eq6,
        ];
        groups
            .into_iter()
            .enumerate()
            .filter_map(|(k, g)| g.as_deref().map(|g| (k, g)))
    }

    #[must_use]
    pub fn fft_shift(&self) -> u32 {
        self.fft_shift.unwrap_or(DEFAULT_FFT_SHIFT)
    }

    /// Per-signal unused flags, if given
    #[must_use]
    pub fn unused_flags(&self) -> Option<Vec<bool>> {
        self.unused
            .as_ref()
            .map(|u| u.iter().map(|f| f.is_set()).collect())
    }

    /// ARX addresses paired with their channel settings, if given
    #[must_use]
    pub fn arx(&self) -> Option<(&[usize], &[Vec<[f64; 4]>])> {
        match (&self.adrs, &self.arx_settings) {
            (Some(a), Some(s)) => Some((a.as_slice(), s.as_slice())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.coef.is_empty() {
            return Err(SettingsError::NoCoefficients);
        }
        for (k, group) in self.eq_groups() {
            if k >= self.coef.len() {
                return Err(SettingsError::MissingProfile(k));
            }
            if let Some(&dsig) = group.iter().find(|&&d| d >= SIGNALS) {
                return Err(SettingsError::SignalOutOfRange {
                    key: format!("eq{k}"),
                    dsig,
                });
            }
        }
        if let Some(delays) = &self.delay_dsig {
            if delays.len() > SIGNALS {
                return Err(SettingsError::TooLong {
                    key: "delay_dsig".to_owned(),
                    len: delays.len(),
                });
            }
        }
        if let Some(unused) = &self.unused {
            if unused.len() != SIGNALS {
                return Err(SettingsError::UnusedLength(unused.len()));
            }
        }
        match (&self.adrs, &self.arx_settings) {
            (Some(adrs), Some(settings)) => {
                if adrs.len() != settings.len() {
                    return Err(SettingsError::ArxMismatch(adrs.len(), settings.len()));
                }
                for (&address, channels) in adrs.iter().zip(settings) {
                    board_command(channels)
                        .map_err(|source| SettingsError::Arx { address, source })?;
                }
            }
            (None, None) => (),
            _ => return Err(SettingsError::ArxIncomplete),
        }
        Ok(())
    }
}

/// Cable delays converted to the delays each F-engine input should apply
#[derive(Debug, Clone, PartialEq)]
pub struct DelayPlan {
    /// Delay to apply to each digital signal, in ADC clocks
    pub applied: Vec<i64>,
    pub max_delay_ns: f64,
    pub max_delay_clocks: i64,
    pub max_relative_clocks: i64,
}

impl DelayPlan {
    /// Pad every signal out to the longest cable, plus the minimum offset.
    /// Returns None if there are no delays.
    #[must_use]
    pub fn from_ns(delays_ns: &[f64]) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let clocks: Vec<i64> = delays_ns
            .iter()
            .map(|ns| (ns * 1e-9 * ADC_CLOCK).round() as i64)
            .collect();
        let max_delay_clocks = *clocks.iter().max()?;
        let max_delay_ns = delays_ns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let relative: Vec<i64> = clocks.iter().map(|c| max_delay_clocks - c).collect();
        let max_relative_clocks = relative.iter().copied().max().unwrap_or_default();
        let applied = relative.into_iter().map(|r| r + DELAY_OFFSET).collect();
        Some(Self {
            applied,
            max_delay_ns,
            max_delay_clocks,
            max_relative_clocks,
        })
    }

    #[must_use]
    pub fn max_applied(&self) -> i64 {
        self.applied.iter().copied().max().unwrap_or_default()
    }

    #[must_use]
    pub fn min_applied(&self) -> i64 {
        self.applied.iter().copied().min().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
time = 1686700000.0
coef = [[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]
eq1 = [0, 5, 700]
eq2 = [64]
"#;

    fn write_tmp(ext: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(ext).tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_toml() {
        let f = write_tmp(".toml", MINIMAL);
        let s = Settings::from_file(f.path()).unwrap();
        assert_eq!(s.fft_shift(), DEFAULT_FFT_SHIFT);
        let groups: Vec<_> = s.eq_groups().collect();
        assert_eq!(groups, vec![(1, &[0, 5, 700][..]), (2, &[64][..])]);
        assert!(s.unused_flags().is_none());
        assert!(s.arx().is_none());
        assert!(s.delay_dsig.is_none());
    }

    #[test]
    fn test_json_with_everything() {
        let mut unused = vec![0; SIGNALS];
        unused[3] = 1;
        let doc = serde_json::json!({
            "time": 1.0,
            "fftShift": 0x1FFF,
            "coef": [[1.0]],
            "eq0": [1, 2],
            "delay_dsig": [10.0, 20.0],
            "unused": unused,
            "adrs": [15],
            "settings": [vec![[0.0, 0.0, 0.0, 1.0]; 16]],
        });
        let f = write_tmp(".json", &doc.to_string());
        let s = Settings::from_file(f.path()).unwrap();
        assert_eq!(s.fft_shift(), 0x1FFF);
        let flags = s.unused_flags().unwrap();
        assert_eq!(flags.iter().filter(|f| **f).count(), 1);
        assert!(flags[3]);
        let (adrs, arx) = s.arx().unwrap();
        assert_eq!(adrs, &[15]);
        assert_eq!(arx[0].len(), 16);
    }

    #[test]
    fn test_bool_flags() {
        assert!(Flag::Bool(true).is_set());
        assert!(Flag::Int(1).is_set());
        assert!(!Flag::Int(0).is_set());
        let flags: Vec<Flag> = serde_json::from_str("[true, 0, 1, false]").unwrap();
        assert_eq!(
            flags.iter().map(|f| f.is_set()).collect::<Vec<_>>(),
            vec![true, false, true, false]
        );
        let flags: Vec<Flag> = serde_json::from_str("[1.0, 0.0]").unwrap();
        assert!(flags[0].is_set());
        assert!(!flags[1].is_set());
    }

    #[test]
    fn test_float_encoded_integers() {
        let mut unused = vec![0.0; SIGNALS];
        unused[5] = 1.0;
        let doc = serde_json::json!({
            "time": 1.0,
            "fftShift": 8188.0,
            "coef": [[1.0], [2.0]],
            "eq1": [3.0, 64.0],
            "unused": unused,
            "adrs": [15.0],
            "settings": [vec![[0.0, 0.0, 0.0, 1.0]; 16]],
        });
        let f = write_tmp(".json", &doc.to_string());
        let s = Settings::from_file(f.path()).unwrap();
        assert_eq!(s.fft_shift(), 0x1FFC);
        assert_eq!(s.eq1, Some(vec![3, 64]));
        assert_eq!(s.adrs, Some(vec![15]));
        let flags = s.unused_flags().unwrap();
        assert!(flags[5]);
        assert_eq!(flags.iter().filter(|f| **f).count(), 1);

        let toml_doc = "time = 1.0\ncoef = [[1.0], [2.0]]\neq1 = [3.0, 7]\n";
        let s: Settings = toml::from_str(toml_doc).unwrap();
        assert_eq!(s.eq1, Some(vec![3, 7]));
    }

    #[test]
    fn test_fractional_index_rejected() {
        let doc = r#"{"time": 1.0, "coef": [[1.0]], "eq0": [3.5]}"#;
        let f = write_tmp(".json", doc);
        assert!(matches!(
            Settings::from_file(f.path()),
            Err(SettingsError::Json(..))
        ));
        let doc = r#"{"time": 1.0, "coef": [[1.0]], "fftShift": -1}"#;
        let f = write_tmp(".json", doc);
        assert!(matches!(
            Settings::from_file(f.path()),
            Err(SettingsError::Json(..))
        ));
    }

    #[test]
    fn test_validation() {
        let base: Settings = toml::from_str(MINIMAL).unwrap();
        assert!(base.validate().is_ok());

        let mut s = base.clone();
        s.coef.clear();
        assert!(matches!(s.validate(), Err(SettingsError::NoCoefficients)));

        let mut s = base.clone();
        s.eq6 = Some(vec![1]);
        assert!(matches!(s.validate(), Err(SettingsError::MissingProfile(6))));

        let mut s = base.clone();
        s.eq0 = Some(vec![704]);
        assert!(matches!(
            s.validate(),
            Err(SettingsError::SignalOutOfRange { dsig: 704, .. })
        ));

        let mut s = base.clone();
        s.unused = Some(vec![Flag::Int(0); 10]);
        assert!(matches!(s.validate(), Err(SettingsError::UnusedLength(10))));

        let mut s = base.clone();
        s.adrs = Some(vec![1, 2]);
        assert!(matches!(s.validate(), Err(SettingsError::ArxIncomplete)));
        s.arx_settings = Some(vec![vec![[0.0, 0.0, 0.0, 0.0]; 16]]);
        assert!(matches!(s.validate(), Err(SettingsError::ArxMismatch(2, 1))));

        let mut s = base;
        s.adrs = Some(vec![7]);
        s.arx_settings = Some(vec![vec![[1.0, 0.0, 0.0, 0.0]; 16]]);
        assert!(matches!(
            s.validate(),
            Err(SettingsError::Arx { address: 7, .. })
        ));
    }

    #[test]
    fn test_unknown_extension() {
        let f = write_tmp(".mat", MINIMAL);
        assert!(matches!(
            Settings::from_file(f.path()),
            Err(SettingsError::UnknownType(_))
        ));
    }

    #[test]
    fn test_delay_plan() {
        // 1 clock is ~5.1 ns
        let plan = DelayPlan::from_ns(&[0.0, 51.02, 102.04, 25.0]).unwrap();
        assert_eq!(plan.max_delay_clocks, 20);
        assert_eq!(plan.applied, vec![30, 20, 10, 25]);
        assert_eq!(plan.max_relative_clocks, 20);
        assert_eq!(plan.min_applied(), DELAY_OFFSET);
        assert_eq!(plan.max_applied(), 30);
        approx::assert_abs_diff_eq!(plan.max_delay_ns, 102.04);
        assert!(DelayPlan::from_ns(&[]).is_none());
    }
}
