//! Append-only record of every settings load

use hifitime::Epoch;
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

/// Default location of the run log
pub const DEFAULT_RUN_LOG: &str = "/home/pipeline/proj/lwa-shell/mnc_python/data/arxAndF-settings.log";

/// Format an epoch as a human readable UTC timestamp
#[must_use]
pub fn utc_string(epoch: Epoch) -> String {
    let (y, mo, d, h, mi, s, _) = epoch.to_gregorian_utc();
    format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02} UTC")
}

/// The user running us, as far as the environment knows
#[must_use]
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub when: Epoch,
    pub user: String,
    pub settings_file: PathBuf,
    /// The generation time recorded inside the settings file
    pub settings_time: f64,
}

impl RunLogEntry {
    pub fn now(settings_file: &Path, settings_time: f64) -> Result<Self, hifitime::Errors> {
        Ok(Self {
            when: Epoch::now()?,
            user: current_user(),
            settings_file: settings_file.to_owned(),
            settings_time,
        })
    }

    /// Tab separated: time, unix seconds, user, settings file, settings time
    #[must_use]
    pub fn line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            utc_string(self.when),
            self.when.to_unix_seconds(),
            self.user,
            self.settings_file.display(),
            self.settings_time
        )
    }

    pub fn append_to(&self, path: &Path) -> std::io::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", self.line())
    }
}
