//! Environment-driven runtime configuration: a small explicit config
//! struct rather than a derive-heavy config crate.

use crate::testinjector;

/// Knobs read once at [`crate::runtime::Runtime`] construction time.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the environment variable [`crate::testinjector`] reads to
    /// decide when to inject a synthetic failure. Exposed here (rather
    /// than hard-coded in `testinjector`) so a host process can document
    /// it alongside its own config surface.
    pub error_trigger_var: String,
    /// Directory [`crate::tempfile::create`] uses, mirroring `TMPDIR`.
    pub tmp_dir: String,
    /// The shell a caller should use to run subprocesses, if it cares;
    /// `None` if `SHELL` is unset.
    pub shell: Option<String>,
    /// Shrinks the error-frame chunk capacity to widen the window for
    /// racing restarts under test.
    pub race_test_mode: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            error_trigger_var: std::env::var("DAEMONRT_TEST_ERROR_TRIGGER")
                .unwrap_or_else(|_| "DAEMONRT_TEST_ERROR_TRIGGER".to_owned()),
            tmp_dir: std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_owned()),
            shell: std::env::var("SHELL").ok(),
            race_test_mode: std::env::var("DAEMONRT_TEST_MODE_RACE")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Applies [`RuntimeConfig::race_test_mode`] to the process-wide
    /// error-frame chunk allocator, shrinking its per-chunk frame
    /// capacity to make restart/push/pop races easy to hit in a test run.
    pub fn apply(&self) {
        crate::error::set_race_test_mode(self.race_test_mode);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            error_trigger_var: testinjector::TRIGGER_VAR.to_owned(),
            tmp_dir: "/tmp".to_owned(),
            shell: None,
            race_test_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applying_race_test_mode_flips_the_process_wide_flag() {
        let config = RuntimeConfig {
            race_test_mode: true,
            ..RuntimeConfig::default()
        };
        config.apply();
        assert!(crate::error::race_test_mode());

        crate::error::set_race_test_mode(false);
        assert!(!crate::error::race_test_mode());
    }
}
