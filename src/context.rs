//! Per-run settings handed to every component that logs.

use tracing::Level;

/// Operator-selected verbosity (`-v` count).
///
/// Some messages are only worth printing when asked for: an empty
/// result, skipped records, refused kernel commands. Components check
/// the level here instead of a process-wide flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(pub u8);

impl Verbosity {
    /// Report no-op runs ("nothing to do").
    pub fn notices(self) -> bool {
        self.0 >= 1
    }

    /// Report skipped records and intentionally skipped steps.
    pub fn details(self) -> bool {
        self.0 >= 2
    }

    /// Report every refused kernel command with its stderr.
    pub fn commands(self) -> bool {
        self.0 >= 3
    }

    /// Subscriber level for this verbosity.
    pub fn log_level(self, quiet: bool) -> Level {
        if quiet {
            return Level::ERROR;
        }
        match self.0 {
            0 | 1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Settings for one sync invocation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub verbosity: Verbosity,
    /// Request the full remote state instead of a delta
    pub force_full: bool,
}

impl RunContext {
    pub fn with_verbosity(mut self, level: u8) -> Self {
        self.verbosity = Verbosity(level);
        self
    }

    pub fn with_force_full(mut self, force_full: bool) -> Self {
        self.force_full = force_full;
        self
    }
}
