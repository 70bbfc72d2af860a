//! Exit codes for sparcusd.
//!
//! Exit code ranges:
//! - 0: Clean shutdown or successful command
//! - 10-19: Configuration/environment errors (recoverable by user action)
//! - 20-29: Internal errors

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Success (0)
    // ========================================================================
    /// Clean shutdown, or command completed
    Clean = 0,

    // ========================================================================
    // Configuration / Environment Errors (10-19)
    // ========================================================================
    /// Config file missing, unparsable, or invalid
    ConfigError = 10,

    /// Listener could not bind
    BindError = 11,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::BindError => "ERR_BIND",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
