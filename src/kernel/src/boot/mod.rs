//! Boot progress reporting.
//!
//! Linux-style `[ OK ]` status lines, routed through the `log` facade under
//! the `boot` target so they land wherever the installed logger writes.

use log::Level;

/// Boot status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success - `[ OK ]`
    Ok,
    /// Failure - `[FAIL]`
    Fail,
    /// Warning - `[WARN]`
    Warn,
    /// Informational - `[INFO]`
    Info,
}

impl Status {
    /// Bracketed tag printed before the message.
    pub fn tag(self) -> &'static str {
        match self {
            Status::Ok => "[ OK ]",
            Status::Fail => "[FAIL]",
            Status::Warn => "[WARN]",
            Status::Info => "[INFO]",
        }
    }

    fn level(self) -> Level {
        match self {
            Status::Ok | Status::Info => Level::Info,
            Status::Warn => Level::Warn,
            Status::Fail => Level::Error,
        }
    }
}

/// Log a boot stage with status.
///
/// Format: `[ OK ] Message text`
pub fn log(status: Status, message: &str) {
    log::log!(target: "boot", status.level(), "{} {}", status.tag(), message);
}

/// Log an indented detail line under the previous stage.
pub fn log_detail(message: &str) {
    log::info!(target: "boot", "       {}", message);
}

/// Log the outcome of a fallible boot step and pass the result through.
pub fn check<T, E: core::fmt::Display>(what: &str, result: Result<T, E>) -> Result<T, E> {
    match &result {
        Ok(_) => log(Status::Ok, what),
        Err(err) => log(Status::Fail, &alloc::format!("{}: {}", what, err)),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_line_up() {
        for status in [Status::Ok, Status::Fail, Status::Warn, Status::Info] {
            assert_eq!(status.tag().len(), 6);
        }
        assert_eq!(Status::Fail.level(), Level::Error);
    }

    #[test]
    fn check_passes_results_through() {
        assert_eq!(check::<u8, &str>("step", Ok(3)), Ok(3));
        assert_eq!(check::<u8, &str>("step", Err("broken")), Err("broken"));
    }
}
