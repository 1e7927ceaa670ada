//! Output helpers: human text vs machine-readable JSON.

use aqua_core::Error;
use chrono::Utc;

/// Whether JSON output is in effect for this invocation.
///
/// The `--json` flag and the `AQUA_JSON` environment variable are
/// equivalent; either enables it.
#[must_use]
pub fn json_mode(flag: bool) -> bool {
    flag || aqua_core::config::json_output_requested()
}

/// Prints a serializable value as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Prints an error in the requested format and returns its exit code.
#[must_use]
pub fn report_error(json: bool, error: &Error) -> u8 {
    if json {
        eprintln!(
            "{}",
            serde_json::json!({
                "error": error.kind(),
                "message": error.to_string(),
            })
        );
    } else {
        eprintln!("error: {error}");
    }
    error.exit_code()
}

/// Formats an RFC 3339 timestamp as a relative "3m ago" string.
#[must_use]
pub fn time_ago(timestamp: &str) -> String {
    let then = aqua_core::util::parse_rfc3339(timestamp);
    let seconds = (Utc::now() - then).num_seconds();

    if seconds < 0 {
        "in the future".to_string()
    } else if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}

/// Truncates text for table cells.
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// First 8 characters of an identifier, for compact display.
#[must_use]
pub fn short(id: &str) -> String {
    id.chars().take(8).collect()
}
