//! Timestamped logging with source locations and ANSI colour support.
//!
//! The [`hlog!`] macro writes lines in the format:
//!
//! ```text
//! 20260806T14:02:51.173 - src/session.rs:61 - alice@example.com registered
//! ```
//!
//! When stderr is a terminal, timestamps and source locations are dimmed and
//! identity strings formatted through [`ident`] get a stable colour derived
//! from their content, so the same identity is recognisable across lines.
//!
//! Log output goes to stderr by default.  [`set_writer`] redirects it to any
//! [`std::io::Write`] implementor and disables colour codes, which keeps
//! captured test output clean.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize logging. Call once at startup, before the first log line.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
}

/// Replace the log writer. All subsequent [`hlog!`] output goes to `w`,
/// without ANSI colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Bright, visually distinct colours for identity hashing.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

/// Format an identity with a content-derived colour.
///
/// Identities are short human-readable strings (email-like), so no
/// truncation is applied.
pub fn ident(identity: &str) -> String {
    if colour_enabled() {
        let colour = hash_colour(identity);
        format!("{colour}{identity}{RESET}")
    } else {
        identity.to_string()
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let now = SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`hlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// hlog!("replay: delivered {} queued message(s)", count);
/// hlog!("{} is now online", logging::ident(&identity));
/// ```
#[macro_export]
macro_rules! hlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
