use std::io::{self, BufRead, Write};

use chrono::{DateTime, Local};
use shared::hooks::{ConfirmPrompt, ConnectionListener, LogSink};
use tracing::info;

pub fn format_log_line(timestamp: DateTime<Local>, message: &str) -> String {
    format!("[{}] {message}", timestamp.format("%H:%M:%S"))
}

/// Operator log on stdout.
pub struct ConsoleLog;

impl LogSink for ConsoleLog {
    fn log(&self, timestamp: DateTime<Local>, message: &str) {
        println!("{}", format_log_line(timestamp, message));
    }
}

pub struct ConsoleConnectionListener;

impl ConnectionListener for ConsoleConnectionListener {
    fn on_connection_changed(&self, connected: bool) {
        info!(connected, "connection state changed");
    }
}

/// Asks on stdin unless `--yes` was given.
pub struct StdinConfirm {
    pub assume_yes: bool,
}

impl ConfirmPrompt for StdinConfirm {
    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        print!("{message} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "s" | "si"
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn log_lines_carry_wall_clock_time() {
        let at = Local
            .with_ymd_and_hms(2024, 5, 1, 9, 3, 7)
            .single()
            .expect("unambiguous");
        assert_eq!(
            format_log_line(at, "[SERIAL] PRESET: HOME: ALL:90,90,90,90,90,90"),
            "[09:03:07] [SERIAL] PRESET: HOME: ALL:90,90,90,90,90,90"
        );
    }

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(is_yes("si"));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
        assert!(StdinConfirm { assume_yes: true }.confirm("Delete?"));
    }
}
