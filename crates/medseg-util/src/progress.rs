//! Console progress bar for batch loops.

use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

/// Number of cells in the bar itself.
pub const TOTAL_BAR_LENGTH: usize = 65;

const DEFAULT_TERMINAL_WIDTH: usize = 80;

/// Terminal width from `COLUMNS`, falling back to 80.
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_TERMINAL_WIDTH)
}

/// Formats a duration using at most two units out of `D`, `h`, `m`, `s`, `ms`.
pub fn format_duration(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / 86_400;
    seconds -= days * 86_400;
    let hours = seconds / 3_600;
    seconds -= hours * 3_600;
    let minutes = seconds / 60;
    seconds -= minutes * 60;
    let millis = u64::from(duration.subsec_millis());

    let units = [
        (days, "D"),
        (hours, "h"),
        (minutes, "m"),
        (seconds, "s"),
        (millis, "ms"),
    ];
    let formatted: String = units
        .iter()
        .filter(|(value, _)| *value > 0)
        .take(2)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();

    if formatted.is_empty() {
        "0ms".to_string()
    } else {
        formatted
    }
}

/// A single-line progress bar redrawn in place with carriage returns.
pub struct ProgressBar<W: Write> {
    writer: W,
    total: usize,
    term_width: usize,
    begin: Instant,
    last: Instant,
}

impl ProgressBar<io::Stdout> {
    /// Bar on standard output sized to the terminal.
    pub fn stdout(total: usize) -> Self {
        Self::new(io::stdout(), total, terminal_width())
    }
}

impl<W: Write> ProgressBar<W> {
    pub fn new(writer: W, total: usize, term_width: usize) -> Self {
        let now = Instant::now();
        Self {
            writer,
            total: total.max(1),
            term_width,
            begin: now,
            last: now,
        }
    }

    /// Draws the bar for step `current` (zero-based). Step 0 restarts the
    /// total timer; the last step ends the line.
    pub fn tick(&mut self, current: usize, msg: Option<&str>) -> io::Result<()> {
        let now = Instant::now();
        if current == 0 {
            self.begin = now;
        }

        let cur_len = TOTAL_BAR_LENGTH * current / self.total;
        let rest_len = TOTAL_BAR_LENGTH.saturating_sub(cur_len + 1);

        let mut line = String::with_capacity(self.term_width + TOTAL_BAR_LENGTH);
        line.push_str(" [");
        line.push_str(&"=".repeat(cur_len));
        line.push('>');
        line.push_str(&".".repeat(rest_len));
        line.push(']');

        let step = now.duration_since(self.last);
        self.last = now;
        let elapsed = now.duration_since(self.begin);

        let mut status = format!(
            "  Step: {} | Tot: {}",
            format_duration(step),
            format_duration(elapsed)
        );
        if let Some(msg) = msg {
            status.push_str(" | ");
            status.push_str(msg);
        }
        line.push_str(&status);

        let padding = self
            .term_width
            .saturating_sub(TOTAL_BAR_LENGTH + status.len() + 3);
        line.push_str(&" ".repeat(padding));

        // Move back to the middle of the bar for the counter.
        let back = (self.term_width + 2).saturating_sub(TOTAL_BAR_LENGTH / 2);
        line.push_str(&"\u{8}".repeat(back));
        line.push_str(&format!(" {}/{} ", current + 1, self.total));

        line.push(if current + 1 < self.total { '\r' } else { '\n' });

        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_keeps_two_largest_units() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h2m");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1D1h");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
    }

    #[test]
    fn intermediate_ticks_end_with_carriage_return() {
        let mut bar = ProgressBar::new(Vec::new(), 3, 120);
        bar.tick(0, Some("Loss: 0.512")).unwrap();
        let out = String::from_utf8(bar.into_inner()).unwrap();

        assert!(out.starts_with(" [>"));
        assert!(out.contains("Loss: 0.512"));
        assert!(out.contains(" 1/3 "));
        assert!(out.ends_with('\r'));
    }

    #[test]
    fn last_tick_ends_the_line() {
        let mut bar = ProgressBar::new(Vec::new(), 2, 120);
        bar.tick(0, None).unwrap();
        bar.tick(1, None).unwrap();
        let out = String::from_utf8(bar.into_inner()).unwrap();

        assert!(out.contains(" 2/2 "));
        assert!(out.ends_with('\n'));
        assert_eq!(out.matches('\n').count(), 1);
    }

    #[test]
    fn bar_fills_proportionally() {
        let mut bar = ProgressBar::new(Vec::new(), 5, 120);
        bar.tick(4, None).unwrap();
        let out = String::from_utf8(bar.into_inner()).unwrap();

        let filled = TOTAL_BAR_LENGTH * 4 / 5;
        assert!(out.starts_with(&format!(" [{}>", "=".repeat(filled))));
    }
}
