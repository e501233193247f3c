//! Single-line progress reporting for sync runs.
//!
//! Workers call [`ProgressReporter::report`] as each entry completes; the
//! reporter redraws one status line in place:
//!
//! ```text
//! [#########---------------------]  30% (3/10) updated ...ets/textures/terrain.bin
//! ```
//!
//! Line layout lives in [`render_line`], which is independent of the terminal.
//! Anything else sharing the stream (log lines) goes through
//! [`ProgressReporter::write_above`] so it never lands inside the status line.

use std::io::{self, IsTerminal, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Width of the bracketed bar, excluding brackets.
pub const BAR_WIDTH: usize = 30;

const ELLIPSIS: &str = "...";

/// Latest state shown on the status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub processed: usize,
    pub total: usize,
    pub last_action: String,
    pub last_path: String,
}

impl ProgressState {
    /// Percent complete; an empty run counts as finished.
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            (self.processed * 100 / self.total).min(100)
        }
    }
}

/// Render the status line for a terminal `width` columns wide.
///
/// The result is exactly `width - 1` characters so it overwrites the previous
/// line without wrapping. The path is shortened from the left, keeping its
/// file name.
pub fn render_line(width: usize, state: &ProgressState) -> String {
    let percent = state.percent();
    let filled = percent * BAR_WIDTH / 100;
    let prefix = format!(
        "[{}{}] {:>3}% ({}/{}) {} ",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        percent,
        state.processed,
        state.total,
        state.last_action
    );

    let usable = width.saturating_sub(1);
    let room = usable.saturating_sub(prefix.chars().count());
    let line: String = prefix
        .chars()
        .chain(truncate_left(&state.last_path, room).chars())
        .take(usable)
        .collect();

    let len = line.chars().count();
    line + &" ".repeat(usable - len)
}

/// Keep the rightmost `max` characters of `text`, marking the cut with an ellipsis.
fn truncate_left(text: &str, max: usize) -> String {
    let len = text.chars().count();
    if len <= max {
        return text.to_string();
    }
    if max <= ELLIPSIS.len() {
        return text.chars().skip(len - max).collect();
    }
    let keep = max - ELLIPSIS.len();
    let tail: String = text.chars().skip(len - keep).collect();
    format!("{}{}", ELLIPSIS, tail)
}

enum LineWidth {
    /// Query the terminal on every redraw, falling back when stderr is not a tty
    Terminal { fallback: usize },
    Fixed(usize),
}

impl LineWidth {
    fn columns(&self) -> usize {
        match self {
            LineWidth::Fixed(width) => *width,
            LineWidth::Terminal { fallback } => {
                if !std::io::stderr().is_terminal() {
                    return *fallback;
                }
                crossterm::terminal::size()
                    .ok()
                    .map(|(cols, _)| cols as usize)
                    .filter(|cols| *cols > 0)
                    .unwrap_or(*fallback)
            }
        }
    }
}

struct ReporterInner {
    state: ProgressState,
    out: Option<Box<dyn Write + Send>>,
    /// A status line is currently on screen
    drawn: bool,
}

/// Thread-safe status line renderer.
pub struct ProgressReporter {
    inner: Mutex<ReporterInner>,
    width: LineWidth,
}

impl ProgressReporter {
    /// Render to stderr, sized to the terminal.
    pub fn stderr(fallback_width: usize) -> Self {
        Self::build(
            Some(Box::new(std::io::stderr())),
            LineWidth::Terminal {
                fallback: fallback_width,
            },
        )
    }

    /// Render to an arbitrary writer at a fixed width.
    pub fn with_writer(out: Box<dyn Write + Send>, width: usize) -> Self {
        Self::build(Some(out), LineWidth::Fixed(width))
    }

    /// Track state without drawing anything.
    pub fn hidden() -> Self {
        Self::build(None, LineWidth::Fixed(0))
    }

    fn build(out: Option<Box<dyn Write + Send>>, width: LineWidth) -> Self {
        Self {
            inner: Mutex::new(ReporterInner {
                state: ProgressState::default(),
                out,
                drawn: false,
            }),
            width,
        }
    }

    /// Record a completed entry and redraw the line.
    pub fn report(&self, processed: usize, total: usize, action: &str, path: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Completions can arrive out of order; never move the counter backwards
        inner.state.processed = inner.state.processed.max(processed);
        inner.state.total = total;
        inner.state.last_action = action.to_string();
        inner.state.last_path = path.to_string();

        let ReporterInner { state, out, drawn } = &mut *inner;
        if let Some(out) = out {
            let line = render_line(self.width.columns(), state);
            let _ = write!(out, "\r{}", line);
            let _ = out.flush();
            *drawn = true;
        }
    }

    /// Erase the status line.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(out) = inner.out.as_mut() {
            let blank = " ".repeat(self.width.columns().saturating_sub(1));
            let _ = write!(out, "\r{}\r", blank);
            let _ = out.flush();
        }
        inner.drawn = false;
    }

    /// Write `buf` on its own line, moving the status line below it.
    ///
    /// A hidden reporter passes the bytes straight to stderr.
    pub fn write_above(&self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ReporterInner { state, out, drawn } = &mut *inner;
        let Some(out) = out else {
            return io::stderr().write_all(buf);
        };

        if !*drawn {
            out.write_all(buf)?;
            return out.flush();
        }

        let width = self.width.columns();
        write!(out, "\r{}\r", " ".repeat(width.saturating_sub(1)))?;
        out.write_all(buf)?;
        write!(out, "\r{}", render_line(width, state))?;
        out.flush()
    }

    pub fn snapshot(&self) -> ProgressState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
