//! Live results table
//!
//! The reporter task samples the latest matrix snapshot on a fixed cadence and
//! redraws the table on the terminal's alternate screen, sized to the window
//! on every frame. Log lines produced meanwhile are held back by `LogHold` and
//! written after the live view closes. When stdout is not a terminal it stays
//! silent until the run ends and prints the table once.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

use super::matrix::JobMatrix;
use crate::core::{CancelToken, GroupId, Status};
use crate::scoring::ContestType;

/// Default redraw period
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Solutions shown side by side before the table wraps
pub const SOLUTIONS_PER_ROW: usize = 8;

const CELL_WIDTH: usize = 15;
const LABEL_WIDTH: usize = 8;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

const ENTER_SCREEN: &str = "\x1b[?1049h\x1b[?25l";
const LEAVE_SCREEN: &str = "\x1b[?25h\x1b[?1049l";
const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J";

nix::ioctl_read_bad!(read_window_size, nix::libc::TIOCGWINSZ, nix::libc::winsize);

/// `(columns, rows)` of the terminal behind stdout
fn terminal_size() -> Option<(usize, usize)> {
    let mut size = nix::libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only fills the winsize it is pointed at
    unsafe { read_window_size(std::io::stdout().as_raw_fd(), &mut size) }.ok()?;
    (size.ws_col > 0 && size.ws_row > 0).then_some((size.ws_col as usize, size.ws_row as usize))
}

/// Solutions that fit side by side in `width` columns, at least one
pub fn solutions_per_row(width: usize) -> usize {
    (width.saturating_sub(LABEL_WIDTH + 2) / (CELL_WIDTH + 1)).clamp(1, SOLUTIONS_PER_ROW)
}

/// Characters a line occupies on screen, ignoring ANSI escape sequences
fn visible_width(line: &str) -> usize {
    let mut width = 0;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequences end with a letter
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            width += 1;
        }
    }
    width
}

/// Terminal rows a line takes once wrapped at `width` columns
fn physical_rows(line: &str, width: usize) -> usize {
    visible_width(line).div_ceil(width.max(1)).max(1)
}

/// Keep the leading lines of `frame` that fit into `height` rows of a `width` wide screen
fn fit_to_screen(frame: &str, width: usize, height: usize) -> String {
    let mut used = 0;
    let mut fitted = String::new();
    for line in frame.lines() {
        used += physical_rows(line, width);
        if used >= height {
            break;
        }
        fitted.push_str(line);
        fitted.push('\n');
    }
    fitted
}

/// Log writer that holds lines back while the live table owns the terminal.
///
/// Installed as the `tracing_subscriber` writer; everything else goes straight to stderr.
#[derive(Debug, Clone, Default)]
pub struct LogHold {
    holding: Arc<AtomicBool>,
    held: Arc<Mutex<Vec<u8>>>,
}

impl LogHold {
    fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    /// Stop holding and write out everything collected so far
    fn release(&self) {
        self.holding.store(false, Ordering::SeqCst);
        let held = match self.held.lock() {
            Ok(mut held) => std::mem::take(&mut *held),
            Err(_) => return,
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(&held);
        let _ = stderr.flush();
    }
}

pub struct LogHoldWriter {
    log: LogHold,
}

impl Write for LogHoldWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.log.holding.load(Ordering::SeqCst) {
            if let Ok(mut held) = self.log.held.lock() {
                held.extend_from_slice(buf);
                return Ok(buf.len());
            }
        }
        std::io::stderr().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for LogHold {
    type Writer = LogHoldWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogHoldWriter { log: self.clone() }
    }
}

/// What the table needs besides the matrix itself
#[derive(Debug, Clone)]
pub struct TableView {
    pub contest: ContestType,
    pub weights: BTreeMap<GroupId, u64>,
    pub per_row: usize,
    pub hide_memory: bool,
}

impl TableView {
    pub fn new(contest: ContestType, weights: BTreeMap<GroupId, u64>) -> Self {
        Self {
            contest,
            weights,
            per_row: SOLUTIONS_PER_ROW,
            hide_memory: false,
        }
    }

    pub fn with_hide_memory(mut self, hide_memory: bool) -> Self {
        self.hide_memory = hide_memory;
        self
    }

    /// Same view with as many solutions per row as `width` columns allow
    fn for_width(&self, width: usize) -> Self {
        Self {
            per_row: solutions_per_row(width),
            ..self.clone()
        }
    }
}

/// Settings of the live reporter task
#[derive(Debug, Clone)]
pub struct Reporter {
    view: TableView,
    live: bool,
    refresh: Duration,
    cpus: usize,
    log: Option<LogHold>,
}

impl Reporter {
    /// Live redraw is enabled when stdout is a terminal
    pub fn new(view: TableView) -> Self {
        Self {
            view,
            live: std::io::stdout().is_terminal(),
            refresh: REFRESH_INTERVAL,
            cpus: 1,
            log: None,
        }
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Hold log output in `log` while the live table is on screen
    pub fn with_log_hold(mut self, log: LogHold) -> Self {
        self.log = Some(log);
        self
    }

    pub(crate) fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    /// Start the reporter. It prints the final table and exits once `stop` fires.
    pub(crate) fn spawn(
        self,
        snapshot: watch::Receiver<Arc<JobMatrix>>,
        progress: Arc<AtomicUsize>,
        stop: CancelToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.live {
                if let Some(log) = &self.log {
                    log.hold();
                }
                write_stdout(ENTER_SCREEN);
                let mut ticker = tokio::time::interval(self.refresh);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let matrix = Arc::clone(&snapshot.borrow());
                            let (width, height) = terminal_size().unwrap_or((80, 24));
                            let frame = self.frame(&matrix, progress.load(Ordering::Relaxed), width);
                            write_stdout(&format!("{}{}", CLEAR_SCREEN, fit_to_screen(&frame, width, height)));
                        }
                    }
                }
                write_stdout(LEAVE_SCREEN);
            } else {
                stop.cancelled().await;
            }

            let matrix = Arc::clone(&snapshot.borrow());
            let view = match terminal_size() {
                Some((width, _)) => self.view.for_width(width),
                None => self.view.clone(),
            };
            write_stdout(&render_table(&matrix, &view, self.live));
            if let Some(log) = &self.log {
                log.release();
            }
        })
    }

    fn frame(&self, matrix: &JobMatrix, done: usize, width: usize) -> String {
        let total = matrix.len();
        let max_time_limit = matrix
            .tests
            .iter()
            .map(|t| t.time_limit_ms)
            .max()
            .unwrap_or(0);
        let remaining = total.saturating_sub(done) as u64 * max_time_limit / self.cpus as u64 / 1000;

        let mut frame = format!(
            "Done {}/{}. Time remaining (in the worst case): {} seconds.\n",
            done, total, remaining
        );
        frame.push_str(&render_table(matrix, &self.view.for_width(width), true));
        frame
    }
}

/// Leave the live view's alternate screen, for exits that skip the reporter's own cleanup
pub fn restore_terminal() {
    if std::io::stdout().is_terminal() {
        write_stdout(LEAVE_SCREEN);
    }
}

fn write_stdout(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn paint(text: String, color: Option<&str>, colors: bool) -> String {
    match color {
        Some(color) if colors => format!("{}{}{}", color, text, RESET),
        _ => text,
    }
}

/// Green up to half the limit, yellow up to the limit, red above
fn usage_color(value: i64, limit: u64) -> &'static str {
    let value = value.max(0) as u64;
    if value * 2 <= limit {
        GREEN
    } else if value <= limit {
        YELLOW
    } else {
        RED
    }
}

fn status_color(status: Status) -> Option<&'static str> {
    match status {
        Status::Pending => None,
        Status::Accepted => Some(GREEN),
        _ => Some(RED),
    }
}

fn cell(text: &str) -> String {
    format!(" {:>width$} |", text, width = CELL_WIDTH - 2)
}

/// Render the results table: per group the worst status with points, the
/// slowest time and the largest memory, then each solution's total.
pub fn render_table(matrix: &JobMatrix, view: &TableView, colors: bool) -> String {
    let mut table = String::new();
    let groups = matrix.groups();
    let possible = view.contest.possible_score(&groups, &view.weights);
    let indices: Vec<usize> = (0..matrix.solutions.len()).collect();

    for block in indices.chunks(view.per_row.max(1)) {
        let scores: Vec<_> = block
            .iter()
            .map(|&s| matrix.score(s, view.contest, &view.weights))
            .collect();

        let _ = write!(table, "{:>width$} |", "", width = LABEL_WIDTH);
        for &s in block {
            let mut name = matrix.solutions[s].clone();
            name.truncate(CELL_WIDTH - 2);
            table.push_str(&cell(&name));
        }
        table.push('\n');
        let _ = writeln!(
            table,
            "{}",
            "-".repeat(LABEL_WIDTH + 2 + block.len() * (CELL_WIDTH + 1))
        );

        for &group in &groups {
            let max = view.weights.get(&group).copied().unwrap_or(0);
            let time_limit = matrix.group_time_limit(group);
            let memory_limit = matrix.group_memory_limit(group);

            let _ = write!(table, "{:>width$} |", group, width = LABEL_WIDTH);
            for (i, &s) in block.iter().enumerate() {
                let status = matrix.group_status(s, group);
                let points = scores[i]
                    .groups
                    .get(&group)
                    .map(|g| g.points.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let code = if status.is_pending() { "" } else { status.code() };
                let text = cell(&format!("{:>3} {:>3}/{}", code, points, max));
                table.push_str(&paint(text, status_color(status), colors));
            }
            table.push('\n');

            let _ = write!(table, "{:>width$} |", "time", width = LABEL_WIDTH);
            for &s in block {
                let text = match matrix.max_time(s, group) {
                    Some(time) => paint(cell(&format!("{}/{}ms", time, time_limit)), Some(usage_color(time, time_limit)), colors),
                    None => cell(""),
                };
                table.push_str(&text);
            }
            table.push('\n');

            if view.hide_memory {
                continue;
            }
            let _ = write!(table, "{:>width$} |", "memory", width = LABEL_WIDTH);
            for &s in block {
                let text = match matrix.max_memory(s, group) {
                    Some(memory) => paint(
                        cell(&format!("{}/{}MB", memory / 1024, memory_limit / 1024)),
                        Some(usage_color(memory, memory_limit)),
                        colors,
                    ),
                    None => cell(""),
                };
                table.push_str(&text);
            }
            table.push('\n');
        }

        let _ = write!(table, "{:>width$} |", "points", width = LABEL_WIDTH);
        for score in &scores {
            table.push_str(&cell(&format!("{}/{}", score.points, possible)));
        }
        table.push_str("\n\n");
    }

    table
}
