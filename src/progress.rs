use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::error::SnapError;

/// Controls how panels are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer output, collapse output on completion.
    Normal,
    /// Like Normal but keeps output lines after a panel finishes.
    Verbose,
    /// Titles and status only, no output lines.
    Quiet,
    /// No ANSI, plain lines on stdout (for piped/non-TTY).
    Plain,
}

pub const DEFAULT_MAX_LINES: usize = 24;

/// Shown once, as the first line, after older lines were dropped.
pub const TRUNCATION_MARKER: &str = "⋯ [output truncated] ⋯";

// ── StreamBuffer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Normal,
    Error,
    Success,
}

/// Longest line kept, in bytes. Anything past it is dropped.
pub const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone)]
struct Line {
    text: String,
    style: LineStyle,
    /// A newline has been seen; further text starts a new line.
    complete: bool,
    /// A bare carriage return was seen; further text overwrites this line.
    rewind: bool,
}

impl Line {
    fn extend(&mut self, text: &str) {
        if self.rewind && !text.is_empty() {
            self.text.clear();
            self.rewind = false;
        }
        let room = MAX_LINE_BYTES.saturating_sub(self.text.len());
        let mut take = text.len().min(room);
        while !text.is_char_boundary(take) {
            take -= 1;
        }
        self.text.push_str(&text[..take]);
    }
}

/// Ring buffer of the most recent output lines.
///
/// Holds at most `max_lines` visible lines. Once anything has been dropped
/// the first visible line is [`TRUNCATION_MARKER`], so only `max_lines - 1`
/// output lines are kept from then on. A carriage return rewinds the open
/// line the way a terminal does, so progress bars redraw in place.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    lines: VecDeque<Line>,
    max_lines: usize,
    truncated: bool,
}

impl StreamBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(2),
            truncated: false,
        }
    }

    /// Append a chunk of output. Chunks need not end on a line boundary.
    pub fn push(&mut self, chunk: &str, style: LineStyle) {
        for piece in chunk.split_inclusive(['\n', '\r']) {
            let (text, end) = match piece.as_bytes().last() {
                Some(b'\n') => (&piece[..piece.len() - 1], Some('\n')),
                Some(b'\r') => (&piece[..piece.len() - 1], Some('\r')),
                _ => (piece, None),
            };
            let open = matches!(self.lines.back(), Some(last) if !last.complete && last.style == style);
            if !open {
                self.lines.push_back(Line {
                    text: String::new(),
                    style,
                    complete: false,
                    rewind: false,
                });
            }
            let Some(line) = self.lines.back_mut() else {
                continue;
            };
            line.extend(text);
            match end {
                Some('\n') => {
                    line.complete = true;
                    line.rewind = false;
                }
                Some(_) => line.rewind = true,
                None => {}
            }
        }
        self.trim();
    }

    fn trim(&mut self) {
        if self.lines.len() > self.max_lines {
            self.truncated = true;
        }
        let keep = if self.truncated {
            self.max_lines - 1
        } else {
            self.max_lines
        };
        while self.lines.len() > keep {
            self.lines.pop_front();
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Visible lines, marker included.
    pub fn visible(&self) -> Vec<(&str, LineStyle)> {
        let marker = self
            .truncated
            .then_some((TRUNCATION_MARKER, LineStyle::Normal));
        marker
            .into_iter()
            .chain(self.lines.iter().map(|l| (l.text.as_str(), l.style)))
            .collect()
    }

    /// Visible lines joined with newlines, without styling.
    pub fn text(&self) -> String {
        self.visible()
            .into_iter()
            .map(|(text, _)| text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Panels ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelStatus {
    Running,
    Success,
    Failed,
    Cached,
    /// Static information, never spins.
    Info,
}

struct PanelState {
    title: String,
    rows: Vec<(String, String)>,
    body: StreamBuffer,
    footer: Vec<(String, String)>,
    status: PanelStatus,
    bar: ProgressBar,
}

fn upsert(rows: &mut Vec<(String, String)>, label: &str, value: String) {
    match rows.iter_mut().find(|(l, _)| l == label) {
        Some(row) => row.1 = value,
        None => rows.push((label.to_string(), value)),
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn paint(text: &str, line_style: LineStyle, styled: bool) -> String {
    if !styled {
        return text.to_string();
    }
    match line_style {
        LineStyle::Normal => text.to_string(),
        LineStyle::Error => style(text).red().to_string(),
        LineStyle::Success => style(text).green().to_string(),
    }
}

impl PanelState {
    fn heading(&self, styled: bool) -> String {
        let (mark, line_style) = match self.status {
            PanelStatus::Running => return self.title.clone(),
            PanelStatus::Success => ("\u{2713}", LineStyle::Success),
            PanelStatus::Cached => ("\u{2713} cached", LineStyle::Success),
            PanelStatus::Failed => ("\u{2717}", LineStyle::Error),
            PanelStatus::Info => ("\u{203a}", LineStyle::Normal),
        };
        format!("{} {}", paint(mark, line_style, styled), self.title)
    }

    /// Full multi-line message of the panel's bar.
    fn render(&self, mode: OutputMode, styled: bool) -> String {
        let mut msg = self.heading(styled);
        let show_body = match mode {
            OutputMode::Quiet => false,
            OutputMode::Normal => self.status == PanelStatus::Running,
            OutputMode::Verbose | OutputMode::Plain => true,
        };

        for (label, value) in &self.rows {
            msg.push_str(&format!("\n    {label:>6} {value}"));
        }
        if show_body {
            let marked = self.body.is_truncated();
            for (i, (line, line_style)) in self.body.visible().into_iter().enumerate() {
                let text = if i == 0 && marked && styled {
                    style(line).dim().to_string()
                } else {
                    paint(line, line_style, styled)
                };
                msg.push_str("\n         ");
                msg.push_str(&text);
            }
        }
        for (label, value) in &self.footer {
            msg.push_str(&format!("\n    {label:>6} {value}"));
        }
        msg
    }
}

// ── ProgressReporter ────────────────────────────────────────────────

struct ReporterState {
    panels: Vec<PanelState>,
    pauses: usize,
    /// Plain-mode lines not yet written. Held back while paused.
    held: Vec<String>,
    out: Box<dyn Write + Send>,
}

impl ReporterState {
    fn flush_plain(&mut self) {
        if self.pauses > 0 || self.held.is_empty() {
            return;
        }
        for line in self.held.drain(..) {
            let _ = writeln!(self.out, "{line}");
        }
        let _ = self.out.flush();
    }
}

struct Inner {
    multi: MultiProgress,
    mode: OutputMode,
    max_lines: usize,
    hidden: bool,
    state: Mutex<ReporterState>,
}

/// Live view with one panel per operation.
///
/// Cheap to clone; all clones share one panel list behind a single mutex,
/// so concurrent operations never interleave a partial render.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

impl ProgressReporter {
    pub fn new(mode: OutputMode, max_lines: usize) -> Self {
        let hidden = mode == OutputMode::Plain;
        Self::build(mode, max_lines, hidden, Box::new(std::io::stdout()))
    }

    /// A reporter that never draws; panel contents remain inspectable.
    pub fn hidden(max_lines: usize) -> Self {
        Self::build(OutputMode::Normal, max_lines, true, Box::new(std::io::sink()))
    }

    fn build(mode: OutputMode, max_lines: usize, hidden: bool, out: Box<dyn Write + Send>) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            inner: Arc::new(Inner {
                multi,
                mode,
                max_lines: max_lines.max(2),
                hidden,
                state: Mutex::new(ReporterState {
                    panels: Vec::new(),
                    pauses: 0,
                    held: Vec::new(),
                    out,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        // Rendering state stays consistent even if a holder panicked.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn repaint(&self, panel: &PanelState) {
        let styled = !self.inner.hidden;
        panel.bar.set_message(panel.render(self.inner.mode, styled));
    }

    /// Append a new running panel.
    pub fn add_panel(&self, title: impl Into<String>) -> Panel {
        self.push_panel(title.into(), Vec::new(), PanelStatus::Running)
    }

    /// Append a static informational panel.
    pub fn system_panel(&self, title: impl Into<String>, body: impl Into<String>) -> Panel {
        let body = body.into();
        let rows = if body.is_empty() {
            Vec::new()
        } else {
            vec![(String::new(), body)]
        };
        self.push_panel(title.into(), rows, PanelStatus::Info)
    }

    fn push_panel(&self, title: String, rows: Vec<(String, String)>, status: PanelStatus) -> Panel {
        let mut state = self.lock();
        let bar = self.inner.multi.add(ProgressBar::new_spinner());
        if status == PanelStatus::Running {
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(80));
        } else {
            bar.set_style(done_style());
        }

        if self.inner.mode == OutputMode::Plain {
            let number = state.panels.len() + 1;
            state.held.push(format!("[{number}] {title}"));
            for (_, value) in &rows {
                state.held.push(format!("        {value}"));
            }
        }

        let panel = PanelState {
            title,
            rows,
            body: StreamBuffer::new(self.inner.max_lines),
            footer: Vec::new(),
            status,
            bar,
        };
        self.repaint(&panel);
        if status != PanelStatus::Running {
            panel.bar.finish();
        }
        state.panels.push(panel);
        state.flush_plain();
        Panel {
            reporter: self.clone(),
            index: state.panels.len() - 1,
        }
    }

    /// Run `f` against one panel under the shared lock, then repaint it.
    /// Lines `f` pushes to the plain-mode queue are written unless paused.
    fn update<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut PanelState, OutputMode, &mut Vec<String>) -> R,
    ) -> R {
        let mut guard = self.lock();
        let state = &mut *guard;
        let panel = &mut state.panels[index];
        let result = f(panel, self.inner.mode, &mut state.held);
        self.repaint(panel);
        state.flush_plain();
        result
    }

    pub fn panel_count(&self) -> usize {
        self.lock().panels.len()
    }

    /// Stop repainting until the returned guard is dropped.
    ///
    /// The view is restored with a full repaint when the guard goes out of
    /// scope, including on early return or panic.
    pub fn pause(&self) -> PauseGuard {
        let mut state = self.lock();
        state.pauses += 1;
        if state.pauses == 1 {
            self.inner.multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        PauseGuard {
            reporter: self.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pauses > 0
    }

    fn resume(&self) {
        let mut state = self.lock();
        state.pauses = state.pauses.saturating_sub(1);
        if state.pauses > 0 {
            return;
        }
        if !self.inner.hidden {
            self.inner.multi.set_draw_target(ProgressDrawTarget::stderr());
        }
        for panel in &state.panels {
            self.repaint(panel);
        }
        state.flush_plain();
    }

    /// Ask a yes/no question with the live view paused.
    pub fn confirm(&self, question: &str, default: bool) -> Result<bool, SnapError> {
        let _paused = self.pause();
        inquire::Confirm::new(question)
            .with_default(default)
            .prompt()
            .map_err(|e| SnapError::Prompt {
                message: e.to_string(),
            })
    }
}

/// Keeps the live view paused while alive.
pub struct PauseGuard {
    reporter: ProgressReporter,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.reporter.resume();
    }
}

/// Handle to one panel of a [`ProgressReporter`].
#[derive(Clone)]
pub struct Panel {
    reporter: ProgressReporter,
    index: usize,
}

impl Panel {
    /// Set or replace a labelled header row.
    pub fn set_row(&self, label: &str, value: impl Into<String>) {
        let value = value.into();
        self.reporter.update(self.index, |p, _, _| upsert(&mut p.rows, label, value));
    }

    /// Set or replace a labelled footer row.
    pub fn set_footer(&self, label: &str, value: impl Into<String>) {
        let value = value.into();
        self.reporter.update(self.index, |p, _, _| upsert(&mut p.footer, label, value));
    }

    /// Append streamed output to the panel's ring buffer.
    pub fn append(&self, chunk: &str, line_style: LineStyle) {
        self.reporter.update(self.index, |p, mode, plain| {
            p.body.push(chunk, line_style);
            if mode == OutputMode::Plain {
                for line in chunk.split(['\n', '\r']).filter(|l| !l.is_empty()) {
                    plain.push(format!("        {line}"));
                }
            }
        });
    }

    /// Append one complete line.
    pub fn log(&self, line: &str, line_style: LineStyle) {
        self.append(&format!("{line}\n"), line_style);
    }

    /// Mark the panel done and stop its spinner.
    pub fn finish(&self, status: PanelStatus) {
        self.reporter.update(self.index, |p, mode, plain| {
            p.status = status;
            p.bar.set_style(done_style());
            if mode == OutputMode::Plain {
                let mark = if status == PanelStatus::Failed { "\u{2717}" } else { "\u{2713}" };
                plain.push(format!("    {mark} {}", p.title));
            }
        });
        let state = self.reporter.lock();
        state.panels[self.index].bar.finish();
    }

    pub fn status(&self) -> PanelStatus {
        self.reporter.lock().panels[self.index].status
    }

    /// Visible streamed output, marker included, without styling.
    pub fn output(&self) -> String {
        self.reporter.lock().panels[self.index].body.text()
    }

    /// The panel as it would render in verbose mode, without styling.
    pub fn text(&self) -> String {
        self.reporter.lock().panels[self.index].render(OutputMode::Verbose, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_keeps_most_recent_lines() {
        let mut buf = StreamBuffer::new(24);
        for i in 0..1000 {
            buf.push(&format!("line {i}\n"), LineStyle::Normal);
        }
        let visible = buf.visible();
        assert_eq!(visible.len(), 24);
        assert_eq!(visible[0].0, TRUNCATION_MARKER);
        assert_eq!(visible[1].0, "line 977");
        assert_eq!(visible[23].0, "line 999");
        assert_eq!(buf.lines.len(), 23);
        assert_eq!(visible.iter().filter(|(l, _)| *l == TRUNCATION_MARKER).count(), 1);
    }

    #[test]
    fn buffer_without_overflow_has_no_marker() {
        let mut buf = StreamBuffer::new(4);
        buf.push("a\nb\nc\nd\n", LineStyle::Normal);
        assert!(!buf.is_truncated());
        assert_eq!(buf.text(), "a\nb\nc\nd");
        buf.push("e\n", LineStyle::Normal);
        assert_eq!(buf.text(), format!("{TRUNCATION_MARKER}\nc\nd\ne"));
    }

    #[test]
    fn partial_lines_are_joined() {
        let mut buf = StreamBuffer::new(8);
        buf.push("down", LineStyle::Normal);
        buf.push("loading 50%", LineStyle::Normal);
        buf.push("\ndone\n", LineStyle::Normal);
        assert_eq!(buf.text(), "downloading 50%\ndone");
    }

    #[test]
    fn styles_do_not_merge() {
        let mut buf = StreamBuffer::new(8);
        buf.push("out", LineStyle::Normal);
        buf.push("err\n", LineStyle::Error);
        let visible = buf.visible();
        assert_eq!(visible, vec![("out", LineStyle::Normal), ("err", LineStyle::Error)]);
    }

    #[test]
    fn carriage_returns_redraw_in_place() {
        let mut buf = StreamBuffer::new(24);
        for i in 0..100_000 {
            buf.push(&format!("\rDownloading {i:>6}%"), LineStyle::Normal);
        }
        assert_eq!(buf.visible(), vec![("Downloading  99999%", LineStyle::Normal)]);

        buf.push("\n", LineStyle::Normal);
        buf.push("done\n", LineStyle::Normal);
        assert_eq!(buf.text(), "Downloading  99999%\ndone");
    }

    #[test]
    fn crlf_split_across_chunks_keeps_the_line() {
        let mut buf = StreamBuffer::new(8);
        buf.push("first\r", LineStyle::Normal);
        buf.push("\nsecond\r\n", LineStyle::Normal);
        assert_eq!(buf.text(), "first\nsecond");
    }

    #[test]
    fn unterminated_line_is_capped() {
        let mut buf = StreamBuffer::new(8);
        for _ in 0..10_000 {
            buf.push("\u{2603}xyz", LineStyle::Normal);
        }
        let visible = buf.visible();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].0.len() <= MAX_LINE_BYTES);
        assert!(visible[0].0.starts_with("\u{2603}xyz"));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn plain_output_is_held_while_paused() {
        let out = Captured::default();
        let reporter = ProgressReporter::build(OutputMode::Plain, 24, true, Box::new(out.clone()));
        let panel = reporter.add_panel("apt-get update");
        assert_eq!(out.text(), "[1] apt-get update\n");

        let guard = reporter.pause();
        panel.log("Hit:1 http://deb.debian.org", LineStyle::Normal);
        reporter.add_panel("second");
        panel.finish(PanelStatus::Success);
        assert_eq!(out.text(), "[1] apt-get update\n");

        drop(guard);
        assert_eq!(
            out.text(),
            "[1] apt-get update\n        Hit:1 http://deb.debian.org\n[2] second\n    \u{2713} apt-get update\n"
        );
    }

    #[test]
    fn panel_rows_and_footer_render_in_order() {
        let reporter = ProgressReporter::hidden(24);
        let panel = reporter.add_panel("run");
        panel.set_row("CMD", "echo hi");
        panel.append("hi\n", LineStyle::Normal);
        panel.set_footer("RET", "0");
        panel.finish(PanelStatus::Success);

        let text = panel.text();
        let cmd = text.find("CMD echo hi").unwrap();
        let out = text.find("\n         hi").unwrap();
        let ret = text.find("RET 0").unwrap();
        assert!(text.starts_with("\u{2713} run"));
        assert!(cmd < out && out < ret);
        assert_eq!(panel.status(), PanelStatus::Success);
    }

    #[test]
    fn pause_resumes_on_drop_even_after_panic() {
        let reporter = ProgressReporter::hidden(24);
        let clone = reporter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = clone.pause();
            assert!(clone.is_paused());
            panic!("prompt failed");
        }));
        assert!(result.is_err());
        assert!(!reporter.is_paused());
    }

    #[test]
    fn nested_pauses() {
        let reporter = ProgressReporter::hidden(24);
        let outer = reporter.pause();
        {
            let _inner = reporter.pause();
        }
        assert!(reporter.is_paused());
        drop(outer);
        assert!(!reporter.is_paused());
    }

    #[test]
    fn concurrent_appends_are_serialized() {
        let reporter = ProgressReporter::hidden(1000);
        let panel = reporter.add_panel("parallel");
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let panel = panel.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        panel.log(&format!("t{t}-{i}"), LineStyle::Normal);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let output = panel.output();
        assert_eq!(output.lines().count(), 400);
        assert!(output.lines().all(|l| l.starts_with('t') && l.contains('-')));
    }
}
