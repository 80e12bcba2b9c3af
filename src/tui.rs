use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::domain::DownloadStatus;
use crate::error::HarvestError;

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Dashboard,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Plan,
    Resolve,
    Fetch,
    Convert,
    Store,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Plan => "Plan",
            Phase::Resolve => "Resolve",
            Phase::Fetch => "Fetch",
            Phase::Convert => "Convert",
            Phase::Store => "Store",
        }
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    done: usize,
    total: usize,
    success: usize,
    not_found: usize,
    failed: usize,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    finished_in: Option<Duration>,
}

/// Live dashboard for a shard run. The job runs on a worker thread and
/// reports through a [`ProgressSink`]; the terminal thread only draws.
pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let message = event.message.trim().to_string();
        match parse_phase(&message) {
            Some((phase, payload)) => {
                state.phase = phase;
                state.status = payload.to_string();
            }
            None => state.status = message.clone(),
        }
        if let Some(progress) = event.progress {
            state.done = progress.done;
            state.total = progress.total;
        }
        match event.status {
            Some(DownloadStatus::Success) => state.success += 1,
            Some(DownloadStatus::NotFound) => state.not_found += 1,
            Some(DownloadStatus::Failed) => state.failed += 1,
            None => {}
        }
        if event.elapsed.is_some() {
            state.finished_in = event.elapsed;
        }

        let line = strip_phase(&message).to_string();
        push_bounded(&mut state.events, line.clone(), EVENTS_MAX);
        push_bounded(
            &mut state.logs,
            format!("[{}] {line}", Local::now().format("%H:%M:%S")),
            LOGS_MAX,
        );
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState {
                status: "starting".to_string(),
                phase: Phase::Plan,
                done: 0,
                total: 0,
                success: 0,
                not_found: 0,
                failed: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Dashboard,
                started: Instant::now(),
                finished_in: None,
            })),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a worker thread while drawing its progress. `q` or `Esc`
    /// abandons the view and returns an error.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, HarvestError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self.kind, &state, self.log_scroll))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                restore_terminal()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()?
                && let Event::Key(key) = event::read().into_diagnostic()?
                && self.handle_key(key)
            {
                break;
            }
        }

        restore_terminal()?;
        Err(miette::Report::msg("aborted"))
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::F(4) | KeyCode::Char('l') => self.toggle_logs(),
            KeyCode::PageUp => self.scroll_logs(-5),
            KeyCode::PageDown => self.scroll_logs(5),
            _ => {}
        }
        false
    }

    fn toggle_logs(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.view = match state.view {
                View::Dashboard => View::Logs,
                View::Logs => View::Dashboard,
            };
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let max = self.state.lock().map(|state| state.logs.len()).unwrap_or(0);
        let max_scroll = max.saturating_sub(1) as i16;
        let next = (self.log_scroll as i16 + delta).clamp(0, max_scroll);
        self.log_scroll = next as u16;
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, kind: ProgressSinkKind, state: &AppState, scroll: u16) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(kind, state), chunks[0]);
    frame.render_widget(draw_gauge(state), chunks[1]);
    match state.view {
        View::Dashboard => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
                .split(chunks[2]);
            frame.render_widget(draw_counts(state), main[0]);
            frame.render_widget(draw_events(state), main[1]);
        }
        View::Logs => frame.render_widget(draw_logs(state, scroll), chunks[2]),
    }
    frame.render_widget(
        Paragraph::new(Span::styled(
            "q quit   l/F4 logs   PgUp/PgDn scroll",
            Style::default().fg(Color::DarkGray),
        )),
        chunks[3],
    );
}

fn draw_header(kind: ProgressSinkKind, state: &AppState) -> Paragraph<'static> {
    let op_label = match kind {
        ProgressSinkKind::Fetch => "Fetch",
        ProgressSinkKind::Retry => "Retry",
        ProgressSinkKind::Convert => "Convert",
    };
    let elapsed = state.finished_in.unwrap_or_else(|| state.started.elapsed());
    Paragraph::new(Line::from(vec![
        Span::styled(
            "GFF-HARVEST",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   Phase: "),
        Span::styled(state.phase.label(), Style::default().fg(Color::Yellow)),
        Span::raw(format!("   Elapsed: {}s", elapsed.as_secs())),
    ]))
    .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_gauge(state: &AppState) -> Gauge<'static> {
    let ratio = if state.total == 0 {
        0.0
    } else {
        (state.done as f64 / state.total as f64).clamp(0.0, 1.0)
    };
    Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio)
        .label(format!("{}/{}", state.done, state.total))
}

fn draw_counts(state: &AppState) -> Paragraph<'static> {
    let row = |label: &'static str, value: usize, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<10}"), Style::default().fg(Color::Gray)),
            Span::styled(value.to_string(), Style::default().fg(color)),
        ])
    };
    Paragraph::new(vec![
        row("success", state.success, Color::Green),
        row("not found", state.not_found, Color::Yellow),
        row("failed", state.failed, Color::Red),
        Line::from(""),
        Line::from(Span::styled(
            state.status.clone(),
            Style::default().fg(Color::White),
        )),
    ])
    .block(Block::default().borders(Borders::ALL).title("Outcomes"))
    .wrap(Wrap { trim: true })
}

fn draw_events(state: &AppState) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .events
        .iter()
        .rev()
        .map(|event| Line::from(format!("- {event}")))
        .collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Recent"))
        .wrap(Wrap { trim: true })
}

fn draw_logs(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let lines: Vec<Line> = state.logs.iter().map(|log| Line::from(log.clone())).collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Log"))
        .scroll((scroll, 0))
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Plan" => Phase::Plan,
        "Resolve" => Phase::Resolve,
        "Fetch" => Phase::Fetch,
        "Convert" => Phase::Convert,
        "Store" => Phase::Store,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn strip_phase(message: &str) -> &str {
    parse_phase(message).map_or(message, |(_, payload)| payload)
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}
