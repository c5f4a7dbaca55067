mod gauges;
mod state;

use crate::cli::Cli;
use crate::engine::http::HttpWorkload;
use crate::model::{SpeedResult, Status, UiEvent};
use crate::orchestrator::{self, UiCommand};
use crate::storage::{HistoryStore, HISTORY_LIMIT};
use crate::units;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gauges::Speedometer;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Terminal,
};
use state::DashboardState;
use std::{io, time::Duration, time::Instant};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Width of the sample analyzer strip, in glyphs.
const GAUGE_CAPACITY: usize = 50;

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let cfg = crate::cli::build_config(&args);

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res =
        orchestrator::run_controller(move || HttpWorkload::new(cfg.clone()), event_tx, cmd_rx)
            .await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the dashboard loop on a dedicated thread.
fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<UiEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let store = match args.history_file.as_ref() {
        Some(path) => HistoryStore::new(path),
        None => HistoryStore::at_default(),
    };

    // DashboardState is owned by the UI thread only; no cross-thread mutation.
    let mut state = DashboardState::new(GAUGE_CAPACITY);
    state.history = store.load();
    let speedo = Speedometer::new(args.gauge_max);

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                UiEvent::RunCompleted { result } => {
                    handle_run_completed(&store, args.auto_save, &mut state, *result);
                }
                other => state.apply_event(&other),
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state, &speedo)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Enter) => {
                        if state.on_start() {
                            let _ = cmd_tx.send(UiCommand::Start);
                        }
                    }
                    (_, KeyCode::Esc) => {
                        // STOPPED is declared only once the run settles and
                        // RunStopped arrives.
                        if state.running {
                            state.notice = Some("Stopping…".to_string());
                            let _ = cmd_tx.send(UiCommand::Stop);
                        }
                    }
                    (_, KeyCode::Char('c')) => copy_summary(&mut state),
                    (_, KeyCode::Char('j')) => export_history(&store, &mut state),
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Persist a finished run and refresh the history panel before the state
/// folds the completion event. Storage errors surface as a notice, never a
/// crash.
fn handle_run_completed(
    store: &HistoryStore,
    auto_save: bool,
    state: &mut DashboardState,
    result: SpeedResult,
) {
    if auto_save {
        if let Err(e) = store.append(&result) {
            state.notice = Some(format!("Save failed: {e:#}"));
        }
        state.history = store.load();
    } else {
        // Session-only history when auto-save is off; same bound as the store.
        state.history.push(result.clone());
        if state.history.len() > HISTORY_LIMIT {
            let excess = state.history.len() - HISTORY_LIMIT;
            state.history.drain(..excess);
        }
    }
    state.apply_event(&UiEvent::RunCompleted {
        result: Box::new(result),
    });
}

fn summary_line(r: &SpeedResult) -> String {
    format!(
        "Ping: {} | Down: {:.2} Mbps | Up: {:.2} Mbps",
        units::format_latency(Some(r.ping_ms)),
        r.download_mbps,
        r.upload_mbps
    )
}

fn copy_summary(state: &mut DashboardState) {
    let summary = match state.last_result.as_ref() {
        Some(r) => summary_line(r),
        None => {
            state.notice = Some("No result to copy yet.".to_string());
            return;
        }
    };
    match copy_to_clipboard(&summary) {
        Ok(()) => state.notice = Some("Copied summary to clipboard.".to_string()),
        Err(e) => {
            log::debug!("clipboard copy failed: {e:#}");
            state.notice = Some("Clipboard unavailable.".to_string());
        }
    }
}

fn export_file_name(now: OffsetDateTime) -> String {
    let stamp = format_description!("[year][month][day]-[hour][minute][second]");
    match now.format(stamp) {
        Ok(ts) => format!("speedline-history-{ts}.json"),
        Err(_) => "speedline-history.json".to_string(),
    }
}

fn export_history(store: &HistoryStore, state: &mut DashboardState) {
    let name = export_file_name(OffsetDateTime::now_utc());
    match store.export(std::path::Path::new(&name)) {
        Ok(()) => state.notice = Some(format!("Exported: {name}")),
        Err(e) => state.notice = Some(format!("Export failed: {e:#}")),
    }
}

fn status_color(status: &Status) -> Color {
    match status {
        Status::Idle => Color::Gray,
        Status::Complete => Color::Green,
        Status::Error => Color::Red,
        Status::Cancelled | Status::Stopped => Color::Magenta,
        _ => Color::Yellow,
    }
}

fn needle_color(status: &Status) -> Color {
    match status {
        Status::Downloading => Color::Green,
        Status::Uploading => Color::Cyan,
        _ => Color::Yellow,
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &DashboardState, speedo: &Speedometer) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // status bar
                Constraint::Length(3), // speedometer gauge
                Constraint::Length(3), // sample analyzer
                Constraint::Min(11),   // results + history side by side
                Constraint::Length(4), // notice + key help
            ]
            .as_ref(),
        )
        .split(area);

    draw_status(chunks[0], f, state);
    draw_speedometer(chunks[1], f, state, speedo);
    draw_analyzer(chunks[2], f, state);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
        .split(chunks[3]);
    draw_results(middle[0], f, state);
    draw_history(middle[1], f, state);

    draw_footer(chunks[4], f, state);
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &DashboardState) {
    let mut spans = vec![
        Span::styled("Status: ", Style::default().fg(Color::Gray)),
        Span::styled(
            state.status.label(),
            Style::default()
                .fg(status_color(&state.status))
                .add_modifier(Modifier::BOLD),
        ),
    ];
    if state.running {
        spans.push(Span::raw("   "));
        spans.push(Span::styled(
            units::format_speed(state.current_speed),
            Style::default().fg(needle_color(&state.status)),
        ));
    }
    let p = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("speedline"));
    f.render_widget(p, area);
}

fn draw_speedometer(
    area: Rect,
    f: &mut ratatui::Frame,
    state: &DashboardState,
    speedo: &Speedometer,
) {
    let title = Line::from(vec![
        Span::raw("Speedometer (0-"),
        Span::styled(
            format!("{:.0}", speedo.max_mbps()),
            Style::default().fg(Color::Gray),
        ),
        Span::raw(" Mbps)"),
    ]);
    let g = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(needle_color(&state.status)))
        .ratio(speedo.ratio(state.current_speed))
        .label(format!("{:.1} Mbps", state.current_speed));
    f.render_widget(g, area);
}

fn draw_analyzer(area: Rect, f: &mut ratatui::Frame, state: &DashboardState) {
    let p = Paragraph::new(state.gauge.render())
        .style(Style::default().fg(needle_color(&state.status)))
        .block(Block::default().borders(Borders::ALL).title("Analyzer"));
    f.render_widget(p, area);
}

fn draw_results(area: Rect, f: &mut ratatui::Frame, state: &DashboardState) {
    let lines = match state.last_result.as_ref() {
        Some(r) => result_lines(r),
        None => vec![Line::from("No results yet. Press enter to start a run.")],
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(p, area);
}

fn result_lines(r: &SpeedResult) -> Vec<Line<'_>> {
    let kv = |label: &'static str, value: String, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<13}"), Style::default().fg(Color::Gray)),
            Span::styled(value, Style::default().fg(color)),
        ])
    };
    let ts_fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    vec![
        kv("Ping:", units::format_latency(Some(r.ping_ms)), Color::White),
        kv("Jitter:", units::format_latency(r.jitter_ms), Color::White),
        kv(
            "Download:",
            units::format_speed_dual(r.download_mbps),
            Color::Green,
        ),
        kv(
            "Upload:",
            units::format_speed_dual(r.upload_mbps),
            Color::Cyan,
        ),
        kv(
            "Packet Loss:",
            units::format_packet_loss(r.packet_loss),
            Color::White,
        ),
        kv("Quality:", units::rate(r).label().to_string(), Color::Yellow),
        kv(
            "Server:",
            r.server_name.clone().unwrap_or_else(|| "Auto".to_string()),
            Color::White,
        ),
        kv(
            "ISP:",
            r.isp.clone().unwrap_or_else(|| "Detected ISP".to_string()),
            Color::White,
        ),
        kv(
            "Time:",
            r.timestamp.format(ts_fmt).unwrap_or_default(),
            Color::Gray,
        ),
    ]
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &DashboardState) {
    let hhmmss = format_description!("[hour]:[minute]:[second]");
    let mut lines: Vec<Line> = Vec::new();
    // Newest first; the store keeps runs oldest first.
    for r in state.history.iter().rev() {
        let ts = r.timestamp.format(hhmmss).unwrap_or_default();
        lines.push(Line::from(vec![
            Span::styled(ts, Style::default().fg(Color::Gray)),
            Span::raw("  "),
            Span::styled(
                format!("{:>7.1}", r.download_mbps),
                Style::default().fg(Color::Green),
            ),
            Span::raw(" / "),
            Span::styled(
                format!("{:>6.1}", r.upload_mbps),
                Style::default().fg(Color::Cyan),
            ),
            Span::raw(" Mbps"),
        ]));
    }
    if lines.is_empty() {
        lines.push(Line::from("No saved runs yet."));
    }
    let p = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Last 10 Runs"),
    );
    f.render_widget(p, area);
}

fn draw_footer(area: Rect, f: &mut ratatui::Frame, state: &DashboardState) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Magenta));
    let lines = vec![
        Line::from(vec![
            Span::styled("Info: ", Style::default().fg(Color::Gray)),
            Span::raw(state.notice.as_deref().unwrap_or("")),
        ]),
        Line::from(vec![
            key("enter"),
            Span::raw(" start | "),
            key("esc"),
            Span::raw(" stop | "),
            key("c"),
            Span::raw(" copy | "),
            key("j"),
            Span::raw(" export | "),
            key("q"),
            Span::raw(" quit"),
        ]),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}

// Clipboard writes funnel through one lazily started manager thread.
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;

static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Start the clipboard manager thread on first use and return its sender.
/// The manager keeps each clipboard instance alive long enough for
/// selection readers to pick the text up.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    // Probe once so a missing display surfaces as a notice instead of a
    // silent no-op inside the manager thread.
    if CLIPBOARD_SENDER.get().is_none() {
        arboard::Clipboard::new().map_err(|e| anyhow::anyhow!("clipboard unavailable: {e}"))?;
    }

    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        // X11 selection ownership ends when the instance
                        // drops; hold it for a moment.
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("failed to initialize clipboard manager"))
}

/// Queue a clipboard write; returns once the text is handed to the manager.
fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("clipboard manager channel closed"))?;
    Ok(())
}
