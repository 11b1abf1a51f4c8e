mod charts;
mod help;
mod state;

use crate::model::ViewEvent;
use crate::orchestrator::{self, PollConfig, UiCommand};
use crate::shutdown::ShutdownSignals;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Terminal,
};
use state::UiState;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

pub async fn run(cfg: PollConfig) -> Result<()> {
    let mut signals = ShutdownSignals::install()?;
    // Unbounded channels: snapshots are few and the UI drains them every frame.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ViewEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let mut initial = UiState {
        db_label: cfg.db.display().to_string(),
        refresh: cfg.refresh,
        time_axis: cfg.query.time_axis,
        ..Default::default()
    };
    initial.info = format!("Waiting for data from {}...", initial.db_label);

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(initial, event_rx, cmd_tx));

    // Dropping the poller (and with it the event sender) tells the UI thread to exit.
    let res = tokio::select! {
        res = orchestrator::run_poller(cfg, event_tx, cmd_rx) => res,
        sig = signals.recv() => {
            tracing::info!(signal = ?sig, "viewer stopping");
            Ok(())
        }
    };

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

/// What a key press asks of the event loop.
#[derive(Debug, PartialEq)]
enum KeyOutcome {
    Nothing,
    Send(UiCommand),
    Quit,
}

fn handle_key(state: &mut UiState, k: KeyEvent) -> KeyOutcome {
    match (k.modifiers, k.code) {
        (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => KeyOutcome::Quit,
        (_, KeyCode::Char('?')) => {
            state.show_help = !state.show_help;
            KeyOutcome::Nothing
        }
        (_, KeyCode::Esc) if state.show_help => {
            state.show_help = false;
            KeyOutcome::Nothing
        }
        (_, KeyCode::Tab) | (_, KeyCode::Right) => {
            state.cycle_type(true);
            KeyOutcome::Nothing
        }
        (_, KeyCode::BackTab) | (_, KeyCode::Left) => {
            state.cycle_type(false);
            KeyOutcome::Nothing
        }
        (_, KeyCode::Char(']')) | (_, KeyCode::Char('l')) => {
            state.cycle_sender(true);
            KeyOutcome::Nothing
        }
        (_, KeyCode::Char('[')) | (_, KeyCode::Char('h')) => {
            state.cycle_sender(false);
            KeyOutcome::Nothing
        }
        (_, KeyCode::Char('m')) => {
            state.layout = state.layout.toggled();
            state.info = format!("Layout: {}", state.layout.label());
            KeyOutcome::Nothing
        }
        (_, KeyCode::Char('t')) => {
            state.time_axis = state.time_axis.toggled();
            KeyOutcome::Send(UiCommand::TimeAxis(state.time_axis))
        }
        (_, KeyCode::Char('p')) => {
            state.paused = !state.paused;
            KeyOutcome::Send(UiCommand::Pause(state.paused))
        }
        (_, KeyCode::Char('r')) => {
            state.info = "Refreshing...".into();
            KeyOutcome::Send(UiCommand::Refresh)
        }
        _ => KeyOutcome::Nothing,
    }
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<ViewEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut dirty = true;

    let res = 'ui: loop {
        // Drain events without blocking to keep UI responsive.
        loop {
            match event_rx.try_recv() {
                Ok(ViewEvent::Snapshot(snap)) => {
                    state.apply_snapshot(*snap);
                    dirty = true;
                }
                Ok(ViewEvent::Info(info)) => {
                    state.apply_info(info);
                    dirty = true;
                }
                Err(TryRecvError::Empty) => break,
                // Poller is gone (quit, signal or fatal error).
                Err(TryRecvError::Disconnected) => break 'ui Ok(()),
            }
        }

        if dirty || last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
            dirty = false;
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                dirty = true;
                match handle_key(&mut state, k) {
                    KeyOutcome::Nothing => {}
                    KeyOutcome::Send(cmd) => {
                        let _ = cmd_tx.send(cmd);
                    }
                    KeyOutcome::Quit => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn tab_bar<'a>(titles: &'a [String], selected: usize, title: &'a str) -> Tabs<'a> {
    Tabs::new(titles.iter().map(|t| Line::from(t.as_str())))
        .select(selected)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // packet types
                Constraint::Length(3), // senders
                Constraint::Min(0),
                Constraint::Length(1), // status
            ]
            .as_ref(),
        )
        .split(area);

    f.render_widget(
        tab_bar(&state.types, state.type_index(), "radio telemetry"),
        chunks[0],
    );
    f.render_widget(
        tab_bar(state.sender_tabs(), state.sender_index(), "sender"),
        chunks[1],
    );

    match state.current_panel() {
        Some(panel) => charts::draw_panel(chunks[2], f, state, panel),
        None => {
            let msg = if state.types.is_empty() {
                state.info.as_str()
            } else {
                "No data"
            };
            let p = Paragraph::new(msg)
                .alignment(Alignment::Center)
                .block(Block::default().borders(Borders::ALL));
            f.render_widget(p, chunks[2]);
        }
    }

    f.render_widget(Paragraph::new(status_line(state)), chunks[3]);

    if state.show_help {
        help::draw_help(chunks[2], f);
    }
}

fn status_line(state: &UiState) -> Line<'_> {
    let gray = Style::default().fg(Color::Gray);
    let mut spans = vec![
        Span::styled("db ", gray),
        Span::raw(state.db_label.as_str()),
        Span::styled("  refresh ", gray),
        Span::raw(format!("{:.1}s", state.refresh.as_secs_f64())),
        Span::styled("  axis ", gray),
        Span::raw(state.time_axis.label()),
        Span::styled("  layout ", gray),
        Span::raw(state.layout.label()),
    ];
    if !state.snapshot.refreshed_at_utc.is_empty() {
        spans.push(Span::styled("  updated ", gray));
        spans.push(Span::raw(state.snapshot.refreshed_at_utc.as_str()));
    }
    if state.paused {
        spans.push(Span::styled(
            "  PAUSED",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    if !state.info.is_empty() {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            state.info.as_str(),
            Style::default().fg(Color::Yellow),
        ));
    }
    spans.push(Span::styled("  ? help", Style::default().fg(Color::Magenta)));
    Line::from(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeAxis;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn quit_keys() {
        let mut st = UiState::default();
        assert_eq!(handle_key(&mut st, key(KeyCode::Char('q'))), KeyOutcome::Quit);
        assert_eq!(
            handle_key(
                &mut st,
                KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)
            ),
            KeyOutcome::Quit
        );
        assert_eq!(handle_key(&mut st, key(KeyCode::Char('c'))), KeyOutcome::Nothing);
    }

    #[test]
    fn toggles_emit_poller_commands() {
        let mut st = UiState::default();
        assert_eq!(
            handle_key(&mut st, key(KeyCode::Char('t'))),
            KeyOutcome::Send(UiCommand::TimeAxis(TimeAxis::Sent))
        );
        assert_eq!(
            handle_key(&mut st, key(KeyCode::Char('p'))),
            KeyOutcome::Send(UiCommand::Pause(true))
        );
        assert_eq!(
            handle_key(&mut st, key(KeyCode::Char('r'))),
            KeyOutcome::Send(UiCommand::Refresh)
        );
    }

    #[test]
    fn local_keys_change_only_ui_state() {
        let mut st = UiState::default();
        assert_eq!(handle_key(&mut st, key(KeyCode::Char('m'))), KeyOutcome::Nothing);
        assert_eq!(st.layout, state::ChartLayout::Overlay);
        handle_key(&mut st, key(KeyCode::Char('?')));
        assert!(st.show_help);
        handle_key(&mut st, key(KeyCode::Esc));
        assert!(!st.show_help);
    }

    #[test]
    fn draws_without_panicking() {
        use ratatui::backend::TestBackend;
        let mut st = UiState::default();
        let mut snap = crate::model::Snapshot::default();
        let mut panel = crate::model::Panel {
            packet_type: "GPS".into(),
            sender: "Rocket".into(),
            packets: 2,
            ..Default::default()
        };
        panel.series.insert(0, vec![(0.0, 1.0), (1.0, 2.0)]);
        panel.series.insert(1, vec![(0.0, 5.0), (1.0, 5.0)]);
        for (i, (lo, hi)) in [(1.0, 2.0), (5.0, 5.0)].into_iter().enumerate() {
            panel.stats.insert(
                i as i64,
                crate::model::SeriesStats {
                    latest: hi,
                    min: lo,
                    max: hi,
                    mean: (lo + hi) / 2.0,
                },
            );
        }
        snap.panels
            .entry("GPS".into())
            .or_default()
            .insert("Rocket".into(), panel);
        st.apply_snapshot(snap);

        let mut terminal = Terminal::new(TestBackend::new(100, 40)).unwrap();
        terminal.draw(|f| draw(f.area(), f, &st)).unwrap();
        st.layout = st.layout.toggled();
        st.show_help = true;
        terminal.draw(|f| draw(f.area(), f, &st)).unwrap();
    }
}
