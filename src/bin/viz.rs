/// gridsim live visualizer: attach to any launch started with `--live`.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls the snapshot file every 200ms and renders a live TUI dashboard:
///
///     ┌ header: kernel / mode / status ─────────────────────────────┐
///     │ slot heatmap (one row per resident slot) │ Stats: groups …  │
///     │ q/esc: quit  …footer…                                       │
///
/// Press q or Esc to quit. The launch keeps running unaffected.
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gridsim::metrics::{read_snapshot, LaunchSnapshot, DEFAULT_METRICS_PATH};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Parser)]
#[command(name = "viz")]
#[command(about = "Live dashboard for gridsim launches", long_about = None)]
struct Cli {
    /// Snapshot file written by the launch
    #[arg(long, value_name = "FILE", default_value = DEFAULT_METRICS_PATH)]
    metrics_path: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &cli.metrics_path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = path.display().to_string();
    loop {
        let snapshot = read_snapshot(path);
        terminal.draw(|f| render(f, snapshot.as_ref(), &source))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, snapshot: Option<&LaunchSnapshot>, source: &str) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // heatmap + stats
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], snapshot);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_slots(f, cols[0], snapshot);
    render_stats(f, cols[1], snapshot);
    render_footer(f, rows[2], source);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, snapshot: Option<&LaunchSnapshot>) {
    let block = Block::default()
        .title(Span::styled(
            " gridsim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, mode, status) = snapshot
        .map(|s| (s.kernel_name.as_str(), s.mode.as_str(), s.status.as_str()))
        .unwrap_or(("-", "-", "idle"));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        "failed" => Color::Red,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  kernel: ", Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   mode: ", Style::default().fg(Color::DarkGray)),
        Span::styled(mode, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Slot heatmap
// ---------------------------------------------------------------------------

/// Groups slot `slot` visits: its share of the round-robin stripe.
fn stripe_len(total: u32, slots: u32, slot: u32) -> u32 {
    if slot >= total || slots == 0 {
        0
    } else {
        (total - slot).div_ceil(slots)
    }
}

fn render_slots(f: &mut Frame, area: Rect, snapshot: Option<&LaunchSnapshot>) {
    let block = Block::default().title(" Resident slots ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(s) = snapshot else {
        return;
    };

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" group done   "),
        Span::styled("░░", Style::default().fg(Color::DarkGray)),
        Span::raw(" pending"),
    ]);
    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    // "slot NN " label takes 8 columns, each group cell 2
    let cells = ((inner.width as usize).saturating_sub(9) / 2).max(1);

    for (slot, &done) in s.slot_groups_executed.iter().enumerate() {
        let total = stripe_len(s.groups_total, s.resident_slots, slot as u32);
        // compress long stripes so one slot stays on one line
        let per_cell = (total as usize).div_ceil(cells).max(1);
        let shown = (total as usize).div_ceil(per_cell);
        let filled = (done as usize) / per_cell;

        let mut spans = vec![Span::styled(
            format!("slot {:2} ", slot),
            Style::default().fg(Color::DarkGray),
        )];
        for i in 0..shown {
            let (symbol, color) =
                if i < filled { ("██", Color::Green) } else { ("░░", Color::DarkGray) };
            spans.push(Span::styled(symbol, Style::default().fg(color)));
        }
        lines.push(Line::from(spans));
    }

    let busy = s
        .slot_groups_executed
        .iter()
        .enumerate()
        .filter(|&(slot, &done)| done < stripe_len(s.groups_total, s.resident_slots, slot as u32))
        .count();
    lines.push(Line::raw(""));
    lines.push(Line::from(vec![Span::styled(
        format!("  {}/{} slots still working", busy, s.slot_groups_executed.len()),
        Style::default().fg(Color::DarkGray),
    )]));

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn render_stats(f: &mut Frame, area: Rect, snapshot: Option<&LaunchSnapshot>) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // thread utilization gauge
            Constraint::Length(1), // spacer
            Constraint::Length(2), // groups gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let Some(s) = snapshot else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No launch running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start gridsim with --live to see data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let util_pct = (s.thread_utilization * 100.0).clamp(0.0, 100.0) as u16;
    let util_color = match util_pct {
        0..=33 => Color::Red,
        34..=66 => Color::Yellow,
        _ => Color::Green,
    };
    let util_gauge = Gauge::default()
        .block(Block::default().title("Thread limit used"))
        .gauge_style(Style::default().fg(util_color))
        .percent(util_pct)
        .label(format!("{:.1}%", s.thread_utilization * 100.0));
    f.render_widget(util_gauge, rows[0]);

    let grp_pct = if s.groups_total > 0 {
        ((s.groups_executed as f32 / s.groups_total as f32) * 100.0) as u16
    } else {
        0
    };
    let grp_gauge = Gauge::default()
        .block(Block::default().title("Groups"))
        .gauge_style(Style::default().fg(Color::Blue))
        .percent(grp_pct.min(100))
        .label(format!("{} / {}", s.groups_executed, s.groups_total));
    f.render_widget(grp_gauge, rows[2]);

    let label = |text: &'static str| Span::styled(text, Style::default().fg(Color::DarkGray));
    let mut text = vec![
        Line::from(vec![label("Work items: "), Span::raw(s.work_items_executed.to_string())]),
        Line::from(vec![label("Barriers:   "), Span::raw(s.barrier_releases.to_string())]),
        Line::from(vec![
            label("Named gens: "),
            Span::raw(s.named_barrier_generations.to_string()),
        ]),
        Line::from(vec![
            label("Pool:       "),
            Span::raw(format!("{} slots x {} threads", s.resident_slots, s.pool_threads)),
        ]),
        Line::from(vec![
            label("Limiter:    "),
            Span::styled(s.limiter.clone(), Style::default().fg(Color::Yellow)),
        ]),
        Line::raw(""),
        Line::from(vec![
            label("Grid:   "),
            Span::raw(format!("({},{},{})", s.grid[0], s.grid[1], s.grid[2])),
        ]),
        Line::from(vec![
            label("Group:  "),
            Span::raw(format!("({},{},{})", s.group[0], s.group[1], s.group[2])),
        ]),
    ];
    if let Some(err) = &s.error {
        text.push(Line::raw(""));
        text.push(Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red))));
    }
    f.render_widget(Paragraph::new(text), rows[4]);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect, source: &str) {
    let text = Paragraph::new(Span::styled(
        format!("  q / esc: quit    auto-refreshes every 200ms    reads {}", source),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
