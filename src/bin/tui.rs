// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! openfanctl: terminal client that connects to openfand over its Unix
//! domain socket and shows live fan state.

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use openfan_utility::config;
use openfan_utility::curve::Evaluation;
use openfan_utility::monitor::{self, MonitorStream};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
};
use std::io;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "openfanctl", about = "OpenFan daemon client")]
struct Cli {
    /// Path to the daemon socket.
    #[arg(short, long, default_value = config::DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show live fan speeds.
    Monitor,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct App {
    running: bool,
    socket: String,
    fans: Vec<Evaluation>,
    last_update: Option<Instant>,
}

impl App {
    fn new(socket: &str) -> Self {
        Self {
            running: true,
            socket: socket.to_string(),
            fans: Vec::new(),
            last_update: None,
        }
    }

    fn update(&mut self, evals: Vec<Evaluation>) {
        self.fans = visible_fans(evals);
        self.last_update = Some(Instant::now());
    }
}

/// Running fans only, ordered by id.
fn visible_fans(mut evals: Vec<Evaluation>) -> Vec<Evaluation> {
    evals.retain(|e| e.pwm != 0);
    evals.sort_by_key(|e| e.id);
    evals
}

fn speed_text(eval: &Evaluation) -> String {
    format!("{:4} RPM ({:2}%)", eval.rpm, eval.pwm)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Monitor => run_monitor(&cli.socket),
    }
}

fn run_monitor(socket: &str) -> anyhow::Result<()> {
    let stream = monitor::connect(Path::new(socket)).context("Could not open the monitor stream")?;
    let events = spawn_reader(stream);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(socket);

    let result = run_app(&mut terminal, &mut app, &events);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

type StreamEvent = Result<Vec<Evaluation>, monitor::ClientError>;

/// Decode events on a separate thread so the UI keeps handling keys while
/// the stream is idle.
fn spawn_reader(mut stream: MonitorStream) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        loop {
            let event = stream.next_event();
            let failed = event.is_err();
            if tx.send(event).is_err() || failed {
                break;
            }
        }
    });
    rx
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    events: &mpsc::Receiver<StreamEvent>,
) -> anyhow::Result<()> {
    let tick_rate = Duration::from_millis(100);

    while app.running {
        terminal.draw(|f| ui(f, app))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                handle_input(app, key.code, key.modifiers);
            }
        }

        loop {
            match events.try_recv() {
                Ok(Ok(evals)) => app.update(evals),
                Ok(Err(e)) => return Err(e).context("Monitor stream failed"),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    anyhow::bail!("Monitor stream closed")
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Input handling
// ---------------------------------------------------------------------------

fn handle_input(app: &mut App, key: KeyCode, modifiers: KeyModifiers) {
    match key {
        KeyCode::Char('q') => app.running = false,
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => app.running = false,
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),    // fans
            Constraint::Length(3), // status bar
        ])
        .split(f.area());

    draw_fans(f, app, chunks[0]);
    draw_status_bar(f, app, chunks[1]);
}

fn draw_fans(f: &mut Frame, app: &App, area: Rect) {
    let rows: Vec<Row> = app
        .fans
        .iter()
        .map(|fan| {
            let temperature = if fan.temperature_name.is_empty() {
                Span::raw("-")
            } else {
                let t = fan.temperature;
                let color = if t >= 80.0 {
                    Color::Red
                } else if t >= 60.0 {
                    Color::Yellow
                } else {
                    Color::Green
                };
                Span::styled(format!("{t:.0}°C"), Style::default().fg(color))
            };

            Row::new(vec![
                Cell::from(format!("{}({})", fan.id, fan.label)),
                Cell::from(speed_text(fan)),
                Cell::from(fan.temperature_name.clone()),
                Cell::from(temperature),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(35),
            Constraint::Percentage(15),
        ],
    )
    .header(
        Row::new(vec!["Fan", "Speed", "Sensor", "Temp"]).style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(" openfand "));

    f.render_widget(table, area);
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let age = match app.last_update {
        Some(at) => format!("updated {:.1}s ago", at.elapsed().as_secs_f64()),
        None => "waiting for data".to_string(),
    };

    let line = Line::from(vec![
        Span::styled(
            format!(" {} ", app.socket),
            Style::default().fg(Color::Green),
        ),
        Span::raw(format!("  {age}")),
        Span::styled("   [q]uit ", Style::default().fg(Color::DarkGray)),
    ]);

    let paragraph = Paragraph::new(line).block(Block::default().borders(Borders::ALL));
    f.render_widget(paragraph, area);
}
