// Control panel - terminal UI that edits the session settings and shows its status
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Terminal;
use std::io::{self, Stdout};
use std::sync::mpsc::Receiver;
use std::time::{Duration, SystemTime};

use ambeelight::config::{MAX_TRANSITION_MS, MIN_INTERVAL_MS};
use ambeelight::{AppConfig, SessionController, SessionState, StatusEvent};

const ACCENT: Color = Color::Rgb(0xDF, 0x28, 0x2F);
const MAX_LOG_LINES: usize = 100;
const BRIGHTNESS_STEP: u8 = 5;
const MS_STEP: u64 = 50;

type Term = Terminal<CrosstermBackend<Stdout>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Brightness,
    Interval,
    Transition,
}

impl Field {
    fn next(self) -> Self {
        match self {
            Field::Brightness => Field::Interval,
            Field::Interval => Field::Transition,
            Field::Transition => Field::Brightness,
        }
    }

    fn prev(self) -> Self {
        match self {
            Field::Brightness => Field::Transition,
            Field::Interval => Field::Brightness,
            Field::Transition => Field::Interval,
        }
    }
}

struct Panel {
    config: AppConfig,
    controller: SessionController,
    events: Receiver<StatusEvent>,
    connected: bool,
    error: Option<String>,
    selected: Field,
    address_input: Option<String>,
    event_log: Vec<String>,
}

fn get_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();

    // Format as HH:MM:SS.mmm
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        duration.subsec_millis()
    )
}

/// Run the control panel until the user quits. The session is stopped before returning.
pub fn run_control_panel(
    config: AppConfig,
    controller: SessionController,
    events: Receiver<StatusEvent>,
) -> Result<()> {
    controller.settings().store(&config.session_config());

    let mut panel = Panel {
        config,
        controller,
        events,
        connected: false,
        error: None,
        selected: Field::Brightness,
        address_input: None,
        event_log: Vec::new(),
    };
    panel.log("Ready - press Enter to toggle power".to_string());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    terminal.clear()?;
    terminal.hide_cursor()?;

    let result = panel.run(&mut terminal);

    // Restore the terminal on every exit path
    terminal.show_cursor()?;
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;

    panel.controller.shutdown();
    result
}

impl Panel {
    fn run(&mut self, terminal: &mut Term) -> Result<()> {
        loop {
            self.drain_events();
            terminal.draw(|f| self.draw(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press && !self.handle_key(key) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn log(&mut self, message: String) {
        self.event_log.push(format!("{} {}", get_timestamp(), message));
        if self.event_log.len() > MAX_LOG_LINES {
            self.event_log.remove(0);
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                StatusEvent::Connected => {
                    self.connected = true;
                    self.error = None;
                    self.log(format!("✅ Connected to {}", self.config.device_ip));
                    self.persist();
                }
                StatusEvent::Disconnected => {
                    self.connected = false;
                    self.log("⏹  Disconnected".to_string());
                }
                StatusEvent::Error(reason) => {
                    self.connected = false;
                    self.log(format!("❌ {}", reason));
                    self.error = Some(reason);
                }
            }
        }
    }

    // Written once per successful connect
    fn persist(&mut self) {
        let live = self.controller.settings().snapshot();
        self.config.brightness = live.brightness;
        self.config.interval_ms = live.interval.as_millis() as u64;
        if let Err(e) = self.config.save() {
            tracing::warn!("could not save config: {}", e);
            self.log(format!("⚠️  Could not save config: {}", e));
        }
    }

    // Returns false when the panel should close
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return false;
        }

        if let Some(input) = self.address_input.as_mut() {
            match key.code {
                KeyCode::Enter => {
                    self.config.device_ip = input.trim().to_string();
                    self.address_input = None;
                    self.error = None;
                }
                KeyCode::Esc => self.address_input = None,
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(c) if !c.is_whitespace() => input.push(c),
                _ => {}
            }
            return true;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') => return false,
            KeyCode::Enter | KeyCode::Char('p') | KeyCode::Char(' ') => self.toggle_power(),
            KeyCode::Char('a') => {
                if self.controller.state() == SessionState::Idle {
                    self.address_input = Some(self.config.device_ip.clone());
                }
            }
            KeyCode::Up => self.selected = self.selected.prev(),
            KeyCode::Down | KeyCode::Tab => self.selected = self.selected.next(),
            KeyCode::Left | KeyCode::Char('-') => self.adjust(false),
            KeyCode::Right | KeyCode::Char('+') | KeyCode::Char('=') => self.adjust(true),
            _ => {}
        }
        true
    }

    fn toggle_power(&mut self) {
        match self.controller.state() {
            SessionState::Idle => {
                let endpoint = match self.config.endpoint() {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        self.error = Some(e.to_string());
                        return;
                    }
                };
                self.error = None;
                self.controller.set_timeouts(self.config.timeouts());
                let session = self.controller.settings().snapshot();
                match self.controller.start(endpoint, session) {
                    Ok(()) => self.log(format!("🔌 Connecting to {}...", self.config.device_ip)),
                    Err(e) => self.error = Some(e.to_string()),
                }
            }
            SessionState::Connecting | SessionState::Streaming => {
                self.log("Stopping...".to_string());
                self.controller.stop();
            }
            SessionState::Stopping => {}
        }
    }

    fn adjust(&mut self, up: bool) {
        let settings = self.controller.settings();
        match self.selected {
            Field::Brightness => {
                let current = settings.brightness();
                let next = if up {
                    current.saturating_add(BRIGHTNESS_STEP)
                } else {
                    current.saturating_sub(BRIGHTNESS_STEP)
                };
                settings.set_brightness(next);
            }
            Field::Interval => {
                let current = settings.interval().as_millis() as u64;
                let next = if up { current + MS_STEP } else { current.saturating_sub(MS_STEP) };
                settings.set_interval(Duration::from_millis(next.max(MIN_INTERVAL_MS)));
            }
            // Locked once a session exists
            Field::Transition => {
                if self.controller.state() != SessionState::Idle {
                    return;
                }
                let current = self.config.transition_ms;
                self.config.transition_ms = if up {
                    (current + MS_STEP).min(MAX_TRANSITION_MS)
                } else {
                    current.saturating_sub(MS_STEP)
                };
            }
        }
    }

    fn draw(&self, f: &mut ratatui::Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(10),   // Main content
                Constraint::Length(3), // Footer
            ])
            .split(f.size());

        let header = Paragraph::new("Ambeelight")
            .style(Style::default().fg(ACCENT).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(header, chunks[0]);

        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(44), Constraint::Min(20)])
            .split(chunks[1]);

        let controls = Paragraph::new(self.control_lines())
            .block(Block::default().borders(Borders::ALL).title("Controls"));
        f.render_widget(controls, main[0]);

        let visible = main[1].height.saturating_sub(2) as usize;
        let start = self.event_log.len().saturating_sub(visible);
        let log_text: Vec<Line> = self.event_log[start..].iter().map(|s| Line::from(s.as_str())).collect();
        let log_widget = Paragraph::new(log_text).block(Block::default().borders(Borders::ALL).title("Events"));
        f.render_widget(log_widget, main[1]);

        let stats = self.controller.stats();
        let color = stats
            .last_color
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let footer_text = format!(
            "State: {} | Ticks: {} | Sent: {} | Skipped: {} | Drift fixes: {} | Color: {}",
            self.controller.state(),
            stats.ticks,
            stats.frames_sent,
            stats.captures_skipped,
            stats.drift_corrections,
            color
        );
        let footer = Paragraph::new(footer_text)
            .style(Style::default().fg(Color::Gray))
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(footer, chunks[2]);
    }

    fn control_lines(&self) -> Vec<Line<'static>> {
        let settings = self.controller.settings();
        let idle = self.controller.state() == SessionState::Idle;
        let label = |field: Field, text: &str| {
            let style = if self.selected == field {
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::White)
            };
            Span::styled(format!("{:<22}", text), style)
        };

        let address = match &self.address_input {
            Some(input) => Span::styled(format!("{}_", input), Style::default().fg(Color::Yellow)),
            None if self.config.device_ip.is_empty() => {
                Span::styled("(press 'a' to set)".to_string(), Style::default().fg(Color::DarkGray))
            }
            None => Span::raw(self.config.device_ip.clone()),
        };

        let transition_value = if idle {
            format!("{} ms", self.config.transition_ms)
        } else {
            format!("{} ms (locked)", self.config.transition_ms)
        };

        let power = if self.connected {
            Span::styled("● ON", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
        } else {
            Span::styled("● OFF", Style::default().fg(ACCENT).add_modifier(Modifier::BOLD))
        };

        let mut lines = vec![
            Line::from(vec![Span::styled("Yeelight IP: ", Style::default().fg(Color::Cyan)), address]),
            Line::from(""),
            Line::from(vec![
                label(Field::Brightness, "Brightness"),
                Span::raw(format!("{}", settings.brightness())),
            ]),
            Line::from(vec![
                label(Field::Interval, "Interval"),
                Span::raw(format!("{} ms", settings.interval().as_millis())),
            ]),
            Line::from(vec![label(Field::Transition, "Transition Duration"), Span::raw(transition_value)]),
            Line::from(""),
            Line::from(vec![Span::raw("Power: "), power]),
        ];

        if let Some(error) = &self.error {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(error.clone(), Style::default().fg(Color::Red))));
        }

        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Enter: power  a: address  ↑↓: select  ←→: adjust  q: quit",
            Style::default().fg(Color::DarkGray),
        )));
        lines
    }
}
