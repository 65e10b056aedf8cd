//! Application state and input handling.

use std::{io, path::PathBuf, time::Duration};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use pyboard_core::{BaudRate, SinkReader};
use pyboard_session::{RemoteFileEntry, SessionManager, SessionStatus};
use ratatui::{Terminal, backend::Backend};
use tokio::sync::{mpsc, watch};

use crate::ui;

/// Scrollback for one output sink.
#[derive(Default)]
pub struct Pane {
    pub lines: Vec<String>,
    partial: String,
    pub scroll: u16,
    pub follow: bool,
}

impl Pane {
    fn new() -> Self {
        Self {
            follow: true,
            ..Self::default()
        }
    }

    fn push(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial[..idx]
                .chars()
                .filter(|c| !c.is_control() || *c == '\t')
                .collect();
            self.lines.push(line);
            self.partial.drain(..=idx);
        }
    }

    /// Lines including the unterminated tail.
    pub fn visible(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .chain((!self.partial.is_empty()).then_some(self.partial.as_str()))
    }

    pub fn scroll_for(&self, height: u16) -> u16 {
        if self.follow {
            let total = u16::try_from(self.lines.len() + 1).unwrap_or(u16::MAX);
            total.saturating_sub(height)
        } else {
            self.scroll
        }
    }

    fn scroll_up(&mut self, by: u16, height: u16) {
        self.scroll = self.scroll_for(height).saturating_sub(by);
        self.follow = false;
    }

    fn scroll_down(&mut self, by: u16, height: u16) {
        self.scroll = self.scroll_for(height).saturating_add(by);
        if self.scroll >= self.scroll_for_latest(height) {
            self.follow = true;
        }
    }

    fn scroll_for_latest(&self, height: u16) -> u16 {
        let total = u16::try_from(self.lines.len() + 1).unwrap_or(u16::MAX);
        total.saturating_sub(height)
    }
}

/// Results that come back from spawned operations.
enum Reply {
    Viewed { name: String, text: String },
}

pub struct App {
    manager: SessionManager,
    pub ports: watch::Receiver<Vec<String>>,
    pub status: watch::Receiver<SessionStatus>,
    pub listing: watch::Receiver<Vec<RemoteFileEntry>>,
    pub log: Pane,
    pub console: Pane,
    log_rx: mpsc::UnboundedReceiver<String>,
    console_rx: mpsc::UnboundedReceiver<String>,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: mpsc::UnboundedReceiver<Reply>,
    pub input: String,
    pub selected_port: usize,
    pub selected_file: usize,
    pub baud: BaudRate,
    pub viewer: Option<(String, String)>,
    quit: bool,
}

impl App {
    pub fn new(
        manager: SessionManager,
        ports: watch::Receiver<Vec<String>>,
        log: SinkReader,
        console: SinkReader,
        baud: BaudRate,
    ) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            status: manager.subscribe_status(),
            listing: manager.listing(),
            manager,
            ports,
            log: Pane::new(),
            console: Pane::new(),
            log_rx: forward(&log),
            console_rx: forward(&console),
            replies_tx,
            replies_rx,
            input: String::new(),
            selected_port: 0,
            selected_file: 0,
            baud,
            viewer: None,
            quit: false,
        }
    }

    pub async fn run<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> io::Result<()> {
        while !self.quit {
            self.drain();
            terminal.draw(|f| ui::draw(f, self))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key);
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn drain(&mut self) {
        while let Ok(text) = self.log_rx.try_recv() {
            self.log.push(&text);
        }
        while let Ok(text) = self.console_rx.try_recv() {
            self.console.push(&text);
        }
        while let Ok(reply) = self.replies_rx.try_recv() {
            match reply {
                Reply::Viewed { name, text } => self.viewer = Some((name, text)),
            }
        }
        let files = self.listing.borrow().len();
        self.selected_file = self.selected_file.min(files.saturating_sub(1));
    }

    pub fn current_port(&self) -> Option<String> {
        self.ports.borrow().get(self.selected_port).cloned()
    }

    fn selected_entry(&self) -> Option<RemoteFileEntry> {
        self.listing.borrow().get(self.selected_file).cloned()
    }

    fn handle_key(&mut self, key: KeyEvent) {
        const PAGE: u16 = 10;
        match key {
            KeyEvent {
                code: KeyCode::Char('c' | 'q'),
                modifiers: KeyModifiers::CONTROL,
                ..
            } => self.quit = true,
            KeyEvent {
                code: KeyCode::F(2), ..
            } => self.toggle_connection(),
            KeyEvent {
                code: KeyCode::F(3), ..
            } => {
                let count = self.ports.borrow().len().max(1);
                self.selected_port = (self.selected_port + 1) % count;
            }
            KeyEvent {
                code: KeyCode::F(4), ..
            } => {
                self.baud = match self.baud {
                    BaudRate::B115200 => BaudRate::B9600,
                    BaudRate::B9600 => BaudRate::B115200,
                };
            }
            KeyEvent {
                code: KeyCode::F(5), ..
            } => self.spawn_list(String::new()),
            KeyEvent {
                code: KeyCode::Delete,
                ..
            } => {
                if let Some(entry) = self.selected_entry() {
                    self.spawn_delete(entry.name, false);
                }
            }
            KeyEvent {
                code: KeyCode::Esc, ..
            } => self.viewer = None,
            KeyEvent {
                code: KeyCode::Up,
                modifiers: KeyModifiers::CONTROL,
                ..
            } => self.log.scroll_up(1, ui::LOG_HEIGHT),
            KeyEvent {
                code: KeyCode::Down,
                modifiers: KeyModifiers::CONTROL,
                ..
            } => self.log.scroll_down(1, ui::LOG_HEIGHT),
            KeyEvent {
                code: KeyCode::Up, ..
            } => self.selected_file = self.selected_file.saturating_sub(1),
            KeyEvent {
                code: KeyCode::Down,
                ..
            } => self.selected_file = self.selected_file.saturating_add(1),
            KeyEvent {
                code: KeyCode::PageUp,
                ..
            } => self.console.scroll_up(PAGE, ui::CONSOLE_HEIGHT),
            KeyEvent {
                code: KeyCode::PageDown,
                ..
            } => self.console.scroll_down(PAGE, ui::CONSOLE_HEIGHT),
            KeyEvent {
                code: KeyCode::Enter,
                ..
            } => self.submit_input(),
            KeyEvent {
                code: KeyCode::Backspace,
                ..
            } => {
                self.input.pop();
            }
            KeyEvent {
                code: KeyCode::Char(c),
                modifiers: KeyModifiers::NONE | KeyModifiers::SHIFT,
                ..
            } => self.input.push(c),
            _ => {}
        }
    }

    fn submit_input(&mut self) {
        let input = std::mem::take(&mut self.input);
        let trimmed = input.trim();
        if trimmed.is_empty() {
            if let Some(entry) = self.selected_entry() {
                if entry.is_directory {
                    self.spawn_list(entry.name);
                } else {
                    self.spawn_view(entry.name);
                }
            }
            return;
        }
        match trimmed.strip_prefix(':') {
            Some(command) => self.run_command(command),
            None => self.spawn_free_text(input),
        }
    }

    /// `:command args`, with a trailing `!` allowing protected files.
    fn run_command(&mut self, command: &str) {
        let (command, force) = match command.strip_suffix('!') {
            Some(rest) => (rest.trim_end(), true),
            None => (command, false),
        };
        let (verb, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(verb, arg)| (verb, arg.trim()));

        let router = self.manager.router().clone();
        match (verb, arg) {
            ("q" | "quit", _) => self.quit = true,
            ("connect", "") => self.toggle_connection(),
            ("connect", port) => self.connect_to(port.to_string()),
            ("disconnect", _) => self.spawn_disconnect(),
            ("ls", path) => self.spawn_list(path.to_string()),
            ("cat", name) if !name.is_empty() => self.spawn_view(name.to_string()),
            ("rm", name) if !name.is_empty() => self.spawn_delete(name.to_string(), force),
            ("put", path) if !path.is_empty() => self.spawn_upload(PathBuf::from(path), force),
            ("run", path) if !path.is_empty() => self.spawn_run(PathBuf::from(path)),
            ("baud", value) => match value.parse::<u32>().map(BaudRate::try_from) {
                Ok(Ok(baud)) => self.baud = baud,
                _ => router.warn(format!("Unsupported baud rate {value:?}")),
            },
            _ => router.warn(format!("Unknown command :{command}")),
        }
    }

    fn toggle_connection(&mut self) {
        if self.status.borrow().is_connected() {
            self.spawn_disconnect();
        } else if let Some(port) = self.current_port() {
            self.connect_to(port);
        } else {
            self.manager.router().warn("No serial port available");
        }
    }

    pub fn connect_to(&self, port: String) {
        let manager = self.manager.clone();
        let baud = self.baud;
        tokio::spawn(async move {
            // Failures are reported on the program log.
            let _ = manager.connect(&port, baud).await;
        });
    }

    fn spawn_disconnect(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move { manager.disconnect().await });
    }

    fn spawn_list(&self, path: String) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Ok(entries) = manager.list(&path).await {
                if !path.is_empty() {
                    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
                    manager
                        .router()
                        .info(format!("{path}: {}", names.join(", ")));
                }
            }
        });
    }

    fn spawn_view(&self, name: String) {
        let manager = self.manager.clone();
        let replies = self.replies_tx.clone();
        tokio::spawn(async move {
            if let Ok(text) = manager.read_text(&name).await {
                let _ = replies.send(Reply::Viewed { name, text });
            }
        });
    }

    fn spawn_delete(&self, name: String, force: bool) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let _ = manager.delete(&name, force).await;
        });
    }

    fn spawn_upload(&self, path: PathBuf, force: bool) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let _ = manager.upload_file(&path, force).await;
        });
    }

    fn spawn_run(&self, path: PathBuf) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let _ = manager.run_file(&path).await;
        });
    }

    fn spawn_free_text(&self, text: String) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let _ = manager.run_free_text(&text).await;
        });
    }
}

/// Forward a sink's history and live appends as text.
fn forward(reader: &SinkReader) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut stream = reader.history_plus_stream();
    tokio::spawn(async move {
        while let Some(bytes) = stream.next().await {
            if tx.send(String::from_utf8_lossy(&bytes).into_owned()).is_err() {
                break;
            }
        }
    });
    rx
}
