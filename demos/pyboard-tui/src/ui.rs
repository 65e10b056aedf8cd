//! Rendering.

use pyboard_session::SessionState;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};

use crate::app::{App, Pane};

/// Visible program log lines.
pub const LOG_HEIGHT: u16 = 6;

/// Typical visible console lines, used for keyboard scrolling.
pub const CONSOLE_HEIGHT: u16 = 15;

const KEY: Style = Style::new().fg(Color::Yellow);

pub fn draw(f: &mut Frame, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),              // Status
            Constraint::Min(6),                 // Files + console
            Constraint::Length(LOG_HEIGHT + 2), // Program log
            Constraint::Length(3),              // Input
            Constraint::Length(1),              // Help
        ])
        .split(f.area());

    draw_status(f, app, rows[0]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(rows[1]);
    draw_files(f, app, columns[0]);

    if let Some((name, text)) = &app.viewer {
        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(columns[1]);
        let viewer = Paragraph::new(text.as_str())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("{name} (Esc to close)")),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(viewer, right[0]);
        draw_pane(f, &app.console, "Device console", right[1]);
    } else {
        draw_pane(f, &app.console, "Device console", columns[1]);
    }

    draw_pane(f, &app.log, "Program log", rows[2]);

    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::Yellow))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Input (code, or :ls :cat :put :rm :run :connect :disconnect :baud :q)"),
        );
    f.render_widget(input, rows[3]);
    let cursor = u16::try_from(app.input.chars().count()).unwrap_or(u16::MAX);
    f.set_cursor_position((rows[3].x + cursor.saturating_add(1), rows[3].y + 1));

    let help = Paragraph::new(Line::from(vec![
        Span::styled(" F2", KEY),
        Span::raw(" connect | "),
        Span::styled("F3", KEY),
        Span::raw(" port | "),
        Span::styled("F4", KEY),
        Span::raw(" baud | "),
        Span::styled("F5", KEY),
        Span::raw(" refresh | "),
        Span::styled("Enter", KEY),
        Span::raw(" view | "),
        Span::styled("Del", KEY),
        Span::raw(" delete | "),
        Span::styled("PgUp/PgDn", KEY),
        Span::raw(" console | "),
        Span::styled("Ctrl+C", KEY),
        Span::raw(" quit"),
    ]));
    f.render_widget(help, rows[4]);
}

fn draw_status(f: &mut Frame, app: &App, area: Rect) {
    let status = app.status.borrow().clone();
    let (label, color) = match status.state {
        SessionState::Connected => ("Connected", Color::Green),
        SessionState::Connecting => ("Connecting", Color::Yellow),
        SessionState::Disconnected => ("Disconnected", Color::Red),
    };
    let port = status
        .port
        .or_else(|| app.current_port())
        .unwrap_or_else(|| "no port".to_string());
    let ports = app.ports.borrow().len();

    let line = Line::from(vec![
        Span::raw(" "),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw(format!(" | {port} @ {} baud | {ports} port(s) visible", app.baud)),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn draw_files(f: &mut Frame, app: &App, area: Rect) {
    let listing = app.listing.borrow();
    let items: Vec<ListItem> = listing
        .iter()
        .map(|entry| {
            if entry.is_directory {
                ListItem::new(format!("{}/", entry.name)).style(Style::default().fg(Color::Cyan))
            } else {
                ListItem::new(format!("{}: {} bytes", entry.name, entry.size_bytes))
            }
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Board files"))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state =
        ListState::default().with_selected((!listing.is_empty()).then_some(app.selected_file));
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_pane(f: &mut Frame, pane: &Pane, title: &str, area: Rect) {
    let height = area.height.saturating_sub(2);
    let lines: Vec<Line> = pane.visible().map(Line::from).collect();
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .scroll((pane.scroll_for(height), 0));
    f.render_widget(widget, area);
}
