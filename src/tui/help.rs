use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

fn key_line<'a>(keys: &[&'a str], pad: usize, what: &'a str) -> Line<'a> {
    let mut spans = vec![Span::raw("  ")];
    let mut width = 0;
    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw(" / "));
            width += 3;
        }
        spans.push(Span::styled(*k, Style::default().fg(Color::Magenta)));
        width += k.chars().count();
    }
    spans.push(Span::raw(" ".repeat(pad.saturating_sub(width).max(1))));
    spans.push(Span::raw(what));
    Line::from(spans)
}

pub fn help_lines() -> Vec<Line<'static>> {
    vec![
        Line::from("Keybinds:"),
        key_line(&["q", "Ctrl-C"], 18, "Quit"),
        key_line(&["Tab", "Shift-Tab"], 18, "Next / previous packet type"),
        key_line(&["←", "→"], 18, "Previous / next packet type"),
        key_line(&["[", "]"], 18, "Previous / next sender"),
        key_line(&["h", "l"], 18, "Previous / next sender"),
        key_line(&["m"], 18, "Toggle stacked / overlay charts"),
        key_line(&["t"], 18, "Toggle received / sent time axis"),
        key_line(&["p"], 18, "Pause / resume refresh"),
        key_line(&["r"], 18, "Refresh now"),
        key_line(&["?"], 18, "Show / hide this help"),
        Line::from(""),
        Line::from("Overlay charts scale every index to its own range;"),
        Line::from("the legend shows the real min and max."),
    ]
}

/// Centered help overlay on top of whatever is drawn below.
pub fn draw_help(area: Rect, f: &mut Frame) {
    let lines = help_lines();
    let height = (lines.len() as u16 + 2).min(area.height);
    let width = 60.min(area.width);
    let popup = Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    };
    f.render_widget(Clear, popup);
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, popup);
}
