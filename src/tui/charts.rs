use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};

use super::state::{ChartLayout, UiState};
use crate::metrics;
use crate::model::{Panel, SeriesStats, TimeAxis};

const SERIES_COLORS: [Color; 8] = [
    Color::Green,
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::LightRed,
    Color::LightGreen,
    Color::LightCyan,
];

/// Below this many rows a stacked chart is unreadable; fall back to overlay.
const MIN_STACKED_HEIGHT: u16 = 6;

pub fn series_color(i: usize) -> Color {
    SERIES_COLORS[i % SERIES_COLORS.len()]
}

pub struct ChartRenderParams<'a> {
    pub area: Rect,
    pub datasets: Vec<Dataset<'a>>,
    pub x_axis: Axis<'a>,
    pub y_axis: Axis<'a>,
    pub title: Line<'a>,
    pub metrics: Option<SeriesStats>,
    pub color: Color,
}

/// Render a chart with a one-line stats footer inside the same bordered box.
pub fn render_chart_with_metrics_inside(f: &mut Frame, p: ChartRenderParams) {
    // Get inner area (accounting for borders)
    let inner = if p.area.width > 2 && p.area.height > 2 {
        Rect {
            x: p.area.x + 1,
            y: p.area.y + 1,
            width: p.area.width.saturating_sub(2),
            height: p.area.height.saturating_sub(2),
        }
    } else {
        p.area
    };

    let chart_metrics = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(2), Constraint::Length(1)].as_ref())
        .split(inner);

    let chart = Chart::new(p.datasets).x_axis(p.x_axis).y_axis(p.y_axis);
    f.render_widget(chart, chart_metrics[0]);

    if let Some(m) = p.metrics {
        f.render_widget(
            Paragraph::new(render_metrics_text(m, p.color)).alignment(Alignment::Center),
            chart_metrics[1],
        );
    }

    let block = Block::default().borders(Borders::ALL).title(p.title);
    f.render_widget(block, p.area);
}

fn render_metrics_text<'a>(m: SeriesStats, color: Color) -> Line<'a> {
    let mut spans = Vec::new();
    for (label, v) in [
        ("latest", m.latest),
        ("min", m.min),
        ("max", m.max),
        ("mean", m.mean),
    ] {
        if !spans.is_empty() {
            spans.push(Span::raw(" "));
        }
        spans.push(Span::styled(label, Style::default().fg(Color::Gray)));
        spans.push(Span::styled(format!(" {v:.3}"), Style::default().fg(color)));
    }
    Line::from(spans)
}

/// X bounds over every series of the panel.
pub fn x_bounds(panel: &Panel) -> [f64; 2] {
    let (lo, hi) = panel
        .series
        .values()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (x, _)| {
            (lo.min(*x), hi.max(*x))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return [0.0, 1.0];
    }
    if hi - lo < f64::EPSILON {
        return [lo, lo + 1.0];
    }
    [lo, hi]
}

fn axis_labels<'a>(bounds: [f64; 2], precision: usize) -> Vec<Span<'a>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::raw(format!("{v:.precision$}")))
        .collect()
}

fn x_axis<'a>(bounds: [f64; 2], time_axis: TimeAxis) -> Axis<'a> {
    let title = match time_axis {
        TimeAxis::Received => "t (s since first)",
        TimeAxis::Sent => "device t (s)",
    };
    Axis::default()
        .title(title)
        .style(Style::default().fg(Color::Gray))
        .bounds(bounds)
        .labels(axis_labels(bounds, 1))
}

/// Draw the selected panel in the requested layout.
pub fn draw_panel(area: Rect, f: &mut Frame, state: &UiState, panel: &Panel) {
    if panel.is_empty() {
        let empty = Paragraph::new("No data")
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title(panel_title(panel)));
        f.render_widget(empty, area);
        return;
    }

    let count = panel.series.len() as u16;
    let stacked_fits = area.height / count.max(1) >= MIN_STACKED_HEIGHT;
    match state.layout {
        ChartLayout::Stacked if stacked_fits => draw_stacked(area, f, state.time_axis, panel),
        _ => draw_overlay(area, f, state.time_axis, panel),
    }
}

fn panel_title<'a>(panel: &Panel) -> Line<'a> {
    Line::from(vec![
        Span::styled(
            format!("{} / {}", panel.packet_type, panel.sender),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(format!(
            " ({} packets, endpoints {})",
            panel.packets,
            if panel.endpoints.is_empty() {
                "-".to_string()
            } else {
                panel.endpoints.join(", ")
            }
        )),
    ])
}

fn draw_stacked(area: Rect, f: &mut Frame, time_axis: TimeAxis, panel: &Panel) {
    let n = panel.series.len();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Ratio(1, n as u32); n])
        .split(area);
    let xb = x_bounds(panel);

    for (row, (i, (idx, points))) in rows.iter().zip(panel.series.iter().enumerate()) {
        let color = series_color(i);
        let stats = panel.stats.get(idx).copied();
        let yb = stats
            .map(|s| metrics::padded_bounds(s.min, s.max))
            .unwrap_or([0.0, 1.0]);
        let ds = Dataset::default()
            .name(format!("Idx {idx}"))
            .graph_type(GraphType::Line)
            .marker(symbols::Marker::Braille)
            .style(Style::default().fg(color))
            .data(points);
        let mut title = vec![Span::styled(format!("Idx {idx}"), Style::default().fg(color))];
        if let Some(s) = stats {
            title.push(Span::raw(format!(" = {:.3}", s.latest)));
        }
        if i == 0 {
            title.push(Span::raw("  "));
            title.extend(panel_title(panel).spans);
        }
        render_chart_with_metrics_inside(
            f,
            ChartRenderParams {
                area: *row,
                datasets: vec![ds],
                x_axis: x_axis(xb, time_axis),
                y_axis: Axis::default()
                    .style(Style::default().fg(Color::Gray))
                    .bounds(yb)
                    .labels(axis_labels(yb, 2)),
                title: Line::from(title),
                metrics: stats,
                color,
            },
        );
    }
}

fn draw_overlay(area: Rect, f: &mut Frame, time_axis: TimeAxis, panel: &Panel) {
    // Normalized copies must outlive the datasets that borrow them.
    let normalized: Vec<(i64, Vec<(f64, f64)>)> = panel
        .series
        .iter()
        .map(|(idx, points)| {
            let pts = match panel.stats.get(idx) {
                Some(s) => metrics::normalize(points, s.min, s.max),
                None => Vec::new(),
            };
            (*idx, pts)
        })
        .collect();

    let datasets: Vec<Dataset> = normalized
        .iter()
        .enumerate()
        .map(|(i, (idx, pts))| {
            let name = match panel.stats.get(idx) {
                Some(s) => format!(
                    "Idx {idx} = {:.3} [{:.3}..{:.3}]",
                    s.latest, s.min, s.max
                ),
                None => format!("Idx {idx}"),
            };
            Dataset::default()
                .name(name)
                .graph_type(GraphType::Line)
                .marker(symbols::Marker::Braille)
                .style(Style::default().fg(series_color(i)))
                .data(pts)
        })
        .collect();

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(panel_title(panel)))
        .x_axis(x_axis(x_bounds(panel), time_axis))
        .y_axis(
            Axis::default()
                .title("normalized")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, 1.0])
                .labels(vec![Span::raw("min"), Span::raw("max")]),
        )
        .hidden_legend_constraints((Constraint::Ratio(1, 1), Constraint::Ratio(1, 1)));
    f.render_widget(chart, area);
}
