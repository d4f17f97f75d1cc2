use crate::app::{App, AppView, Panel, STATS_WINDOW_DAYS};
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, GraphType, Paragraph, Row, Table},
    Frame,
};
use speedgauge::settings::SettingsField;
use speedgauge::speedtest::format_speed;
use speedgauge::{MeasurementRecord, TestPhase, UploadRate};

// Color Palette - Elegant & Minimal
const ACCENT: Color = Color::Rgb(100, 149, 237); // Cornflower blue
const SUCCESS: Color = Color::Rgb(134, 194, 156); // Soft green
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220); // Soft blue
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130); // Soft amber
const ERROR: Color = Color::Rgb(220, 120, 120);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

const SEPARATOR: &str = "  ·  ";

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();
    match app.view {
        AppView::Main => draw_main_view(frame, area, app),
        AppView::Settings => draw_settings_view(frame, area, app),
        AppView::History => draw_history_view(frame, area, app),
    }
}

/// What one of the three result panels shows.
struct MetricPanel<'a> {
    title: &'static str,
    color: Color,
    dim: Color,
    value: String,
    /// Second line: a progress bar for transfers, jitter text for latency.
    detail: Detail,
    samples: &'a [f64],
    unit: &'static str,
}

enum Detail {
    Progress(f64),
    Text(String),
}

impl<'a> MetricPanel<'a> {
    fn of(app: &'a App, panel: Panel) -> Self {
        match panel {
            Panel::Download => Self {
                title: "Download",
                color: SUCCESS,
                dim: SUCCESS_DIM,
                value: format_speed(current_download_bps(app)),
                detail: Detail::Progress(app.phase_fraction(TestPhase::Downloading)),
                samples: &app.download_samples,
                unit: "Mbps",
            },
            Panel::Upload => Self {
                title: "Upload",
                color: INFO,
                dim: INFO_DIM,
                value: upload_text(app),
                detail: Detail::Progress(app.phase_fraction(TestPhase::Uploading)),
                samples: &app.upload_samples,
                unit: "Mbps",
            },
            Panel::Ping => Self {
                title: "Latency",
                color: WARN,
                dim: WARN,
                value: latency_text(app),
                detail: Detail::Text(jitter_text(app)),
                samples: &app.ping_samples,
                unit: "ms",
            },
        }
    }

    /// Headline plus avg/max/min of the chart series, for the expanded view.
    fn summary_line(&self) -> Line<'static> {
        let mut spans = vec![Span::styled(
            self.value.clone(),
            Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
        )];
        if let Detail::Text(text) = &self.detail {
            spans.push(Span::styled(SEPARATOR, Style::default().fg(TEXT_MUTED)));
            spans.push(Span::styled(text.clone(), Style::default().fg(TEXT_SECONDARY)));
        }
        if let Some(stats) = SeriesStats::of(self.samples) {
            for (label, v) in [("avg", stats.avg), ("max", stats.max), ("min", stats.min)] {
                spans.push(Span::styled(SEPARATOR, Style::default().fg(TEXT_MUTED)));
                spans.push(Span::styled(
                    format!("{} {:.1} {}", label, v, self.unit),
                    Style::default().fg(TEXT_MUTED),
                ));
            }
        }
        Line::from(spans)
    }
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(8),
        Constraint::Length(1),
    ])
    .split(area);

    draw_header(frame, chunks[0], app);

    if app.expanded {
        let panel = MetricPanel::of(app, app.selected_panel);
        draw_panel(frame, chunks[1], &panel, true, true);
    } else {
        let columns = Layout::horizontal([Constraint::Ratio(1, 3); 3]).split(chunks[1]);
        for (area, panel) in columns
            .iter()
            .zip([Panel::Download, Panel::Upload, Panel::Ping])
        {
            let selected = app.selected_panel == panel;
            draw_panel(frame, *area, &MetricPanel::of(app, panel), selected, false);
        }
    }

    draw_help(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let inner = draw_title_bar(frame, area, "speedgauge");
    let chunks = Layout::horizontal([
        Constraint::Length(12),
        Constraint::Min(10),
        Constraint::Length(20),
    ])
    .split(inner);

    let (status, color) = match app.phase {
        TestPhase::Idle => (format!("Ready · {}", app.server_label()), TEXT_MUTED),
        TestPhase::Probing => ("Measuring latency...".to_string(), WARN),
        TestPhase::Downloading => ("Testing download...".to_string(), SUCCESS),
        TestPhase::Uploading => ("Testing upload...".to_string(), INFO),
        TestPhase::Complete => (complete_status(app), ACCENT),
        TestPhase::Failed => (
            format!("Failed: {}", app.error.as_deref().unwrap_or("unknown error")),
            ERROR,
        ),
    };

    frame.render_widget(
        Paragraph::new(status)
            .style(Style::default().fg(color))
            .alignment(Alignment::Center),
        chunks[1],
    );
    frame.render_widget(
        Paragraph::new(phase_marks(app.phase)).alignment(Alignment::Right),
        chunks[2],
    );
}

/// Bold title above a bottom border; returns the area inside the border.
fn draw_title_bar(frame: &mut Frame, area: Rect, title: &str) -> Rect {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(area);
    frame.render_widget(block, area);
    frame.render_widget(
        Paragraph::new(title.to_string())
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        inner,
    );
    inner
}

fn complete_status(app: &App) -> String {
    let mut status = format!("Complete · {}", app.server_label());
    if let Some(address) = &app.client.address {
        status.push_str(&format!(" · {}", address));
    }
    if let Some(provider) = &app.client.provider {
        status.push_str(&format!(" ({})", provider));
    }
    status
}

fn phase_marks(phase: TestPhase) -> Line<'static> {
    let steps = [
        (TestPhase::Probing, "ping"),
        (TestPhase::Downloading, "down"),
        (TestPhase::Uploading, "up"),
    ];
    let position = steps.iter().position(|(p, _)| *p == phase);

    let mut spans = Vec::new();
    for (i, (_, label)) in steps.iter().enumerate() {
        let done = phase == TestPhase::Complete || position.is_some_and(|at| i < at);
        let style = if position == Some(i) {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if done {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };
        if i > 0 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
        spans.push(Span::styled(*label, style));
    }
    Line::from(spans)
}

fn draw_panel(frame: &mut Frame, area: Rect, panel: &MetricPanel, selected: bool, expanded: bool) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if selected { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            format!(" {} ", panel.title),
            Style::default().fg(if selected { panel.color } else { TEXT_SECONDARY }),
        ));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    let headline = if expanded {
        panel.summary_line()
    } else {
        Line::from(Span::styled(
            panel.value.clone(),
            Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
        ))
    };
    frame.render_widget(Paragraph::new(headline).alignment(Alignment::Center), chunks[0]);

    match &panel.detail {
        Detail::Progress(ratio) => draw_progress_bar(frame, chunks[1], *ratio, panel.color, panel.dim),
        Detail::Text(text) if !expanded => frame.render_widget(
            Paragraph::new(text.clone())
                .style(Style::default().fg(TEXT_MUTED))
                .alignment(Alignment::Center),
            chunks[1],
        ),
        Detail::Text(_) => {}
    }

    let unit = expanded.then_some(panel.unit);
    draw_chart(frame, chunks[2], panel.samples, panel.color, unit);
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

/// Line chart of `data`. With a unit, adds y labels and a dashed average.
fn draw_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: Option<&str>) {
    let Some(stats) = SeriesStats::of(data) else {
        return;
    };
    if area.width < 4 || area.height < 2 {
        return;
    }

    let (y_min, y_max) = stats.bounds();
    let x_max = data.len() as f64;
    let points: Vec<(f64, f64)> = data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect();
    let avg_line = [(0.0, stats.avg), (x_max, stats.avg)];

    let mut datasets = vec![Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points)];
    let mut y_axis = Axis::default().bounds([y_min, y_max]);

    if let Some(unit) = unit {
        datasets.push(
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(TEXT_MUTED))
                .data(&avg_line),
        );
        y_axis = y_axis.style(Style::default().fg(BORDER)).labels(vec![
            Span::styled(format!("{:.0}", y_min), Style::default().fg(TEXT_MUTED)),
            Span::styled(format!("{:.0} {}", y_max, unit), Style::default().fg(TEXT_MUTED)),
        ]);
    }

    let chart = Chart::new(datasets)
        .x_axis(Axis::default().style(Style::default().fg(BORDER)).bounds([0.0, x_max]))
        .y_axis(y_axis);
    frame.render_widget(chart, area);
}

// Settings
fn draw_settings_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    draw_title_bar(frame, chunks[0], "Settings");

    let content_area = Layout::horizontal([
        Constraint::Length(2),
        Constraint::Min(30),
        Constraint::Length(2),
    ])
    .split(chunks[1])[1];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(content_area);
    frame.render_widget(block, content_area);

    let fields = [
        (SettingsField::DownloadDuration, "Download time", format!("{} s", app.settings.download_duration_secs)),
        (SettingsField::UploadDuration, "Upload time", format!("{} s", app.settings.upload_duration_secs)),
        (SettingsField::Server, "Server", app.server_label()),
    ];
    let rows = Layout::vertical([Constraint::Length(3); 3]).split(inner);
    for (area, (field, label, value)) in rows.iter().zip(fields) {
        draw_setting_row(frame, *area, label, &value, app.selected_setting == field);
    }

    frame.render_widget(
        Paragraph::new("↑↓ select · ←→ adjust · d delete custom server · enter done")
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[2],
    );
}

fn draw_setting_row(frame: &mut Frame, area: Rect, label: &str, value: &str, selected: bool) {
    let chunks = Layout::horizontal([Constraint::Length(16), Constraint::Min(10)]).split(area);

    let (label_color, value_text, value_color) = if selected {
        (ACCENT, format!("< {} >", value), TEXT_PRIMARY)
    } else {
        (TEXT_SECONDARY, value.to_string(), TEXT_MUTED)
    };

    frame.render_widget(
        Paragraph::new(format!(" {}", label)).style(Style::default().fg(label_color)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(value_text).style(Style::default().fg(value_color)),
        chunks[1],
    );
}

// History
fn draw_history_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Min(5),
        Constraint::Length(1),
    ])
    .split(area);

    draw_title_bar(frame, chunks[0], "History");

    let summary = match &app.stats {
        Some(stats) if stats.count > 0 => {
            let upload = match (stats.mean_upload_bps, stats.mean_simulated_upload_bps) {
                (Some(bps), _) => rate_text(Some(UploadRate::Measured(bps))),
                (None, Some(bps)) => rate_text(Some(UploadRate::Simulated(bps))),
                (None, None) => rate_text(None),
            };
            let latency = stats
                .mean_latency_ms
                .map(|ms| format!("{:.0} ms", ms))
                .unwrap_or_else(|| "—".to_string());
            Line::from(vec![
                Span::styled(
                    format!("last {} days · {} runs", STATS_WINDOW_DAYS, stats.count),
                    Style::default().fg(TEXT_SECONDARY),
                ),
                Span::styled(SEPARATOR, Style::default().fg(TEXT_MUTED)),
                Span::styled(
                    format!("down {}", format_speed(stats.mean_download_bps)),
                    Style::default().fg(SUCCESS),
                ),
                Span::styled(SEPARATOR, Style::default().fg(TEXT_MUTED)),
                Span::styled(format!("up {}", upload), Style::default().fg(INFO)),
                Span::styled(SEPARATOR, Style::default().fg(TEXT_MUTED)),
                Span::styled(format!("ping {}", latency), Style::default().fg(WARN)),
            ])
        }
        _ => Line::from(Span::styled("no measurements yet", Style::default().fg(TEXT_MUTED))),
    };
    frame.render_widget(Paragraph::new(summary).alignment(Alignment::Center), chunks[1]);

    let header = Row::new(vec!["When", "Server", "Ping", "Download", "Upload"])
        .style(Style::default().fg(TEXT_SECONDARY).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = app.history.iter().map(history_row).collect();
    let table = Table::new(
        rows,
        [
            Constraint::Length(17),
            Constraint::Min(12),
            Constraint::Length(9),
            Constraint::Length(12),
            Constraint::Length(18),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(BORDER)),
    );
    frame.render_widget(table, chunks[2]);

    frame.render_widget(
        Paragraph::new("esc back")
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[3],
    );
}

fn history_row(record: &MeasurementRecord) -> Row<'static> {
    let when = record
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M")
        .to_string();
    let latency = if record.has_latency() {
        format!("{:.0} ms", record.latency_ms)
    } else {
        "—".to_string()
    };
    Row::new(vec![
        Cell::from(when).style(Style::default().fg(TEXT_MUTED)),
        Cell::from(record.target_label.clone()).style(Style::default().fg(TEXT_SECONDARY)),
        Cell::from(latency).style(Style::default().fg(WARN)),
        Cell::from(format_speed(record.download_bps)).style(Style::default().fg(SUCCESS)),
        Cell::from(rate_text(record.upload)).style(Style::default().fg(INFO)),
    ])
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = if app.expanded {
        "esc close · q quit"
    } else if app.phase.is_active() {
        "tab select · space expand · esc cancel · q quit"
    } else {
        "enter start · s settings · h history · tab select · space expand · q quit"
    };

    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

// Helpers
fn current_download_bps(app: &App) -> f64 {
    app.download_bps
        .unwrap_or_else(|| app.download_samples.last().copied().unwrap_or(0.0) * 1_000_000.0)
}

fn rate_text(upload: Option<UploadRate>) -> String {
    match upload {
        Some(UploadRate::Measured(bps)) => format_speed(bps),
        Some(UploadRate::Simulated(bps)) => format!("~{} (est.)", format_speed(bps)),
        None => "n/a".to_string(),
    }
}

fn upload_text(app: &App) -> String {
    if app.upload_done {
        return rate_text(app.upload);
    }
    format_speed(app.upload_samples.last().copied().unwrap_or(0.0) * 1_000_000.0)
}

fn latency_text(app: &App) -> String {
    match &app.latency {
        Some(est) if est.has_signal() => format!("{:.0} ms", est.avg_ms),
        Some(_) => "no reply".to_string(),
        None => app
            .ping_samples
            .last()
            .map(|ms| format!("{:.0} ms", ms))
            .unwrap_or_else(|| "—".to_string()),
    }
}

fn jitter_text(app: &App) -> String {
    match &app.latency {
        Some(est) if est.has_signal() => format!(
            "jitter {:.1} ms · {}/{} answered",
            est.jitter_ms, est.samples, est.attempts
        ),
        Some(est) => format!("jitter — · 0/{} answered", est.attempts),
        None => "jitter —".to_string(),
    }
}

#[derive(Debug, PartialEq)]
struct SeriesStats {
    avg: f64,
    min: f64,
    max: f64,
}

impl SeriesStats {
    fn of(data: &[f64]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let (min, max) = data
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Some(Self {
            avg: data.iter().sum::<f64>() / data.len() as f64,
            min,
            max,
        })
    }

    /// Y range with a tenth of headroom on each side, never below zero.
    fn bounds(&self) -> (f64, f64) {
        let pad = (self.max - self.min).max(0.1) * 0.1;
        ((self.min - pad).max(0.0), self.max + pad)
    }
}
