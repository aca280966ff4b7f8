//! SVG loss-curve charts
//!
//! Renders per-epoch loss histories as a standalone SVG line chart that is
//! written next to the scalar log at the end of a run.

use std::fs;
use std::path::Path;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 180.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 70.0;

const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// Colors cycled across series
pub const SERIES_COLORS: [&str; 6] = [
    "#3498db", "#e74c3c", "#2ecc71", "#9b59b6", "#f39c12", "#1abc9c",
];

/// One named curve, y-values indexed by epoch
#[derive(Debug, Clone)]
pub struct LossSeries {
    pub name: String,
    pub values: Vec<f64>,
    pub color: String,
}

impl LossSeries {
    pub fn new(name: impl Into<String>, values: Vec<f64>, index: usize) -> Self {
        Self {
            name: name.into(),
            values,
            color: SERIES_COLORS[index % SERIES_COLORS.len()].to_string(),
        }
    }
}

/// Render a line chart of epoch-indexed losses to an SVG string
pub fn render_loss_chart(title: &str, series: &[LossSeries]) -> String {
    let plot_width = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let epochs = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    let x_span = (epochs.saturating_sub(1)).max(1) as f64;
    let y_max = series
        .iter()
        .flat_map(|s| s.values.iter().copied())
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max)
        .max(1e-6);

    let to_x = |epoch: usize| MARGIN_LEFT + (epoch as f64 / x_span) * plot_width;
    let to_y = |value: f64| MARGIN_TOP + plot_height - (value.clamp(0.0, y_max) / y_max) * plot_height;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}">"#,
        w = CHART_WIDTH,
        h = CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        CHART_WIDTH, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    ));

    for i in 0..=5 {
        let value = y_max * i as f64 / 5.0;
        let y = to_y(value);
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            y,
            MARGIN_LEFT + plot_width,
            y,
            COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.3}</text>"#,
            MARGIN_LEFT - 8.0,
            y + 4.0,
            COLOR_TEXT,
            value
        ));
    }

    svg.push_str(&format!(
        r#"<line x1="{l}" y1="{b}" x2="{r}" y2="{b}" stroke="{c}" stroke-width="2"/><line x1="{l}" y1="{t}" x2="{l}" y2="{b}" stroke="{c}" stroke-width="2"/>"#,
        l = MARGIN_LEFT,
        r = MARGIN_LEFT + plot_width,
        t = MARGIN_TOP,
        b = MARGIN_TOP + plot_height,
        c = COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Epoch</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        CHART_HEIGHT - 20.0,
        COLOR_TEXT
    ));

    for s in series.iter().filter(|s| !s.values.is_empty()) {
        let path: Vec<String> = s
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(epoch, v)| format!("{:.2},{:.2}", to_x(epoch), to_y(*v)))
            .collect();
        svg.push_str(&format!(
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
            path.join(" "),
            s.color
        ));
    }

    let mut legend_y = MARGIN_TOP + 10.0;
    for s in series {
        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="14" height="14" fill="{}"/><text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            CHART_WIDTH - MARGIN_RIGHT + 20.0,
            legend_y,
            s.color,
            CHART_WIDTH - MARGIN_RIGHT + 40.0,
            legend_y + 12.0,
            COLOR_TEXT,
            escape_xml(&s.name)
        ));
        legend_y += 22.0;
    }

    svg.push_str("</svg>");
    svg
}

/// Render and write a loss chart
pub fn write_loss_chart(title: &str, series: &[LossSeries], output_path: &Path) -> std::io::Result<()> {
    fs::write(output_path, render_loss_chart(title, series))
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_series() {
        let series = vec![
            LossSeries::new("Train/Loss_Total", vec![1.0, 0.8, 0.5], 0),
            LossSeries::new("Validation/Loss_Total", vec![1.1, 0.9, f64::NAN], 1),
        ];
        let svg = render_loss_chart("Losses", &series);

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert_eq!(svg.matches("<polyline").count(), 2);
        assert!(svg.contains("Validation/Loss_Total"));
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b & c>"), "a&lt;b &amp; c&gt;");
    }

    #[test]
    fn test_empty_series() {
        let svg = render_loss_chart("Empty", &[]);
        assert!(svg.contains("Empty"));
    }
}
