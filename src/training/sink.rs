//! Metrics/logging sinks
//!
//! The co-training loop reports through [`MetricsSink`]: scalars keyed by tag
//! and step, and pre-rendered multi-panel figures. [`MemorySink`] keeps
//! everything in memory; [`FileSink`] writes a timestamped run directory:
//!
//! ```text
//! <log_root>/<YYYY.MM.DD.HH.MM.SS>/
//!   scalars.csv        # tag,step,value
//!   figures/*.png      # one grid image per add_figure
//!   loss_curves.svg    # written on flush
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use image::GrayImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::utils::charts::{write_loss_chart, LossSeries};
use crate::utils::error::{CoTrainError, Result};
use crate::utils::min_max_normalize;

/// Gap in pixels between figure panels
const PANEL_GAP: usize = 2;

/// One single-channel image in a figure
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub title: String,
    pub width: usize,
    pub height: usize,
    /// Row-major intensities, normalized to [0, 1]
    pub pixels: Vec<f32>,
}

impl Panel {
    /// Build a panel, min-max normalizing the pixels
    pub fn new(title: impl Into<String>, width: usize, height: usize, mut pixels: Vec<f32>) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(CoTrainError::shape_mismatch("figure panel", &[height, width], &[pixels.len()]));
        }
        min_max_normalize(&mut pixels);
        Ok(Self {
            title: title.into(),
            width,
            height,
            pixels,
        })
    }
}

/// A row of panels rendered side by side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Figure {
    pub panels: Vec<Panel>,
}

impl Figure {
    pub fn new(panels: Vec<Panel>) -> Self {
        Self { panels }
    }

    pub fn titles(&self) -> Vec<&str> {
        self.panels.iter().map(|p| p.title.as_str()).collect()
    }

    /// Render as an 8-bit grayscale grid, panels left to right
    pub fn to_image(&self) -> GrayImage {
        let height = self.panels.iter().map(|p| p.height).max().unwrap_or(0);
        let width = self.panels.iter().map(|p| p.width).sum::<usize>()
            + PANEL_GAP * self.panels.len().saturating_sub(1);

        let mut img = GrayImage::new(width as u32, height as u32);
        let mut x0 = 0usize;
        for panel in &self.panels {
            for y in 0..panel.height {
                for x in 0..panel.width {
                    let v = panel.pixels[y * panel.width + x];
                    img.put_pixel((x0 + x) as u32, y as u32, image::Luma([(v * 255.0).round() as u8]));
                }
            }
            x0 += panel.width + PANEL_GAP;
        }
        img
    }
}

/// Destination for scalars and figures
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    fn add_figure(&mut self, tag: &str, figure: &Figure, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One logged scalar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    pub value: f64,
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub scalars: Vec<ScalarRecord>,
    pub figures: Vec<(String, usize, Figure)>,
    pub flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records for one tag, in logging order
    pub fn scalars_for(&self, tag: &str) -> Vec<&ScalarRecord> {
        self.scalars.iter().filter(|r| r.tag == tag).collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.push(ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
        });
        Ok(())
    }

    fn add_figure(&mut self, tag: &str, figure: &Figure, step: usize) -> Result<()> {
        self.figures.push((tag.to_string(), step, figure.clone()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Writes scalars, figures and charts under a timestamped run directory
pub struct FileSink {
    run_dir: PathBuf,
    writer: csv::Writer<File>,
    history: BTreeMap<String, Vec<(usize, f64)>>,
}

impl FileSink {
    /// Create `<log_root>/<timestamp>/` and open the scalar log
    pub fn create(log_root: &Path) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y.%m.%d.%H.%M.%S").to_string();
        Self::create_in(log_root.join(stamp))
    }

    /// Use `run_dir` as-is
    pub fn create_in(run_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(run_dir.join("figures"))?;
        let mut writer = csv::Writer::from_path(run_dir.join("scalars.csv"))?;
        writer.write_record(["tag", "step", "value"])?;
        info!("Logging run to {}", run_dir.display());

        Ok(Self {
            run_dir,
            writer,
            history: BTreeMap::new(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Serialize `value` as pretty JSON into the run directory
    pub fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        let path = self.run_dir.join(file_name);
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    fn figure_path(&self, tag: &str, step: usize) -> PathBuf {
        let safe: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.run_dir.join("figures").join(format!("{}_{:05}.png", safe, step))
    }
}

impl MetricsSink for FileSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.writer
            .write_record([tag, &step.to_string(), &value.to_string()])?;
        self.history.entry(tag.to_string()).or_default().push((step, value));
        Ok(())
    }

    fn add_figure(&mut self, tag: &str, figure: &Figure, step: usize) -> Result<()> {
        let path = self.figure_path(tag, step);
        figure
            .to_image()
            .save(&path)
            .map_err(|e| CoTrainError::Image(path.clone(), e.to_string()))?;
        debug!("Figure '{}' written to {}", tag, path.display());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;

        let series: Vec<LossSeries> = self
            .history
            .iter()
            .filter(|(tag, _)| tag.contains("/Loss_"))
            .enumerate()
            .map(|(i, (tag, points))| {
                let len = points.iter().map(|(step, _)| step + 1).max().unwrap_or(0);
                let mut values = vec![f64::NAN; len];
                for &(step, value) in points {
                    values[step] = value;
                }
                LossSeries::new(tag.clone(), values, i)
            })
            .collect();

        if !series.is_empty() {
            write_loss_chart("Co-training losses", &series, &self.run_dir.join("loss_curves.svg"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn figure() -> Figure {
        Figure::new(vec![
            Panel::new("a", 3, 2, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap(),
            Panel::new("b", 2, 2, vec![1.0; 4]).unwrap(),
        ])
    }

    #[test]
    fn test_panel_normalized() {
        let panel = Panel::new("p", 2, 1, vec![10.0, 20.0]).unwrap();
        assert_eq!(panel.pixels, vec![0.0, 1.0]);
        assert!(Panel::new("bad", 2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_figure_grid_dimensions() {
        let img = figure().to_image();
        assert_eq!(img.width(), 3 + PANEL_GAP as u32 + 2);
        assert_eq!(img.height(), 2);
        assert_eq!(img.get_pixel(2, 1).0[0], 255);
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.add_scalar("Train/Loss_Total", 0.5, 0).unwrap();
        sink.add_scalar("Train/Loss_Total", 0.4, 1).unwrap();
        sink.add_scalar("Validation/Loss_Total", 0.6, 0).unwrap();
        sink.add_figure("Images", &figure(), 0).unwrap();

        assert_eq!(sink.scalars_for("Train/Loss_Total").len(), 2);
        assert_eq!(sink.figures.len(), 1);
    }

    #[test]
    fn test_file_sink_writes_artifacts() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::create_in(dir.path().join("run")).unwrap();

        sink.add_scalar("Train/Loss_Total", 0.5, 0).unwrap();
        sink.add_scalar("Train/Loss_Total", 0.3, 1).unwrap();
        sink.add_scalar("Train/Dice", 0.7, 1).unwrap();
        sink.add_figure("Images/epoch 0", &figure(), 0).unwrap();
        sink.flush().unwrap();
        sink.write_json("summary.json", &vec![1, 2, 3]).unwrap();

        let run = dir.path().join("run");
        let csv = fs::read_to_string(run.join("scalars.csv")).unwrap();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.contains("Train/Dice,1,0.7"));
        assert!(run.join("figures").join("Images_epoch_0_00000.png").is_file());
        assert!(run.join("loss_curves.svg").is_file());
        assert!(run.join("summary.json").is_file());
    }
}
