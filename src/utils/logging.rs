//! Logging Module
//!
//! Structured logging through `tracing`, plus the epoch-level and batch-level
//! progress reporting used by the co-training loop.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::utils::error::{CoTrainError, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose config for debugging (per-batch losses become visible)
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(config.ansi_colors)
                .with_target(config.include_target)
                .compact(),
        )
        .with(filter)
        .try_init()
        .map_err(|e| CoTrainError::Config(format!("Failed to initialize logger: {e}")))
}

/// Batch progress bar for one phase of one epoch.
///
/// Hidden when `visible` is false so tests and piped runs stay quiet.
pub fn phase_progress_bar(phase: &str, epoch: usize, total_batches: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total_batches as u64);
    let template = format!(
        "[{{elapsed_precise}}] {:>8} {:>4} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {{msg}}",
        phase, epoch
    );
    let style = ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb
}

/// Epoch-level progress logger
pub struct TrainingLogger {
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::info!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Log the mean losses of one phase
    pub fn log_phase(&self, phase: &str, seg_loss: f64, reg_loss: f64, dice: f64) {
        tracing::info!(
            "Epoch {}/{} {:>10} | Seg: {:.4} | Reg: {:.4} | Dice: {:.2}%",
            self.epoch + 1,
            self.total_epochs,
            phase,
            seg_loss,
            reg_loss,
            dice * 100.0
        );
    }

    /// Log end of an epoch
    pub fn end_epoch(&self, train_loss: f64, val_loss: f64, loss_scale: f64) {
        let epoch_time = self.epoch_start.elapsed();
        let total_time = self.training_start.elapsed();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time.as_secs_f64() / (self.epoch + 1) as f64;
        let eta_secs = epochs_remaining as f64 * avg_epoch_time;

        tracing::info!(
            "Epoch {}/{} completed in {:.1}s | Train: {:.4} | Val: {:.4} | Scale: {} | ETA: {:.0}s",
            self.epoch + 1,
            self.total_epochs,
            epoch_time.as_secs_f64(),
            train_loss,
            val_loss,
            loss_scale,
            eta_secs
        );
    }

    /// Log a new best snapshot for one sub-model
    pub fn log_new_best(&self, model: &str, loss: f64) {
        tracing::info!("New best {} weights at epoch {} (val loss {:.4})", model, self.epoch, loss);
    }

    /// Seconds since the logger was created
    pub fn elapsed_secs(&self) -> f64 {
        self.training_start.elapsed().as_secs_f64()
    }

    /// Log training completion
    pub fn log_complete(&self, optimizer_steps: usize, skipped_steps: usize) {
        tracing::info!(
            "Training complete! {} epochs in {:.1}s | {} optimizer steps ({} skipped on overflow)",
            self.total_epochs,
            self.elapsed_secs(),
            optimizer_steps,
            skipped_steps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level.as_directive(), "debug");
    }

    #[test]
    fn test_hidden_progress_bar() {
        let pb = phase_progress_bar("train", 0, 10, false);
        pb.inc(3);
        assert!(pb.is_hidden());
    }

    #[test]
    fn test_training_logger_eta_on_last_epoch() {
        let mut logger = TrainingLogger::new(2);
        logger.start_epoch(1);
        logger.end_epoch(0.5, 0.4, 65536.0);
        assert!(logger.elapsed_secs() >= 0.0);
    }
}
