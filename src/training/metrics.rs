//! Per-phase running sums of loss terms and Dice, reduced to epoch means

use serde::{Deserialize, Serialize};

/// Training or validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Validate,
}

impl Phase {
    /// Prefix for scalar tags
    pub fn tag_prefix(&self) -> &'static str {
        match self {
            Phase::Train => "Train",
            Phase::Validate => "Validation",
        }
    }

    /// Gradients are recorded only while training
    pub fn track_gradients(&self) -> bool {
        matches!(self, Phase::Train)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Validate => write!(f, "validate"),
        }
    }
}

/// Host-side values of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub seg_loss: f64,
    pub reg_loss: f64,
    pub total_loss: f64,
    pub dice: f64,
}

/// Epoch means of one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMeans {
    pub seg_loss: f64,
    pub reg_loss: f64,
    pub total_loss: f64,
    pub dice: f64,
    pub batches: usize,
}

impl PhaseMeans {
    /// `(tag suffix, value)` pairs logged once per phase per epoch
    pub fn scalars(&self) -> [(&'static str, f64); 4] {
        [
            ("Loss_Seg", self.seg_loss),
            ("Loss_Reg", self.reg_loss),
            ("Loss_Total", self.total_loss),
            ("Dice", self.dice),
        ]
    }
}

/// Running sums, reset at the start of every phase
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    sums: BatchStats,
    batches: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stats: BatchStats) {
        self.sums.seg_loss += stats.seg_loss;
        self.sums.reg_loss += stats.reg_loss;
        self.sums.total_loss += stats.total_loss;
        self.sums.dice += stats.dice;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Divide the sums by the batch count; all zeros for an empty phase
    pub fn means(&self) -> PhaseMeans {
        if self.batches == 0 {
            return PhaseMeans::default();
        }
        let n = self.batches as f64;
        PhaseMeans {
            seg_loss: self.sums.seg_loss / n,
            reg_loss: self.sums.reg_loss / n,
            total_loss: self.sums.total_loss / n,
            dice: self.sums.dice / n,
            batches: self.batches,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
