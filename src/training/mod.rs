//! Training module for warp-supervised co-training
//!
//! This module provides:
//! - Pseudo-label synthesis through a predicted warp field (`warp`)
//! - Soft Dice and registration losses (`loss`)
//! - The constructor-injected gradient scaler (`scaler`)
//! - Per-model best/latest checkpoint tracking (`checkpoint`)
//! - Epoch metrics and logging sinks (`metrics`, `sink`)
//! - The co-training loop itself (`cotrain`)
//!
//! ## Co-Training Approach
//!
//! 1. The registration model aligns the auxiliary image (CT) to the primary one (MRI)
//! 2. The same field carries the primary label onto the auxiliary grid as a pseudo-label
//! 3. The segmentation model learns the auxiliary modality from that pseudo-label
//! 4. Both models are optimized jointly on `dice + registration` loss

pub mod checkpoint;
pub mod cotrain;
pub mod loss;
pub mod metrics;
pub mod scaler;
pub mod sink;
pub mod warp;

pub use checkpoint::{CheckpointMeta, CheckpointTracker};
pub use cotrain::{BestRecord, CoTrainer, EpochRecord, LoopState, RunSummary};
pub use loss::{dice_loss, registration_loss, DiceOutput, RegistrationLoss};
pub use metrics::{BatchStats, EpochMetrics, Phase, PhaseMeans};
pub use scaler::{GradScaler, ScalerConfig};
pub use sink::{FileSink, Figure, MemorySink, MetricsSink, Panel};
pub use warp::{synthesize, WarpField, WarpMode};
