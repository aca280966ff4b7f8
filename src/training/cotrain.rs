//! Co-Training Loop
//!
//! Drives the registration and segmentation models through
//! `Epoch{0..epochs} × Phase{Train, Validate}`:
//!
//! 1. batch the phase's samples on the registration device
//! 2. predict the warp field, refine it, synthesize the warped image and pseudo-label
//! 3. run the frozen reference model on the warped image (inner backend, no gradients)
//! 4. hand the segmentation input and pseudo-label to the segmentation device
//! 5. composite loss: `dice(seg, pseudo) [+ registration]`
//! 6. train only: scale, backpropagate, unscale and step, update the scaler once
//!
//! After validation each trainable model's tracker observes its own loss
//! (registration loss for the registration model, Dice loss for the
//! segmentation model). Latest weights are saved on the checkpoint cadence
//! and once more when the run ends. Shape and device errors abort the run.

use burn::{
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    tensor::{activation, backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{RunConfig, SegmentationInput};
use crate::dataset::{DatasetSplit, SampleSource, VolumeBatch, VolumeBatcher, VolumeItem};
use crate::dataset::volume::Volume;
use crate::model::registration::{RegistrationNet, WarpOptions};
use crate::model::registry::{
    check_placement, hand_off, verify_module_placement, CoTrainModels, DeviceMap, REFERENCE, SEGMENTATION,
};
use crate::model::unet::SliceUNet;
use crate::training::checkpoint::CheckpointTracker;
use crate::training::loss::dice_loss;
use crate::training::metrics::{BatchStats, EpochMetrics, Phase, PhaseMeans};
use crate::training::scaler::GradScaler;
use crate::training::sink::{Figure, MetricsSink, Panel};
use crate::utils::error::{CoTrainError, Result};
use crate::utils::logging::{phase_progress_bar, TrainingLogger};

/// Position in the epoch/phase state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub epoch: usize,
    pub phase: Phase,
}

impl LoopState {
    pub fn initial() -> Self {
        Self {
            epoch: 0,
            phase: Phase::Train,
        }
    }

    /// Train → Validate → next epoch's Train; `None` after the last Validate
    pub fn next(self, epochs: usize) -> Option<Self> {
        match self.phase {
            Phase::Train => Some(Self {
                phase: Phase::Validate,
                ..self
            }),
            Phase::Validate if self.epoch + 1 < epochs => Some(Self {
                epoch: self.epoch + 1,
                phase: Phase::Train,
            }),
            Phase::Validate => None,
        }
    }
}

/// Both phases of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: PhaseMeans,
    pub validation: PhaseMeans,
    pub loss_scale: f64,
}

/// Best validation result of one trainable model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestRecord {
    pub model: String,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
}

impl BestRecord {
    fn from_tracker<B: Backend, M: Module<B>>(tracker: &CheckpointTracker<B, M>) -> Self {
        Self {
            model: tracker.name().to_string(),
            best_epoch: tracker.best_epoch(),
            best_val_loss: tracker.best_epoch().map(|_| tracker.best_val_loss()),
        }
    }
}

/// Outcome of [`CoTrainer::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub history: Vec<EpochRecord>,
    pub registration: BestRecord,
    pub segmentation: BestRecord,
    pub optimizer_steps: usize,
    pub skipped_steps: usize,
    pub final_loss_scale: f64,
    pub elapsed_secs: f64,
}

/// Per-batch result of the forward protocol
struct BatchOutput<BB: Backend> {
    total: Tensor<BB, 1>,
    stats: BatchStats,
    figure: Option<Figure>,
}

/// Orchestrates the reference, registration and segmentation models
pub struct CoTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<CoTrainModels<B>, B>,
{
    config: RunConfig,
    models: CoTrainModels<B>,
    reference: SliceUNet<B::InnerBackend>,
    optimizer: O,
    scaler: GradScaler,
    devices: DeviceMap<B::Device>,
    source: Box<dyn SampleSource>,
    split: DatasetSplit,
    registration_ckpt: CheckpointTracker<B, RegistrationNet<B>>,
    segmentation_ckpt: CheckpointTracker<B, SliceUNet<B>>,
    state: LoopState,
    optimizer_steps: usize,
    skipped_steps: usize,
}

impl<B, O> CoTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<CoTrainModels<B>, B>,
{
    /// Wire the models, optimizer, scaler and data together.
    ///
    /// Validates the config, splits the samples and checks that every model
    /// sits on its device slot.
    pub fn new(
        config: RunConfig,
        models: CoTrainModels<B>,
        reference: SliceUNet<B::InnerBackend>,
        optimizer: O,
        scaler: GradScaler,
        devices: DeviceMap<B::Device>,
        source: Box<dyn SampleSource>,
    ) -> Result<Self> {
        config.validate()?;
        if source.is_empty() {
            return Err(CoTrainError::Dataset("sample source is empty".to_string()));
        }

        models.verify_placement(&devices)?;
        verify_module_placement(&reference, &devices.reference, REFERENCE)?;

        let split = DatasetSplit::new(source.len(), config.split_ratio, config.seed)?;
        info!(
            "Split {} samples: train {:?}, validation {:?}",
            source.len(),
            split.train,
            split.validation
        );

        let ckpt = &config.checkpoints;
        let registration_ckpt =
            CheckpointTracker::new(&ckpt.names.registration, &ckpt.directory, ckpt.save_interval);
        let segmentation_ckpt =
            CheckpointTracker::new(&ckpt.names.segmentation, &ckpt.directory, ckpt.save_interval);

        Ok(Self {
            config,
            models,
            reference,
            optimizer,
            scaler,
            devices,
            source,
            split,
            registration_ckpt,
            segmentation_ckpt,
            state: LoopState::initial(),
            optimizer_steps: 0,
            skipped_steps: 0,
        })
    }

    pub fn models(&self) -> &CoTrainModels<B> {
        &self.models
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn split(&self) -> &DatasetSplit {
        &self.split
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn registration_checkpoint(&self) -> &CheckpointTracker<B, RegistrationNet<B>> {
        &self.registration_ckpt
    }

    pub fn segmentation_checkpoint(&self) -> &CheckpointTracker<B, SliceUNet<B>> {
        &self.segmentation_ckpt
    }

    /// Run every epoch, then save the latest weights unconditionally
    pub fn run(&mut self, sink: &mut dyn MetricsSink) -> Result<RunSummary> {
        let epochs = self.config.epochs;
        let mut logger = TrainingLogger::new(epochs);
        let mut history = Vec::with_capacity(epochs);
        let mut train_means = PhaseMeans::default();

        let mut state = Some(LoopState::initial());
        while let Some(current) = state {
            self.state = current;
            let epoch = current.epoch;

            match current.phase {
                Phase::Train => {
                    logger.start_epoch(epoch);
                    train_means = self.run_phase(Phase::Train, epoch, sink)?;
                    logger.log_phase("Train", train_means.seg_loss, train_means.reg_loss, train_means.dice);
                }
                Phase::Validate => {
                    let val_means = self.validate(epoch, sink)?;
                    logger.log_phase("Validation", val_means.seg_loss, val_means.reg_loss, val_means.dice);

                    self.log_epoch_scalars(sink, epoch, &train_means, &val_means)?;
                    self.update_checkpoints(&logger, epoch, &val_means)?;
                    logger.end_epoch(train_means.total_loss, val_means.total_loss, self.scaler.scale());

                    history.push(EpochRecord {
                        epoch,
                        train: train_means,
                        validation: val_means,
                        loss_scale: self.scaler.scale(),
                    });
                }
            }

            state = current.next(epochs);
        }

        let last_epoch = epochs.saturating_sub(1);
        self.registration_ckpt.save_latest(last_epoch, &self.models.registration)?;
        self.segmentation_ckpt.save_latest(last_epoch, &self.models.segmentation)?;
        sink.flush()?;

        logger.log_complete(self.optimizer_steps, self.skipped_steps);

        Ok(RunSummary {
            history,
            registration: BestRecord::from_tracker(&self.registration_ckpt),
            segmentation: BestRecord::from_tracker(&self.segmentation_ckpt),
            optimizer_steps: self.optimizer_steps,
            skipped_steps: self.skipped_steps,
            final_loss_scale: self.scaler.scale(),
            elapsed_secs: logger.elapsed_secs(),
        })
    }

    /// One pass over the validation samples; the weights are left untouched
    pub fn validate(&mut self, epoch: usize, sink: &mut dyn MetricsSink) -> Result<PhaseMeans> {
        self.run_phase(Phase::Validate, epoch, sink)
    }

    /// One pass over the phase's samples
    fn run_phase(&mut self, phase: Phase, epoch: usize, sink: &mut dyn MetricsSink) -> Result<PhaseMeans> {
        let order = match phase {
            Phase::Train => self.split.train_order(epoch),
            Phase::Validate => self.split.validation_order(),
        };
        let batches: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let bar = phase_progress_bar(
            phase.tag_prefix(),
            epoch,
            batches.len(),
            self.config.show_progress,
        );
        let mut metrics = EpochMetrics::new();

        // Validation runs on the inner backend so no graph is recorded.
        let valid_models = match phase {
            Phase::Train => None,
            Phase::Validate => Some(self.models.valid()),
        };

        for (batch_idx, indices) in batches.into_iter().enumerate() {
            let items = self.fetch(&indices)?;

            let stats = match &valid_models {
                None => {
                    let want_figure =
                        batch_idx == 0 && epoch % self.config.training.figure_interval == 0;
                    self.train_step(items, epoch, want_figure, sink)?
                }
                Some(models) => {
                    self.forward_batch(models, items, phase.track_gradients(), false)?
                        .stats
                }
            };

            debug!(
                "{} epoch {} batch {}: seg {:.4}, reg {:.4}, dice {:.4}",
                phase, epoch, batch_idx, stats.seg_loss, stats.reg_loss, stats.dice
            );
            metrics.add(stats);
            bar.inc(1);
        }

        bar.finish_and_clear();
        Ok(metrics.means())
    }

    fn fetch(&self, indices: &[usize]) -> Result<Vec<VolumeItem>> {
        indices.iter().map(|&index| self.source.sample(index)).collect()
    }

    /// Forward, backward, and one scaled optimizer step
    fn train_step(
        &mut self,
        items: Vec<VolumeItem>,
        epoch: usize,
        want_figure: bool,
        sink: &mut dyn MetricsSink,
    ) -> Result<BatchStats> {
        let output = self.forward_batch(&self.models, items, Phase::Train.track_gradients(), want_figure)?;

        let grads = self.scaler.scale_loss(output.total).backward();
        let grads = GradientsParams::from_grads(grads, &self.models);
        let (models, stepped) = self.scaler.step::<B, _, _>(
            &mut self.optimizer,
            self.config.training.learning_rate,
            self.models.clone(),
            grads,
        );
        self.models = models;
        self.scaler.update(stepped);

        if stepped {
            self.optimizer_steps += 1;
        } else {
            self.skipped_steps += 1;
        }

        if let Some(figure) = output.figure {
            sink.add_figure(&format!("Images/epoch_{}", epoch), &figure, epoch)?;
        }

        Ok(output.stats)
    }

    /// The per-batch protocol shared by both phases
    fn forward_batch<BB>(
        &self,
        models: &CoTrainModels<BB>,
        items: Vec<VolumeItem>,
        track_gradients: bool,
        want_figure: bool,
    ) -> Result<BatchOutput<BB>>
    where
        BB: Backend<Device = B::Device>,
    {
        let training = &self.config.training;
        let batch = VolumeBatcher::<BB>::new(self.devices.registration.clone()).try_batch(items)?;
        check_sample_grid(&batch, self.config.output_shape)?;

        let warp = models.registration.warp_and_loss(
            batch.auxiliary.clone(),
            batch.primary.clone(),
            batch.label.clone(),
            WarpOptions {
                refinement_passes: training.refinement_passes,
                requires_grad: track_gradients,
                smoothness_weight: training.smoothness_weight,
            },
        )?;

        // The reference model never records gradients, whatever the phase.
        let reference_input = Tensor::<B::InnerBackend, 5>::from_data(
            warp.warped.clone().into_data(),
            &self.devices.reference,
        );
        check_placement(REFERENCE, &self.devices.reference, &reference_input.device())?;
        let reconstructed = self.reference.forward(reference_input);

        let seg_input = match training.segmentation_input {
            SegmentationInput::Auxiliary => batch.auxiliary.clone(),
            SegmentationInput::Warped => warp.warped.clone(),
        };
        let seg_input = hand_off(seg_input, &self.devices.segmentation, SEGMENTATION)?;
        let pseudo_label = hand_off(warp.pseudo_label.clone(), &self.devices.segmentation, SEGMENTATION)?;

        let prediction = activation::sigmoid(models.segmentation.forward(seg_input));
        let dice = dice_loss(prediction.clone(), pseudo_label, training.dice_smooth)?;

        let reg_loss = hand_off(warp.loss.total.clone(), &self.devices.segmentation, SEGMENTATION)?;
        let total = if training.joint_registration_loss {
            dice.loss.clone() + reg_loss.clone()
        } else {
            dice.loss.clone()
        };

        let stats = BatchStats {
            seg_loss: host_scalar(dice.loss),
            reg_loss: host_scalar(reg_loss),
            total_loss: host_scalar(total.clone()),
            dice: host_scalar(dice.dice),
        };

        let figure = if want_figure {
            Some(build_figure(&[
                ("primary", host_volume(batch.primary)?),
                ("auxiliary", host_volume(batch.auxiliary)?),
                ("warped", host_volume(warp.warped)?),
                ("reference", host_volume(reconstructed)?),
                ("label", host_volume(batch.label)?),
                ("pseudo_label", host_volume(warp.pseudo_label)?),
                ("prediction", host_volume(prediction)?),
            ])?)
        } else {
            None
        };

        Ok(BatchOutput { total, stats, figure })
    }

    fn log_epoch_scalars(
        &self,
        sink: &mut dyn MetricsSink,
        epoch: usize,
        train: &PhaseMeans,
        validation: &PhaseMeans,
    ) -> Result<()> {
        for (phase, means) in [(Phase::Train, train), (Phase::Validate, validation)] {
            for (name, value) in means.scalars() {
                sink.add_scalar(&format!("{}/{}", phase.tag_prefix(), name), value, epoch)?;
            }
        }
        sink.add_scalar("Train/LossScale", self.scaler.scale(), epoch)
    }

    fn update_checkpoints(&mut self, logger: &TrainingLogger, epoch: usize, validation: &PhaseMeans) -> Result<()> {
        if self
            .registration_ckpt
            .observe(epoch, validation.reg_loss, &self.models.registration)?
        {
            logger.log_new_best(self.registration_ckpt.name(), validation.reg_loss);
        }
        if self
            .segmentation_ckpt
            .observe(epoch, validation.seg_loss, &self.models.segmentation)?
        {
            logger.log_new_best(self.segmentation_ckpt.name(), validation.seg_loss);
        }

        self.registration_ckpt.periodic_save(epoch, &self.models.registration)?;
        self.segmentation_ckpt.periodic_save(epoch, &self.models.segmentation)?;
        Ok(())
    }
}

/// Primary image and label must lie on `output_shape`; the auxiliary image is
/// checked against the primary one when the warp is applied.
fn check_sample_grid<BB: Backend>(batch: &VolumeBatch<BB>, grid: [usize; 3]) -> Result<()> {
    for (name, tensor) in [("primary", &batch.primary), ("label", &batch.label)] {
        let [_, _, d, h, w] = tensor.dims();
        if [d, h, w] != grid {
            return Err(CoTrainError::shape_mismatch(
                format!("{} volume of batch {:?} against output_shape", name, batch.ids),
                &grid,
                &[d, h, w],
            ));
        }
    }
    Ok(())
}

fn host_scalar<BB: Backend>(tensor: Tensor<BB, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// First sample, first channel, copied to the host
fn host_volume<BB: Backend>(tensor: Tensor<BB, 5>) -> Result<Volume> {
    let [_, _, d, h, w] = tensor.dims();
    let data = tensor
        .narrow(0, 0, 1)
        .narrow(1, 0, 1)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| CoTrainError::Dataset(format!("failed to read tensor data: {:?}", e)))?;
    Volume::new(data, [d, h, w])
}

/// One panel per volume at the first slice where the label has foreground
fn build_figure(volumes: &[(&str, Volume)]) -> Result<Figure> {
    let slice = volumes
        .iter()
        .find(|(name, _)| *name == "label")
        .and_then(|(_, label)| label.first_foreground_slice())
        .unwrap_or(0);

    let panels = volumes
        .iter()
        .map(|(name, volume)| {
            let [_, h, w] = volume.shape;
            Panel::new(*name, w, h, volume.slice(slice).to_vec())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Figure::new(panels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::synthetic_dataset;
    use crate::model::registry::load_reference;
    use crate::training::checkpoint::CheckpointMeta;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use std::path::Path;
    use tempfile::tempdir;

    type AD = Autodiff<NdArray>;

    fn trainer(dir: &Path) -> CoTrainer<AD, impl Optimizer<CoTrainModels<AD>, AD>> {
        let mut config = RunConfig::default();
        config.output_shape = [2, 4, 4];
        config.source_depth = 2;
        config.split_ratio = 0.5;
        config.model.base_filters = 2;
        config.show_progress = false;
        config.checkpoints.directory = dir.to_path_buf();
        config.checkpoints.save_interval = 10;

        let devices = DeviceMap::uniform(Default::default());
        let models = CoTrainModels::<AD>::init(&config, &devices);
        let reference = load_reference::<NdArray>(&config, None, &devices.reference).unwrap();
        let optimizer = AdamConfig::new().init::<AD, CoTrainModels<AD>>();
        let source = Box::new(synthetic_dataset(2, [2, 4, 4], 1));

        CoTrainer::new(config, models, reference, optimizer, GradScaler::default(), devices, source).unwrap()
    }

    #[test]
    fn test_state_machine_order() {
        let mut visited = vec![];
        let mut state = Some(LoopState::initial());
        while let Some(s) = state {
            visited.push((s.epoch, s.phase));
            state = s.next(2);
        }
        assert_eq!(
            visited,
            vec![
                (0, Phase::Train),
                (0, Phase::Validate),
                (1, Phase::Train),
                (1, Phase::Validate),
            ]
        );
    }

    #[test]
    fn test_build_figure_picks_foreground_slice() {
        let mut label = Volume::zeros([3, 2, 2]);
        label.data[2 * 4] = 1.0;
        let primary = Volume::new((0..12).map(|v| v as f32).collect(), [3, 2, 2]).unwrap();

        let figure = build_figure(&[("primary", primary), ("label", label)]).unwrap();
        assert_eq!(figure.titles(), vec!["primary", "label"]);
        // Slice 2 of the primary holds 8..12, normalized to [0, 1].
        assert_eq!(figure.panels[0].pixels[0], 0.0);
        assert_eq!(figure.panels[0].pixels[3], 1.0);
        assert_eq!(figure.panels[1].pixels[0], 1.0);
    }

    #[test]
    fn test_trackers_keep_independent_bests() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path());
        let logger = TrainingLogger::new(3);

        // (registration, segmentation) validation losses per epoch
        for (epoch, (reg_loss, seg_loss)) in [(0.5, 0.9), (0.6, 0.4), (0.3, 0.7)].into_iter().enumerate() {
            let validation = PhaseMeans {
                reg_loss,
                seg_loss,
                ..Default::default()
            };
            trainer.update_checkpoints(&logger, epoch, &validation).unwrap();
        }

        let registration = trainer.registration_checkpoint();
        let segmentation = trainer.segmentation_checkpoint();
        assert_eq!(registration.best_epoch(), Some(2));
        assert_eq!(registration.best_val_loss(), 0.3);
        assert_eq!(registration.best_saves(), 2);
        assert_eq!(segmentation.best_epoch(), Some(1));
        assert_eq!(segmentation.best_val_loss(), 0.4);
        assert_eq!(segmentation.best_saves(), 2);

        assert_eq!(CheckpointMeta::load(&dir.path().join("M1_bw.json")).unwrap().epoch, 2);
        assert_eq!(CheckpointMeta::load(&dir.path().join("M2_bw.json")).unwrap().epoch, 1);
    }
}
