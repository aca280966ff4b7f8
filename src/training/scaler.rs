//! Gradient scaler for mixed-precision training.
//!
//! The scaler is an explicit object owned by the trainer. Per optimizer step the
//! caller runs `scale_loss` before `backward`, `step` to unscale and apply the
//! gradients, and `update` exactly once with the step outcome.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::error::{CoTrainError, Result};

/// Default number of successful steps before the loss scale is increased
const DEFAULT_SCALE_GROWTH_INTERVAL: usize = 2000;

/// Scaler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalerConfig {
    /// When false the scaler is a pass-through with a fixed scale of 1
    pub enabled: bool,
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    /// Adapt the scale; a static scaler still skips overflowing steps
    pub dynamic: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: DEFAULT_SCALE_GROWTH_INTERVAL,
            dynamic: true,
        }
    }
}

impl ScalerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_scale.is_finite() && self.initial_scale >= 1.0) {
            return Err(CoTrainError::Config(format!(
                "scaler.initial_scale must be a finite value >= 1, got {}",
                self.initial_scale
            )));
        }
        if self.growth_factor <= 1.0 {
            return Err(CoTrainError::Config("scaler.growth_factor must be > 1".to_string()));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(CoTrainError::Config("scaler.backoff_factor must lie in (0, 1)".to_string()));
        }
        if self.growth_interval == 0 {
            return Err(CoTrainError::Config("scaler.growth_interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Gradient scaler
///
/// Handles loss scaling to prevent gradient underflow and recovers from
/// overflow by skipping the optimizer step and backing off the scale.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    config: ScalerConfig,
    steps_since_growth: usize,
    overflow_count: usize,
    successful_steps: usize,
}

impl GradScaler {
    pub fn new(config: ScalerConfig) -> Self {
        let scale = if config.enabled { config.initial_scale } else { 1.0 };
        Self {
            scale,
            config,
            steps_since_growth: 0,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    /// Current loss scale
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Multiply the loss by the current scale
    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.config.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide every gradient of `module` by the scale.
    ///
    /// Returns the unscaled gradients and whether all of them are finite.
    pub fn unscale<B, M>(&self, module: &M, mut grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.config.enabled {
            return (grads, true);
        }

        let mut visitor = UnscaleVisitor::<B> {
            grads: &mut grads,
            inv_scale: 1.0 / self.scale,
            finite: true,
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
        let finite = visitor.finite;
        (grads, finite)
    }

    /// Unscale and apply gradients unless they overflowed.
    ///
    /// Returns the (possibly unchanged) module and whether the step was applied.
    /// Does not touch the scale; call [`GradScaler::update`] afterwards.
    pub fn step<B, M, O>(&self, optimizer: &mut O, lr: f64, module: M, grads: GradientsParams) -> (M, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let (grads, finite) = self.unscale::<B, M>(&module, grads);
        if finite {
            (optimizer.step(lr, module, grads), true)
        } else {
            warn!("Non-finite gradients at loss scale {}; skipping optimizer step", self.scale);
            (module, false)
        }
    }

    /// Adapt the scale after one optimizer step
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.successful_steps += 1;
        } else {
            self.overflow_count += 1;
        }

        if !(self.config.enabled && self.config.dynamic) {
            return;
        }

        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.steps_since_growth = 0;
                debug!("Loss scale grown to {}", self.scale);
            }
        } else {
            self.scale = (self.scale * self.config.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
            debug!("Loss scale backed off to {}", self.scale);
        }
    }

    /// Steps skipped because of overflow
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    pub fn successful_steps(&self) -> usize {
        self.successful_steps
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(ScalerConfig::default())
    }
}

struct UnscaleVisitor<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f64,
    finite: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for UnscaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let id = param.id;
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            let grad = grad.mul_scalar(self.inv_scale);
            let total: f64 = grad.clone().sum().into_scalar().elem();
            if !total.is_finite() {
                self.finite = false;
            }
            self.grads.register::<B::InnerBackend, D>(id, grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::SgdConfig;

    type AD = Autodiff<NdArray>;

    fn config(interval: usize) -> ScalerConfig {
        ScalerConfig {
            growth_interval: interval,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_and_floor() {
        let mut scaler = GradScaler::new(ScalerConfig {
            initial_scale: 4.0,
            ..Default::default()
        });
        scaler.update(false);
        assert_eq!(scaler.scale(), 2.0);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 1.0);
        assert_eq!(scaler.overflow_count(), 3);
    }

    #[test]
    fn test_growth_after_interval() {
        let mut scaler = GradScaler::new(config(3));
        scaler.update(true);
        scaler.update(true);
        assert_eq!(scaler.scale(), 65536.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 131072.0);
        assert_eq!(scaler.successful_steps(), 3);
    }

    #[test]
    fn test_overflow_resets_growth_counter() {
        let mut scaler = GradScaler::new(config(2));
        scaler.update(true);
        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.scale(), 32768.0);
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let mut scaler = GradScaler::new(ScalerConfig::disabled());
        assert_eq!(scaler.scale(), 1.0);
        let loss = Tensor::<NdArray, 1>::from_floats([3.0], &Default::default());
        let scaled: f32 = scaler.scale_loss(loss).into_scalar();
        assert_eq!(scaled, 3.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_unscale_recovers_true_gradients() {
        let device = Default::default();
        let model: Linear<AD> = LinearConfig::new(3, 2).init(&device);
        let x = Tensor::<AD, 2>::from_floats([[1.0, 2.0, 3.0]], &device);

        let plain = model.forward(x.clone()).sum().backward();
        let plain = GradientsParams::from_grads(plain, &model);

        let scaler = GradScaler::new(ScalerConfig {
            initial_scale: 1024.0,
            ..Default::default()
        });
        let scaled = scaler.scale_loss(model.forward(x).sum()).backward();
        let scaled = GradientsParams::from_grads(scaled, &model);
        let (unscaled, finite) = scaler.unscale::<AD, _>(&model, scaled);
        assert!(finite);

        let id = model.weight.id;
        let expected = plain.get::<NdArray, 2>(id).unwrap().into_data().to_vec::<f32>().unwrap();
        let actual = unscaled.get::<NdArray, 2>(id).unwrap().into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_overflow_skips_step() {
        let device = Default::default();
        let model: Linear<AD> = LinearConfig::new(2, 1).init(&device);
        let before = model.weight.val().into_data();

        let x = Tensor::<AD, 2>::from_floats([[1e30, 1e30]], &device);
        let mut scaler = GradScaler::new(ScalerConfig {
            initial_scale: 1e30,
            ..Default::default()
        });
        let grads = scaler.scale_loss(model.forward(x).sum()).backward();
        let grads = GradientsParams::from_grads(grads, &model);

        let mut optimizer = SgdConfig::new().init::<AD, Linear<AD>>();
        let (model, stepped) = scaler.step::<AD, _, _>(&mut optimizer, 0.1, model, grads);
        scaler.update(stepped);

        assert!(!stepped);
        assert_eq!(model.weight.val().into_data(), before);
        assert_eq!(scaler.scale(), 5e29);
    }
}
