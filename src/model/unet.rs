//! Slice-wise U-Net
//!
//! Volumes `[N, C, D, H, W]` are folded into `N·D` independent 2D slices, run
//! through a two-level U-Net, and unfolded again. The same network backs the
//! reference, registration and segmentation roles with different channel
//! counts.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Configuration for [`SliceUNet`]
#[derive(Config, Debug)]
pub struct SliceUNetConfig {
    #[config(default = "1")]
    pub in_channels: usize,

    #[config(default = "1")]
    pub out_channels: usize,

    /// Filters in the first level; doubled at the bottleneck
    #[config(default = "16")]
    pub base_filters: usize,
}

impl SliceUNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SliceUNet<B> {
        let f = self.base_filters;
        SliceUNet {
            encoder: DoubleConv::new(self.in_channels, f, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck: DoubleConv::new(f, 2 * f, device),
            up: ConvTranspose2dConfig::new([2 * f, f], [2, 2])
                .with_stride([2, 2])
                .init(device),
            decoder: DoubleConv::new(2 * f, f, device),
            head: Conv2dConfig::new([f, self.out_channels], [1, 1]).init(device),
        }
    }
}

/// Two 3x3 conv + batch-norm + ReLU stages
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    relu: Relu,
}

impl<B: Backend> DoubleConv<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |i, o| {
            Conv2dConfig::new([i, o], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        Self {
            conv1: conv(in_channels, out_channels),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv(out_channels, out_channels),
            bn2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        self.relu.forward(self.bn2.forward(self.conv2.forward(x)))
    }
}

/// Two-level U-Net applied slice by slice
#[derive(Module, Debug)]
pub struct SliceUNet<B: Backend> {
    encoder: DoubleConv<B>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    up: ConvTranspose2d<B>,
    decoder: DoubleConv<B>,
    head: Conv2d<B>,
}

impl<B: Backend> SliceUNet<B> {
    /// `[N, C_in, D, H, W]` to `[N, C_out, D, H, W]`; `H` and `W` must be even
    pub fn forward(&self, volume: Tensor<B, 5>) -> Tensor<B, 5> {
        let [n, c, d, h, w] = volume.dims();
        let slices = volume.swap_dims(1, 2).reshape([n * d, c, h, w]);

        let skip = self.encoder.forward(slices);
        let x = self.bottleneck.forward(self.pool.forward(skip.clone()));
        let x = self.up.forward(x);
        let x = self.decoder.forward(Tensor::cat(vec![x, skip], 1));
        let x = self.head.forward(x);

        let out_channels = x.dims()[1];
        x.reshape([n, d, out_channels, h, w]).swap_dims(1, 2)
    }
}
