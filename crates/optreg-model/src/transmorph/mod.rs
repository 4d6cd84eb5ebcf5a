//! TransMorph: Swin transformer encoder with a convolutional decoder.

pub mod swin;

use burn::{
    nn::conv::{Conv3d, Conv3dConfig, ConvTranspose3d},
    prelude::*,
};
use optreg_core::{ImagePair, SpatialTransformer, VolumeShape};
use swin::{SwinTransformerBlock, SwinTransformerBlockConfig};

use crate::blocks::{flow_head, upsample, ConvBlock, ConvBlockConfig};
use crate::network::{RegistrationNetwork, RegistrationOutput};

#[derive(Module, Debug)]
pub struct TransMorph<B: Backend> {
    patch_embed: Conv3d<B>,
    stage1: Vec<SwinTransformerBlock<B>>,
    down1: Conv3d<B>,
    stage2: Vec<SwinTransformerBlock<B>>,
    down2: Conv3d<B>,
    stage3: Vec<SwinTransformerBlock<B>>,
    down3: Conv3d<B>,
    stage4: Vec<SwinTransformerBlock<B>>,

    up3: ConvTranspose3d<B>,
    conv3: ConvBlock<B>,
    up2: ConvTranspose3d<B>,
    conv2: ConvBlock<B>,
    up1: ConvTranspose3d<B>,
    conv1: ConvBlock<B>,
    // Back from patch resolution to the input grid.
    up0: ConvTranspose3d<B>,
    conv0: ConvBlock<B>,

    flow_head: Conv3d<B>,
    stn: SpatialTransformer<B>,
}

#[derive(Config, Debug)]
pub struct TransMorphConfig {
    /// Moving and fixed image.
    #[config(default = 2)]
    pub in_channels: usize,
    #[config(default = 96)]
    pub embed_dim: usize,
    #[config(default = "[5, 6, 7]")]
    pub window_size: [usize; 3],
    #[config(default = "[2, 2, 4, 2]")]
    pub depths: [usize; 4],
    #[config(default = "[4, 4, 8, 8]")]
    pub num_heads: [usize; 4],
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = 16)]
    pub reg_head_channels: usize,
}

impl TransMorphConfig {
    /// Windows that tile the bottleneck of an image of `shape` exactly:
    /// 160x192x224 gives (5, 6, 7), 160x192x160 gives (5, 6, 5).
    pub fn for_shape(shape: VolumeShape) -> Self {
        let window = shape.dims().map(|size| (size / 32).max(1));
        Self::new().with_window_size(window)
    }

    fn stage<B: Backend>(&self, dim: usize, level: usize, device: &B::Device) -> Vec<SwinTransformerBlock<B>> {
        (0..self.depths[level])
            .map(|i| {
                SwinTransformerBlockConfig::new(dim, self.num_heads[level], self.window_size, i % 2 == 1)
                    .with_mlp_ratio(self.mlp_ratio)
                    .init(device)
            })
            .collect()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> TransMorph<B> {
        let dim = self.embed_dim;
        let merge = |from: usize, to: usize| {
            Conv3dConfig::new([from, to], [2, 2, 2])
                .with_stride([2, 2, 2])
                .init(device)
        };

        TransMorph {
            patch_embed: Conv3dConfig::new([self.in_channels, dim], [4, 4, 4])
                .with_stride([4, 4, 4])
                .init(device),
            stage1: self.stage(dim, 0, device),
            down1: merge(dim, 2 * dim),
            stage2: self.stage(2 * dim, 1, device),
            down2: merge(2 * dim, 4 * dim),
            stage3: self.stage(4 * dim, 2, device),
            down3: merge(4 * dim, 8 * dim),
            stage4: self.stage(8 * dim, 3, device),

            up3: upsample(8 * dim, 4 * dim, 2, device),
            conv3: ConvBlockConfig::new(8 * dim, 4 * dim).init(device),
            up2: upsample(4 * dim, 2 * dim, 2, device),
            conv2: ConvBlockConfig::new(4 * dim, 2 * dim).init(device),
            up1: upsample(2 * dim, dim, 2, device),
            conv1: ConvBlockConfig::new(2 * dim, dim).init(device),
            up0: upsample(dim, self.reg_head_channels, 4, device),
            conv0: ConvBlockConfig::new(self.reg_head_channels + self.in_channels, self.reg_head_channels).init(device),

            flow_head: flow_head(self.reg_head_channels, device),
            stn: SpatialTransformer::new(),
        }
    }
}

fn run_stage<B: Backend>(blocks: &[SwinTransformerBlock<B>], x: Tensor<B, 5>) -> Tensor<B, 5> {
    let mut x = x.permute([0, 2, 3, 4, 1]);
    for block in blocks {
        x = block.forward(x);
    }
    x.permute([0, 4, 1, 2, 3])
}

impl<B: Backend> TransMorph<B> {
    /// `x`: `[N, 2, D, H, W]` with every spatial size divisible by 32.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x1 = run_stage(&self.stage1, self.patch_embed.forward(x.clone()));
        let x2 = run_stage(&self.stage2, self.down1.forward(x1.clone()));
        let x3 = run_stage(&self.stage3, self.down2.forward(x2.clone()));
        let x4 = run_stage(&self.stage4, self.down3.forward(x3.clone()));

        let d3 = self.conv3.forward(Tensor::cat(vec![self.up3.forward(x4), x3], 1));
        let d2 = self.conv2.forward(Tensor::cat(vec![self.up2.forward(d3), x2], 1));
        let d1 = self.conv1.forward(Tensor::cat(vec![self.up1.forward(d2), x1], 1));
        let d0 = self.conv0.forward(Tensor::cat(vec![self.up0.forward(d1), x], 1));

        self.flow_head.forward(d0)
    }
}

impl<B: Backend> RegistrationNetwork<B> for TransMorph<B> {
    fn register(&self, pair: &ImagePair<B>) -> RegistrationOutput<B> {
        let flow = self.forward(pair.network_input());
        let warped = self.stn.forward(pair.moving.clone(), flow.clone());
        RegistrationOutput { warped, flow }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_windows_follow_image_shape() {
        assert_eq!(TransMorphConfig::for_shape(VolumeShape::new(160, 192, 224)).window_size, [5, 6, 7]);
        assert_eq!(TransMorphConfig::for_shape(VolumeShape::new(160, 192, 160)).window_size, [5, 6, 5]);
    }

    #[test]
    fn test_register_full_resolution() {
        let device = Default::default();
        let model = TransMorphConfig::for_shape(VolumeShape::new(32, 32, 32))
            .with_embed_dim(4)
            .with_depths([1, 2, 1, 1])
            .with_num_heads([1, 1, 2, 2])
            .with_reg_head_channels(4)
            .init::<B>(&device);

        let fixed = Tensor::<B, 5>::random([1, 1, 32, 32, 32], burn::tensor::Distribution::Default, &device);
        let moving = Tensor::<B, 5>::random([1, 1, 32, 32, 32], burn::tensor::Distribution::Default, &device);
        let pair = ImagePair::new(fixed, moving).unwrap();

        let out = model.register(&pair);
        assert_eq!(out.flow.dims(), [1, 3, 32, 32, 32]);
        assert_eq!(out.warped.dims(), [1, 1, 32, 32, 32]);
        assert!(out.field().is_ok());
    }
}
