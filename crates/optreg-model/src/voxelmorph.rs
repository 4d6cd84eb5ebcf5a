//! VoxelMorph: a convolutional U-Net predicting a dense field, optionally a
//! stationary velocity integrated by scaling and squaring.

use burn::{nn::conv::Conv3d, nn::conv::ConvTranspose3d, prelude::*};
use optreg_core::{ImagePair, SpatialTransformer};

use crate::blocks::{flow_head, upsample, LeakyConv};
use crate::integration::VecInt;
use crate::network::{RegistrationNetwork, RegistrationOutput};

#[derive(Module, Debug)]
pub struct VoxelMorph<B: Backend> {
    encoder: Vec<LeakyConv<B>>,
    upsamplers: Vec<ConvTranspose3d<B>>,
    decoder: Vec<LeakyConv<B>>,
    remaining: Vec<LeakyConv<B>>,
    flow_head: Conv3d<B>,
    integrate: Option<VecInt<B>>,
    stn: SpatialTransformer<B>,
}

#[derive(Config, Debug)]
pub struct VoxelMorphConfig {
    #[config(default = 2)]
    pub in_channels: usize,
    /// Channels per encoder level; each level halves the resolution.
    #[config(default = "vec![16, 32, 32, 32]")]
    pub encoder_features: Vec<usize>,
    /// Channels per decoder level, coarsest first.
    #[config(default = "vec![32, 32, 32, 32]")]
    pub decoder_features: Vec<usize>,
    /// Extra full-resolution convolutions before the flow head.
    #[config(default = "vec![32, 16, 16]")]
    pub remaining_features: Vec<usize>,
    /// Scaling-and-squaring steps; 0 predicts displacement directly.
    #[config(default = 7)]
    pub integration_steps: usize,
}

impl VoxelMorphConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VoxelMorph<B> {
        let levels = self.encoder_features.len();

        let mut encoder = Vec::with_capacity(levels);
        let mut channels = self.in_channels;
        for &features in &self.encoder_features {
            encoder.push(LeakyConv::new(channels, features, 2, device));
            channels = features;
        }

        // Skip channels per level, finest first: the raw input, then every
        // encoder level except the bottleneck.
        let mut skips = vec![self.in_channels];
        skips.extend(self.encoder_features.iter().take(levels.saturating_sub(1)));

        let mut upsamplers = Vec::with_capacity(levels);
        let mut decoder = Vec::with_capacity(levels);
        for (i, &skip) in skips.iter().rev().enumerate() {
            let features = self.decoder_features.get(i).copied().unwrap_or(channels);
            upsamplers.push(upsample(channels, channels, 2, device));
            decoder.push(LeakyConv::new(channels + skip, features, 1, device));
            channels = features;
        }

        let mut remaining = Vec::with_capacity(self.remaining_features.len());
        for &features in &self.remaining_features {
            remaining.push(LeakyConv::new(channels, features, 1, device));
            channels = features;
        }

        VoxelMorph {
            encoder,
            upsamplers,
            decoder,
            remaining,
            flow_head: flow_head(channels, device),
            integrate: (self.integration_steps > 0).then(|| VecInt::new(self.integration_steps)),
            stn: SpatialTransformer::new(),
        }
    }
}

impl<B: Backend> VoxelMorph<B> {
    /// `x`: `[N, 2, D, H, W]` with spatial sizes divisible by `2^levels`.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut skips = vec![x.clone()];
        let mut x = x;
        for conv in &self.encoder {
            x = conv.forward(x);
            skips.push(x.clone());
        }
        // The bottleneck is not a skip connection.
        skips.pop();

        for (up, conv) in self.upsamplers.iter().zip(&self.decoder) {
            let skip = match skips.pop() {
                Some(skip) => skip,
                None => break,
            };
            x = conv.forward(Tensor::cat(vec![up.forward(x), skip], 1));
        }
        for conv in &self.remaining {
            x = conv.forward(x);
        }

        let flow = self.flow_head.forward(x);
        match &self.integrate {
            Some(integrate) => integrate.forward(flow),
            None => flow,
        }
    }
}

impl<B: Backend> RegistrationNetwork<B> for VoxelMorph<B> {
    fn register(&self, pair: &ImagePair<B>) -> RegistrationOutput<B> {
        let flow = self.forward(pair.network_input());
        let warped = self.stn.forward(pair.moving.clone(), flow.clone());
        RegistrationOutput { warped, flow }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn pair(size: usize) -> ImagePair<B> {
        let device = Default::default();
        let dims = [1, 1, size, size, size];
        ImagePair::new(
            Tensor::random(dims, Distribution::Default, &device),
            Tensor::random(dims, Distribution::Default, &device),
        )
        .unwrap()
    }

    #[test]
    fn test_register_full_resolution() {
        let device = Default::default();
        let model = VoxelMorphConfig::new()
            .with_encoder_features(vec![4, 8, 8])
            .with_decoder_features(vec![8, 8, 8])
            .with_remaining_features(vec![4])
            .init::<B>(&device);

        let out = model.register(&pair(16));
        assert_eq!(out.flow.dims(), [1, 3, 16, 16, 16]);
        assert_eq!(out.warped.dims(), [1, 1, 16, 16, 16]);
    }

    #[test]
    fn test_without_integration() {
        let device = Default::default();
        let model = VoxelMorphConfig::new()
            .with_encoder_features(vec![4, 4])
            .with_decoder_features(vec![4, 4])
            .with_remaining_features(vec![])
            .with_integration_steps(0)
            .init::<B>(&device);
        assert!(model.integrate.is_none());
        assert_eq!(model.register(&pair(8)).flow.dims(), [1, 3, 8, 8, 8]);
    }
}
