//! Convolution building blocks shared by the network variants.

use burn::{
    nn::{
        conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig},
        Gelu, Initializer, LayerNorm, LayerNormConfig, PaddingConfig3d,
    },
    prelude::*,
    tensor::activation::leaky_relu,
};

/// Two 3x3x3 convolutions, each followed by channel LayerNorm and GELU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv3d<B>,
    norm1: LayerNorm<B>,
    act: Gelu,
    conv2: Conv3d<B>,
    norm2: LayerNorm<B>,
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    in_channels: usize,
    out_channels: usize,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv1: same_conv(self.in_channels, self.out_channels).init(device),
            norm1: LayerNormConfig::new(self.out_channels).init(device),
            act: Gelu::new(),
            conv2: same_conv(self.out_channels, self.out_channels).init(device),
            norm2: LayerNormConfig::new(self.out_channels).init(device),
        }
    }
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv1.forward(x);
        let x = self.act.forward(channel_norm(&self.norm1, x));
        let x = self.conv2.forward(x);
        self.act.forward(channel_norm(&self.norm2, x))
    }
}

/// Single 3x3x3 convolution with LeakyReLU(0.2), optionally strided.
#[derive(Module, Debug)]
pub struct LeakyConv<B: Backend> {
    conv: Conv3d<B>,
}

impl<B: Backend> LeakyConv<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: same_conv(in_channels, out_channels)
                .with_stride([stride, stride, stride])
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        leaky_relu(self.conv.forward(x), 0.2)
    }
}

/// 3x3x3 convolution with unit padding, keeping the spatial size at stride 1.
pub fn same_conv(in_channels: usize, out_channels: usize) -> Conv3dConfig {
    Conv3dConfig::new([in_channels, out_channels], [3, 3, 3]).with_padding(PaddingConfig3d::Explicit(1, 1, 1))
}

/// Transposed convolution that multiplies the spatial size by `factor`.
pub fn upsample<B: Backend>(in_channels: usize, out_channels: usize, factor: usize, device: &B::Device) -> ConvTranspose3d<B> {
    ConvTranspose3dConfig::new([in_channels, out_channels], [factor, factor, factor])
        .with_stride([factor, factor, factor])
        .init(device)
}

/// Final 3-channel projection. Weights start near zero so that an untrained
/// network predicts an almost-identity deformation.
pub fn flow_head<B: Backend>(in_channels: usize, device: &B::Device) -> Conv3d<B> {
    same_conv(in_channels, 3)
        .with_initializer(Initializer::Normal { mean: 0.0, std: 1e-5 })
        .init(device)
}

/// LayerNorm over channels of a `[N, C, D, H, W]` tensor.
pub fn channel_norm<B: Backend>(norm: &LayerNorm<B>, x: Tensor<B, 5>) -> Tensor<B, 5> {
    norm.forward(x.permute([0, 2, 3, 4, 1])).permute([0, 4, 1, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_shapes() {
        let device = Default::default();
        let x = Tensor::<B, 5>::ones([1, 2, 8, 8, 8], &device);

        let block = ConvBlockConfig::new(2, 4).init::<B>(&device);
        assert_eq!(block.forward(x.clone()).dims(), [1, 4, 8, 8, 8]);

        let down = LeakyConv::<B>::new(2, 4, 2, &device);
        let low = down.forward(x);
        assert_eq!(low.dims(), [1, 4, 4, 4, 4]);

        let up = upsample::<B>(4, 3, 2, &device);
        assert_eq!(up.forward(low).dims(), [1, 3, 8, 8, 8]);
    }

    #[test]
    fn test_flow_head_starts_small() {
        let device = Default::default();
        let head = flow_head::<B>(4, &device);
        let out = head.forward(Tensor::<B, 5>::ones([1, 4, 4, 4, 4], &device));
        let max: f32 = out.abs().max().into_scalar();
        assert!(max < 1e-2);
    }
}
