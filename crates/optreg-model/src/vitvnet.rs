//! ViT-V-Net: convolutional stem, vision transformer bottleneck and a
//! V-Net style decoder.

use burn::{
    module::Param,
    nn::{
        conv::{Conv3d, Conv3dConfig, ConvTranspose3d},
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
    },
    prelude::*,
};
use optreg_core::{ImagePair, SpatialTransformer, VolumeShape};

use crate::blocks::{flow_head, upsample, ConvBlock, ConvBlockConfig, LeakyConv};
use crate::network::{RegistrationNetwork, RegistrationOutput};

/// Total downsampling between the input grid and the token grid.
const TOKEN_STRIDE: usize = 16;

#[derive(Module, Debug)]
pub struct ViTVNet<B: Backend> {
    inc: ConvBlock<B>,
    down1: LeakyConv<B>,
    down2: LeakyConv<B>,
    patch_embed: Conv3d<B>,
    position: Param<Tensor<B, 3>>,
    transformer: TransformerEncoder<B>,
    conv_more: LeakyConv<B>,
    up3: ConvTranspose3d<B>,
    dec3: ConvBlock<B>,
    up2: ConvTranspose3d<B>,
    dec2: ConvBlock<B>,
    up1: ConvTranspose3d<B>,
    dec1: ConvBlock<B>,
    flow_head: Conv3d<B>,
    stn: SpatialTransformer<B>,
}

#[derive(Config, Debug)]
pub struct ViTVNetConfig {
    pub image_shape: VolumeShape,
    #[config(default = 2)]
    pub in_channels: usize,
    /// Stem channels at full, half and quarter resolution.
    #[config(default = "[16, 32, 32]")]
    pub encoder_channels: [usize; 3],
    #[config(default = 252)]
    pub hidden_size: usize,
    #[config(default = 3072)]
    pub mlp_dim: usize,
    #[config(default = 12)]
    pub num_heads: usize,
    #[config(default = 12)]
    pub num_layers: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Decoder channels at token, quarter, half and full resolution.
    #[config(default = "[96, 48, 32, 16]")]
    pub decoder_channels: [usize; 4],
}

impl ViTVNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ViTVNet<B> {
        let [c0, c1, c2] = self.encoder_channels;
        let [t, q, h, f] = self.decoder_channels;
        let tokens: usize = self.image_shape.dims().iter().map(|s| (s / TOKEN_STRIDE).max(1)).product();

        ViTVNet {
            inc: ConvBlockConfig::new(self.in_channels, c0).init(device),
            down1: LeakyConv::new(c0, c1, 2, device),
            down2: LeakyConv::new(c1, c2, 2, device),
            patch_embed: Conv3dConfig::new([c2, self.hidden_size], [4, 4, 4])
                .with_stride([4, 4, 4])
                .init(device),
            position: Param::from_tensor(Tensor::zeros([1, tokens, self.hidden_size], device)),
            transformer: TransformerEncoderConfig::new(self.hidden_size, self.mlp_dim, self.num_heads, self.num_layers)
                .with_dropout(self.dropout)
                .init(device),
            conv_more: LeakyConv::new(self.hidden_size, t, 1, device),
            up3: upsample(t, t, 4, device),
            dec3: ConvBlockConfig::new(t + c2, q).init(device),
            up2: upsample(q, q, 2, device),
            dec2: ConvBlockConfig::new(q + c1, h).init(device),
            up1: upsample(h, h, 2, device),
            dec1: ConvBlockConfig::new(h + c0, f).init(device),
            flow_head: flow_head(f, device),
            stn: SpatialTransformer::new(),
        }
    }
}

impl<B: Backend> ViTVNet<B> {
    /// `x`: `[N, 2, D, H, W]` on the grid the model was configured for.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let s0 = self.inc.forward(x);
        let s1 = self.down1.forward(s0.clone());
        let s2 = self.down2.forward(s1.clone());

        let patches = self.patch_embed.forward(s2.clone());
        let [n, hidden, td, th, tw] = patches.dims();
        let tokens = patches.reshape([n, hidden, td * th * tw]).swap_dims(1, 2) + self.position.val();
        let encoded = self.transformer.forward(TransformerEncoderInput::new(tokens));
        let grid = encoded.swap_dims(1, 2).reshape([n, hidden, td, th, tw]);

        let x = self.conv_more.forward(grid);
        let x = self.dec3.forward(Tensor::cat(vec![self.up3.forward(x), s2], 1));
        let x = self.dec2.forward(Tensor::cat(vec![self.up2.forward(x), s1], 1));
        let x = self.dec1.forward(Tensor::cat(vec![self.up1.forward(x), s0], 1));
        self.flow_head.forward(x)
    }
}

impl<B: Backend> RegistrationNetwork<B> for ViTVNet<B> {
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

    #[test]
    fn test_register_full_resolution() {
        let device = Default::default();
        let shape = VolumeShape::new(16, 32, 16);
        let model = ViTVNetConfig::new(shape)
            .with_encoder_channels([4, 4, 8])
            .with_hidden_size(8)
            .with_mlp_dim(16)
            .with_num_heads(2)
            .with_num_layers(1)
            .with_decoder_channels([8, 8, 4, 4])
            .init::<B>(&device);
        assert_eq!(model.position.val().dims(), [1, 2, 8]);

        let dims = [1, 1, 16, 32, 16];
        let pair = ImagePair::new(
            Tensor::random(dims, Distribution::Default, &device),
            Tensor::random(dims, Distribution::Default, &device),
        )
        .unwrap();
        let out = model.register(&pair);
        assert_eq!(out.flow.dims(), [1, 3, 16, 32, 16]);
        assert_eq!(out.warped.dims(), [1, 1, 16, 32, 16]);
    }
}
