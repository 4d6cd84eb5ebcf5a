use burn::{
    nn::{Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::softmax,
};

/// Swin transformer block over channels-last `[N, D, H, W, C]` volumes.
///
/// Windows may differ per axis. When a feature map is not larger than the
/// window along an axis, the window shrinks to the map and that axis is
/// not shifted.
#[derive(Module, Debug)]
pub struct SwinTransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attention: WindowAttention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    window_d: usize,
    window_h: usize,
    window_w: usize,
    shifted: bool,
}

#[derive(Config, Debug)]
pub struct SwinTransformerBlockConfig {
    pub input_dim: usize,
    pub num_heads: usize,
    pub window_size: [usize; 3],
    pub shifted: bool,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl SwinTransformerBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwinTransformerBlock<B> {
        let hidden = (self.input_dim as f64 * self.mlp_ratio) as usize;
        let [window_d, window_h, window_w] = self.window_size;

        SwinTransformerBlock {
            norm1: LayerNormConfig::new(self.input_dim).init(device),
            attention: WindowAttentionConfig::new(self.input_dim, self.num_heads)
                .with_dropout(self.dropout)
                .init(device),
            norm2: LayerNormConfig::new(self.input_dim).init(device),
            mlp: MlpConfig::new(self.input_dim, hidden).with_dropout(self.dropout).init(device),
            window_d,
            window_h,
            window_w,
            shifted: self.shifted,
        }
    }
}

/// Effective window and shift for one axis of a map of length `size`.
fn axis_window(window: usize, size: usize, shifted: bool) -> (usize, usize) {
    if size <= window {
        (size, 0)
    } else if shifted {
        (window, window / 2)
    } else {
        (window, 0)
    }
}

impl<B: Backend> SwinTransformerBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let [n, d, h, w, c] = x.dims();
        let (wd, sd) = axis_window(self.window_d, d, self.shifted);
        let (wh, sh) = axis_window(self.window_h, h, self.shifted);
        let (ww, sw) = axis_window(self.window_w, w, self.shifted);
        let windows = [wd, wh, ww];
        let shifts = [sd, sh, sw];

        let shortcut = x.clone();
        let x = self.norm1.forward(x);

        let pads = [(wd - d % wd) % wd, (wh - h % wh) % wh, (ww - w % ww) % ww];
        let x = pad_zeros(x, pads);
        let [_, pd, ph, pw, _] = x.dims();

        let x = roll(x, shifts, false);
        let attended = self.attention.forward(window_partition(x, windows));
        let x = roll(window_reverse(attended, windows, [pd, ph, pw]), shifts, true);
        let x = x.slice([0..n, 0..d, 0..h, 0..w, 0..c]);

        let x = shortcut + x;
        let shortcut = x.clone();
        shortcut + self.mlp.forward(self.norm2.forward(x))
    }
}

fn pad_zeros<B: Backend>(x: Tensor<B, 5>, pads: [usize; 3]) -> Tensor<B, 5> {
    let device = x.device();
    let mut x = x;
    for (axis, pad) in pads.into_iter().enumerate() {
        if pad > 0 {
            let mut dims = x.dims();
            dims[axis + 1] = pad;
            x = Tensor::cat(vec![x, Tensor::zeros(dims, &device)], axis + 1);
        }
    }
    x
}

/// Cyclic shift along D, H, W. Forward rolls towards lower indices.
fn roll<B: Backend>(x: Tensor<B, 5>, shifts: [usize; 3], back: bool) -> Tensor<B, 5> {
    let mut x = x;
    for (axis, shift) in shifts.into_iter().enumerate() {
        let dim = axis + 1;
        let size = x.dims()[dim];
        let shift = shift % size.max(1);
        if shift == 0 {
            continue;
        }
        let split = if back { size - shift } else { shift };
        let head = x.clone().narrow(dim, 0, split);
        let tail = x.narrow(dim, split, size - split);
        x = Tensor::cat(vec![tail, head], dim);
    }
    x
}

/// `[N, D, H, W, C]` to `[N * windows, wd * wh * ww, C]`.
///
/// Splits one axis at a time so that no intermediate exceeds six dimensions.
fn window_partition<B: Backend>(x: Tensor<B, 5>, windows: [usize; 3]) -> Tensor<B, 3> {
    let [n, d, h, w, c] = x.dims();
    let [wd, wh, ww] = windows;
    let (nd, nh, nw) = (d / wd, h / wh, w / ww);

    let x = x
        .reshape([n, nd, wd, h, w, c])
        .permute([0, 1, 3, 4, 2, 5])
        .reshape([n * nd, h, w, wd, c]);
    let x = x
        .reshape([n * nd, nh, wh, w, wd, c])
        .permute([0, 1, 3, 4, 2, 5])
        .reshape([n * nd * nh, w, wd, wh, c]);
    x.reshape([n * nd * nh, nw, ww, wd, wh, c])
        .permute([0, 1, 3, 4, 2, 5])
        .reshape([n * nd * nh * nw, wd * wh * ww, c])
}

/// Inverse of [`window_partition`] for a padded map of size `dims`.
fn window_reverse<B: Backend>(windows_in: Tensor<B, 3>, windows: [usize; 3], dims: [usize; 3]) -> Tensor<B, 5> {
    let [wd, wh, ww] = windows;
    let [d, h, w] = dims;
    let (nd, nh, nw) = (d / wd, h / wh, w / ww);
    let [total, _, c] = windows_in.dims();
    let n = total / (nd * nh * nw);

    let x = windows_in
        .reshape([n * nd * nh, nw, wd, wh, ww, c])
        .permute([0, 1, 4, 2, 3, 5])
        .reshape([n * nd * nh, w, wd, wh, c]);
    let x = x
        .reshape([n * nd, nh, w, wd, wh, c])
        .permute([0, 1, 4, 2, 3, 5])
        .reshape([n * nd, h, w, wd, c]);
    x.reshape([n, nd, h, w, wd, c])
        .permute([0, 1, 4, 2, 3, 5])
        .reshape([n, d, h, w, c])
}

#[derive(Module, Debug)]
pub struct WindowAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    proj: Linear<B>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct WindowAttentionConfig {
    input_dim: usize,
    num_heads: usize,
    #[config(default = 0.0)]
    dropout: f64,
}

impl WindowAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> WindowAttention<B> {
        let head_dim = self.input_dim / self.num_heads;
        WindowAttention {
            query: LinearConfig::new(self.input_dim, self.input_dim).init(device),
            key: LinearConfig::new(self.input_dim, self.input_dim).init(device),
            value: LinearConfig::new(self.input_dim, self.input_dim).init(device),
            proj: LinearConfig::new(self.input_dim, self.input_dim).init(device),
            num_heads: self.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> WindowAttention<B> {
    /// `x`: `[windows, tokens, C]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let heads = |t: Tensor<B, 3>| t.reshape([b, n, self.num_heads, self.head_dim]).permute([0, 2, 1, 3]);

        let q = heads(self.query.forward(x.clone()));
        let k = heads(self.key.forward(x.clone()));
        let v = heads(self.value.forward(x));

        let attn = softmax(q.matmul(k.transpose()) * self.scale, 3);
        let attn = self.dropout.forward(attn);

        let x = attn.matmul(v).permute([0, 2, 1, 3]).reshape([b, n, c]);
        self.proj.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct MlpConfig {
    input_dim: usize,
    hidden_dim: usize,
    #[config(default = 0.0)]
    dropout: f64,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(self.hidden_dim, self.input_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.act.forward(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        self.dropout.forward(self.fc2.forward(x))
    }
}
