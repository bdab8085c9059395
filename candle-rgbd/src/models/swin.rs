//! Swin Transformer encoder producing a five level feature pyramid.
//!
//! The stage layout follows the image-classification Swin checkpoints: each
//! stage runs its blocks and then merges patches, so the pyramid is made of
//! the patch embedding followed by every stage output. For a `(b, 3, h, w)`
//! input and `embed_dim = e` the features are
//!
//! | level | channels | stride |
//! |-------|----------|--------|
//! | 1     | e        | 4      |
//! | 2     | 2e       | 8      |
//! | 3     | 4e       | 16     |
//! | 4     | 8e       | 32     |
//! | 5     | 8e       | 32     |
//!
//! the last level being normalized by the final `norm` layer.
//!
//! References:
//! - [Swin Transformer Paper](https://arxiv.org/abs/2103.14030)
//! - [Microsoft Implementation](https://github.com/microsoft/Swin-Transformer)

use candle::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Conv2dConfig, Init, VarBuilder};
use serde::Deserialize;

use crate::models::with_tracing::{conv2d, layer_norm, linear, linear_b, Conv2d, LayerNorm, Linear};

fn default_patch_size() -> usize {
    4
}

fn default_in_channels() -> usize {
    3
}

fn default_mlp_ratio() -> f64 {
    4.0
}

fn default_qkv_bias() -> bool {
    true
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

/// Swin encoder configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SwinConfig {
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub embed_dim: usize,
    pub depths: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub window_size: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl SwinConfig {
    /// Swin-B with 12x12 windows, the 384x384 ImageNet-22k variant.
    pub fn base_384() -> Self {
        Self {
            patch_size: 4,
            in_channels: 3,
            embed_dim: 128,
            depths: vec![2, 2, 18, 2],
            num_heads: vec![4, 8, 16, 32],
            window_size: 12,
            mlp_ratio: 4.0,
            qkv_bias: true,
            layer_norm_eps: 1e-5,
        }
    }

    /// Swin-T with 7x7 windows.
    pub fn tiny_224() -> Self {
        Self {
            embed_dim: 96,
            depths: vec![2, 2, 6, 2],
            num_heads: vec![3, 6, 12, 24],
            window_size: 7,
            ..Self::base_384()
        }
    }

    /// Channel widths of the feature pyramid returned by [`SwinEncoder::forward_features`].
    pub fn feature_channels(&self) -> Vec<usize> {
        let mut channels: Vec<usize> = (0..self.depths.len())
            .map(|i| self.embed_dim << i)
            .collect();
        if let Some(&last) = channels.last() {
            channels.push(last);
        }
        channels
    }

    /// Total downsampling factor of the deepest stage.
    pub fn max_stride(&self) -> usize {
        self.patch_size << self.depths.len().saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() {
            candle::bail!("swin encoder needs at least one stage")
        }
        if self.depths.len() != self.num_heads.len() {
            candle::bail!(
                "swin depths and num_heads differ in length ({} <> {})",
                self.depths.len(),
                self.num_heads.len()
            )
        }
        for (i, &heads) in self.num_heads.iter().enumerate() {
            let dim = self.embed_dim << i;
            if heads == 0 || dim % heads != 0 {
                candle::bail!("stage {i}: dim {dim} is not divisible by {heads} heads")
            }
        }
        if self.window_size == 0 || self.patch_size == 0 {
            candle::bail!("swin window and patch sizes must be positive")
        }
        Ok(())
    }
}

impl Default for SwinConfig {
    fn default() -> Self {
        Self::base_384()
    }
}

#[derive(Debug, Clone)]
struct PatchEmbed {
    proj: Conv2d,
    norm: LayerNorm,
    patch_size: usize,
}

impl PatchEmbed {
    fn new(cfg: &SwinConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            cfg.in_channels,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        let norm = layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            patch_size: cfg.patch_size,
        })
    }

    /// Returns `(b, h*w, c)` tokens and the token grid size.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (_, _, h, w) = xs.dims4()?;
        let pad_h = (self.patch_size - h % self.patch_size) % self.patch_size;
        let pad_w = (self.patch_size - w % self.patch_size) % self.patch_size;
        let xs = xs.pad_with_zeros(2, 0, pad_h)?.pad_with_zeros(3, 0, pad_w)?;
        let xs = self.proj.forward(&xs)?;
        let (_, _, gh, gw) = xs.dims4()?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?;
        Ok((self.norm.forward(&xs)?, gh, gw))
    }
}

/// `(b, h, w, c)` -> `(b * nw, ws * ws, c)`, `h` and `w` being multiples of `ws`.
fn window_partition(xs: &Tensor, window_size: usize) -> Result<Tensor> {
    let (b, h, w, c) = xs.dims4()?;
    xs.reshape((
        b,
        h / window_size,
        window_size,
        w / window_size,
        window_size,
        c,
    ))?
    .transpose(2, 3)?
    .contiguous()?
    .reshape(((), window_size * window_size, c))
}

fn window_reverse(windows: &Tensor, window_size: usize, h: usize, w: usize) -> Result<Tensor> {
    let c = windows.dim(D::Minus1)?;
    let b = windows.dim(0)? / ((h / window_size) * (w / window_size));
    windows
        .reshape((
            b,
            h / window_size,
            w / window_size,
            window_size,
            window_size,
            c,
        ))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape(((), h, w, c))
}

fn relative_position_index(window_size: usize, device: &Device) -> Result<Tensor> {
    let n = window_size * window_size;
    let span = 2 * window_size - 1;
    let mut index = Vec::with_capacity(n * n);
    for i in 0..n {
        let (hi, wi) = (i / window_size, i % window_size);
        for j in 0..n {
            let (hj, wj) = (j / window_size, j % window_size);
            let dh = hi + window_size - 1 - hj;
            let dw = wi + window_size - 1 - wj;
            index.push((dh * span + dw) as u32);
        }
    }
    Tensor::from_vec(index, n * n, device)
}

#[derive(Debug, Clone)]
struct WindowAttention {
    qkv: Linear,
    proj: Linear,
    relative_position_bias_table: Tensor,
    relative_position_index: Tensor,
    num_heads: usize,
    window_size: usize,
    scale: f64,
}

impl WindowAttention {
    fn new(
        dim: usize,
        window_size: usize,
        num_heads: usize,
        qkv_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let qkv = linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        let span = 2 * window_size - 1;
        let relative_position_bias_table = vb.get_with_hints(
            (span * span, num_heads),
            "relative_position_bias_table",
            Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        )?;
        let relative_position_index = relative_position_index(window_size, vb.device())?;
        let scale = ((dim / num_heads) as f64).powf(-0.5);
        Ok(Self {
            qkv,
            proj,
            relative_position_bias_table,
            relative_position_index,
            num_heads,
            window_size,
            scale,
        })
    }

    fn relative_position_bias(&self) -> Result<Tensor> {
        let n = self.window_size * self.window_size;
        self.relative_position_bias_table
            .index_select(&self.relative_position_index, 0)?
            .reshape((n, n, self.num_heads))?
            .permute((2, 0, 1))?
            .unsqueeze(0)
    }

    /// `xs`: `(b * nw, n, c)` windows, `mask`: `(nw, n, n)` additive mask.
    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b_, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = q.matmul(&k.t()?)?;
        let attn = attn.broadcast_add(&self.relative_position_bias()?)?;
        let attn = match mask {
            Some(mask) => {
                let nw = mask.dim(0)?;
                attn.reshape((b_ / nw, nw, self.num_heads, n, n))?
                    .broadcast_add(&mask.unsqueeze(1)?.unsqueeze(0)?)?
                    .reshape((b_, self.num_heads, n, n))?
            }
            None => attn,
        };
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let xs = attn.matmul(&v)?.transpose(1, 2)?.reshape((b_, n, c))?;
        self.proj.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(dim, hidden, vb.pp("fc1"))?;
        let fc2 = linear(hidden, dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

#[derive(Debug, Clone)]
struct SwinBlock {
    norm1: LayerNorm,
    attn: WindowAttention,
    norm2: LayerNorm,
    mlp: Mlp,
    window_size: usize,
    shift_size: usize,
    span: tracing::Span,
}

impl SwinBlock {
    fn new(
        cfg: &SwinConfig,
        dim: usize,
        num_heads: usize,
        window_size: usize,
        shift_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm1"))?;
        let attn = WindowAttention::new(dim, window_size, num_heads, cfg.qkv_bias, vb.pp("attn"))?;
        let norm2 = layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm2"))?;
        let mlp = Mlp::new(dim, (dim as f64 * cfg.mlp_ratio) as usize, vb.pp("mlp"))?;
        let span = tracing::span!(tracing::Level::TRACE, "swin-block");
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
            window_size,
            shift_size,
            span,
        })
    }

    fn forward(&self, xs: &Tensor, h: usize, w: usize, mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, l, c) = xs.dims3()?;
        if l != h * w {
            candle::bail!("swin block got {l} tokens for a {h}x{w} grid")
        }
        let ws = self.window_size;
        let shortcut = xs;
        let xs = self.norm1.forward(xs)?.reshape((b, h, w, c))?;

        let pad_b = (ws - h % ws) % ws;
        let pad_r = (ws - w % ws) % ws;
        let xs = xs.pad_with_zeros(1, 0, pad_b)?.pad_with_zeros(2, 0, pad_r)?;
        let (hp, wp) = (h + pad_b, w + pad_r);

        let shift = self.shift_size as i32;
        let (xs, mask) = if self.shift_size > 0 {
            (xs.roll(-shift, 1)?.roll(-shift, 2)?, mask)
        } else {
            (xs, None)
        };

        let windows = window_partition(&xs, ws)?;
        let windows = self.attn.forward(&windows, mask)?;
        let xs = window_reverse(&windows, ws, hp, wp)?;

        let xs = if self.shift_size > 0 {
            xs.roll(shift, 1)?.roll(shift, 2)?
        } else {
            xs
        };
        let xs = xs
            .narrow(1, 0, h)?
            .narrow(2, 0, w)?
            .contiguous()?
            .reshape((b, h * w, c))?;

        let xs = (shortcut + xs)?;
        let mlp_out = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        xs + mlp_out
    }
}

#[derive(Debug, Clone)]
struct PatchMerging {
    reduction: Linear,
    norm: LayerNorm,
}

impl PatchMerging {
    fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let reduction = linear_b(4 * dim, 2 * dim, false, vb.pp("reduction"))?;
        let norm = layer_norm(4 * dim, eps, vb.pp("norm"))?;
        Ok(Self { reduction, norm })
    }

    fn forward(&self, xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let (b, _, c) = xs.dims3()?;
        let xs = xs
            .reshape((b, h, w, c))?
            .pad_with_zeros(1, 0, h % 2)?
            .pad_with_zeros(2, 0, w % 2)?;
        let (hp, wp) = (h + h % 2, w + w % 2);
        let xs = xs.reshape((b, hp / 2, 2, wp / 2, 2, c))?;
        // Order matches x[0::2, 0::2], x[1::2, 0::2], x[0::2, 1::2], x[1::2, 1::2].
        let parts = [(0, 0), (1, 0), (0, 1), (1, 1)]
            .iter()
            .map(|&(dh, dw)| {
                xs.narrow(2, dh, 1)?
                    .narrow(4, dw, 1)?
                    .reshape((b, hp / 2 * (wp / 2), c))
            })
            .collect::<Result<Vec<_>>>()?;
        let xs = Tensor::cat(&parts, D::Minus1)?;
        self.reduction.forward(&self.norm.forward(&xs)?)
    }
}

#[derive(Debug, Clone)]
struct SwinStage {
    blocks: Vec<SwinBlock>,
    downsample: Option<PatchMerging>,
    window_size: usize,
    shift_size: usize,
}

impl SwinStage {
    /// `resolution` is the token grid this stage sees for the nominal input size;
    /// windows larger than the grid shrink to it and stop shifting.
    fn new(
        cfg: &SwinConfig,
        stage: usize,
        resolution: usize,
        downsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dim = cfg.embed_dim << stage;
        let (window_size, shift_size) = if resolution <= cfg.window_size {
            (resolution.max(1), 0)
        } else {
            (cfg.window_size, cfg.window_size / 2)
        };
        let blocks = (0..cfg.depths[stage])
            .map(|i| {
                let shift = if i % 2 == 0 { 0 } else { shift_size };
                SwinBlock::new(
                    cfg,
                    dim,
                    cfg.num_heads[stage],
                    window_size,
                    shift,
                    vb.pp(format!("blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let downsample = if downsample {
            Some(PatchMerging::new(dim, cfg.layer_norm_eps, vb.pp("downsample"))?)
        } else {
            None
        };
        Ok(Self {
            blocks,
            downsample,
            window_size,
            shift_size,
        })
    }

    /// Additive `(nw, ws*ws, ws*ws)` mask keeping shifted windows from attending
    /// across the wrapped border.
    fn attention_mask(&self, hp: usize, wp: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let (ws, ss) = (self.window_size, self.shift_size);
        let slices = |n: usize| [(0, n - ws), (n - ws, n - ss), (n - ss, n)];
        let mut img_mask = vec![0f32; hp * wp];
        let mut cnt = 0f32;
        for (h0, h1) in slices(hp) {
            for (w0, w1) in slices(wp) {
                for h in h0..h1 {
                    for w in w0..w1 {
                        img_mask[h * wp + w] = cnt;
                    }
                }
                cnt += 1.;
            }
        }
        let img_mask = Tensor::from_vec(img_mask, (1, hp, wp, 1), device)?;
        let mask_windows = window_partition(&img_mask, ws)?.reshape(((), ws * ws))?;
        let diff = mask_windows
            .unsqueeze(1)?
            .broadcast_sub(&mask_windows.unsqueeze(2)?)?;
        let zeros = diff.zeros_like()?;
        let masked = (diff.ones_like()? * -100.0)?;
        diff.ne(&zeros)?.where_cond(&masked, &zeros)?.to_dtype(dtype)
    }

    /// Returns the (possibly merged) tokens and their grid size.
    fn forward(&self, xs: &Tensor, h: usize, w: usize) -> Result<(Tensor, usize, usize)> {
        let mask = if self.shift_size > 0 {
            let hp = h.div_ceil(self.window_size) * self.window_size;
            let wp = w.div_ceil(self.window_size) * self.window_size;
            Some(self.attention_mask(hp, wp, xs.device(), xs.dtype())?)
        } else {
            None
        };
        let mut xs = xs.clone();
        for block in self.blocks.iter() {
            xs = block.forward(&xs, h, w, mask.as_ref())?;
        }
        match &self.downsample {
            Some(downsample) => Ok((downsample.forward(&xs, h, w)?, h.div_ceil(2), w.div_ceil(2))),
            None => Ok((xs, h, w)),
        }
    }
}

fn tokens_to_map(xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (b, _, c) = xs.dims3()?;
    xs.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()
}

#[derive(Debug, Clone)]
pub struct SwinEncoder {
    patch_embed: PatchEmbed,
    stages: Vec<SwinStage>,
    norm: LayerNorm,
    config: SwinConfig,
    span: tracing::Span,
}

impl SwinEncoder {
    /// `img_size` is the nominal square input size used to fit windows to the
    /// token grids; other sizes are padded to whole windows at run time.
    pub fn new(cfg: &SwinConfig, img_size: usize, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let num_stages = cfg.depths.len();
        let mut resolution = img_size.div_ceil(cfg.patch_size);
        let mut stages = Vec::with_capacity(num_stages);
        for stage in 0..num_stages {
            let downsample = stage + 1 < num_stages;
            stages.push(SwinStage::new(
                cfg,
                stage,
                resolution,
                downsample,
                vb.pp(format!("layers.{stage}")),
            )?);
            if downsample {
                resolution = resolution.div_ceil(2);
            }
        }
        let num_features = cfg.embed_dim << (num_stages - 1);
        let norm = layer_norm(num_features, cfg.layer_norm_eps, vb.pp("norm"))?;
        let span = tracing::span!(tracing::Level::TRACE, "swin-encoder");
        Ok(Self {
            patch_embed,
            stages,
            norm,
            config: cfg.clone(),
            span,
        })
    }

    pub fn config(&self) -> &SwinConfig {
        &self.config
    }

    /// The patch embedding followed by every stage output, finest first.
    pub fn forward_features(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let (mut xs, mut h, mut w) = self.patch_embed.forward(xs)?;
        let mut features = Vec::with_capacity(self.stages.len() + 1);
        features.push(tokens_to_map(&xs, h, w)?);
        let last = self.stages.len() - 1;
        for (i, stage) in self.stages.iter().enumerate() {
            (xs, h, w) = stage.forward(&xs, h, w)?;
            let out = if i == last {
                self.norm.forward(&xs)?
            } else {
                xs.clone()
            };
            features.push(tokens_to_map(&out, h, w)?);
        }
        Ok(features)
    }
}

impl Module for SwinEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let features = self.forward_features(xs)?;
        features
            .last()
            .cloned()
            .ok_or_else(|| candle::Error::Msg("swin encoder produced no features".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_position_index_is_centered() -> Result<()> {
        let index = relative_position_index(2, &Device::Cpu)?.to_vec1::<u32>()?;
        assert_eq!(index.len(), 16);
        // (0,0) attending to itself sits at the table center.
        assert_eq!(index[0], 4);
        assert_eq!(*index.iter().max().unwrap(), 8);
        Ok(())
    }

    #[test]
    fn feature_channels_double_per_stage() {
        let cfg = SwinConfig::base_384();
        assert_eq!(cfg.feature_channels(), vec![128, 256, 512, 1024, 1024]);
        assert_eq!(cfg.max_stride(), 32);
    }

    #[test]
    fn window_reverse_undoes_partition() -> Result<()> {
        let xs = Tensor::arange(0f32, 2. * 4. * 6. * 3., &Device::Cpu)?.reshape((2, 4, 6, 3))?;
        let windows = window_partition(&xs, 2)?;
        assert_eq!(windows.dims(), &[12, 4, 3]);
        // First window of the first image: rows 0-1, columns 0-1.
        let first = windows.get(0)?.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, [0., 3., 18., 21.]);
        let back = window_reverse(&windows, 2, 4, 6)?;
        assert_eq!(back.dims(), &[2, 4, 6, 3]);
        assert_eq!(
            back.flatten_all()?.to_vec1::<f32>()?,
            xs.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn shifted_window_mask_separates_wrapped_regions() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = SwinConfig {
            embed_dim: 4,
            depths: vec![2],
            num_heads: vec![1],
            window_size: 2,
            ..SwinConfig::tiny_224()
        };
        let stage = SwinStage::new(&cfg, 0, 4, false, VarBuilder::zeros(DType::F32, &dev))?;
        assert_eq!((stage.window_size, stage.shift_size), (2, 1));
        let mask = stage.attention_mask(4, 4, &dev, DType::F32)?;
        assert_eq!(mask.dims(), &[4, 4, 4]);
        let mask = mask.to_vec3::<f32>()?;
        // The top-left window lies inside one region.
        assert!(mask[0].iter().flatten().all(|&v| v == 0.));
        // Top-right window: columns 2 and 3 come from different regions.
        assert_eq!(
            mask[1],
            [
                [0., -100., 0., -100.],
                [-100., 0., -100., 0.],
                [0., -100., 0., -100.],
                [-100., 0., -100., 0.],
            ]
        );
        // Bottom-left window: rows 2 and 3 come from different regions.
        assert_eq!(
            mask[2],
            [
                [0., 0., -100., -100.],
                [0., 0., -100., -100.],
                [-100., -100., 0., 0.],
                [-100., -100., 0., 0.],
            ]
        );
        // Bottom-right window: four regions, a token only sees itself.
        for (i, row) in mask[3].iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if i == j { 0. } else { -100. });
            }
        }
        Ok(())
    }
}
