//! Residual blocks with a selectable normalization, and the conv + batch-norm unit.

use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2dConfig, GroupNorm, VarBuilder};
use serde::Deserialize;

use crate::models::with_tracing::{conv2d, conv2d_no_bias, Conv2d};

/// Normalization applied after each convolution of a [`ResidualBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Group norm with `channels / 8` groups.
    Group,
    #[default]
    Batch,
    /// Instance norm without affine parameters.
    Instance,
    None,
}

#[derive(Debug, Clone)]
pub enum Norm2d {
    Group(GroupNorm),
    Batch(BatchNorm),
    Instance { eps: f64 },
    Identity,
}

impl Norm2d {
    pub fn new(kind: NormKind, channels: usize, vb: VarBuilder) -> Result<Self> {
        let norm = match kind {
            NormKind::Group => {
                let num_groups = channels / 8;
                if num_groups == 0 {
                    candle::bail!("group norm needs at least 8 channels, got {channels}")
                }
                Self::Group(candle_nn::group_norm(num_groups, channels, 1e-5, vb)?)
            }
            NormKind::Batch => Self::Batch(candle_nn::batch_norm(channels, 1e-5, vb)?),
            NormKind::Instance => Self::Instance { eps: 1e-5 },
            NormKind::None => Self::Identity,
        };
        Ok(norm)
    }
}

/// Normalizes every `(batch, channel)` plane over its spatial positions.
pub fn instance_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = xs.mean_keepdim((2, 3))?;
    let xs = xs.broadcast_sub(&mean)?;
    let var = xs.sqr()?.mean_keepdim((2, 3))?;
    xs.broadcast_div(&(var + eps)?.sqrt()?)
}

impl ModuleT for Norm2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Group(gn) => gn.forward(xs),
            Self::Batch(bn) => bn.forward_t(xs, train),
            Self::Instance { eps } => instance_norm(xs, *eps),
            Self::Identity => Ok(xs.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    norm1: Norm2d,
    norm2: Norm2d,
    downsample: Option<(Conv2d, Norm2d)>,
    span: tracing::Span,
}

impl ResidualBlock {
    pub fn new(
        in_planes: usize,
        planes: usize,
        norm: NormKind,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = conv2d(
            in_planes,
            planes,
            3,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = conv2d(
            planes,
            planes,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let norm1 = Norm2d::new(norm, planes, vb.pp("norm1"))?;
        let norm2 = Norm2d::new(norm, planes, vb.pp("norm2"))?;
        let downsample = if stride == 1 {
            None
        } else {
            let vb = vb.pp("downsample");
            let conv = conv2d(
                in_planes,
                planes,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("0"),
            )?;
            Some((conv, Norm2d::new(norm, planes, vb.pp("1"))?))
        };
        let span = tracing::span!(tracing::Level::TRACE, "residual-block");
        Ok(Self {
            conv1,
            conv2,
            norm1,
            norm2,
            downsample,
            span,
        })
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let ys = self.norm1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let ys = self.norm2.forward_t(&self.conv2.forward(&ys)?, train)?.relu()?;
        let shortcut = match &self.downsample {
            Some((conv, norm)) => norm.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (shortcut + ys)?.relu()
    }
}

/// A stride-`s` residual block followed by a stride-1 one, both `planes` wide.
#[derive(Debug, Clone)]
pub struct ResidualStage {
    first: ResidualBlock,
    second: ResidualBlock,
}

impl ResidualStage {
    pub fn new(
        in_planes: usize,
        planes: usize,
        norm: NormKind,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let first = ResidualBlock::new(in_planes, planes, norm, stride, vb.pp("0"))?;
        let second = ResidualBlock::new(planes, planes, norm, 1, vb.pp("1"))?;
        Ok(Self { first, second })
    }
}

impl ModuleT for ResidualStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.first.forward_t(xs, train)?;
        self.second.forward_t(&xs, train)
    }
}

/// Bias-free convolution followed by batch norm, no activation.
#[derive(Debug, Clone)]
pub struct BasicConv2d {
    conv: Conv2d,
    bn: BatchNorm,
}

impl BasicConv2d {
    pub fn new(
        in_planes: usize,
        out_planes: usize,
        kernel_size: usize,
        cfg: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("conv_bn");
        let conv = conv2d_no_bias(in_planes, out_planes, kernel_size, cfg, vb.pp("0"))?;
        let bn = candle_nn::batch_norm(out_planes, 1e-5, vb.pp("1"))?;
        Ok(Self { conv, bn })
    }

    pub fn pointwise(in_planes: usize, out_planes: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(in_planes, out_planes, 1, Default::default(), vb)
    }
}

impl ModuleT for BasicConv2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(xs)?, train)
    }
}
