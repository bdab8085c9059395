//! Channel attention gates and the residual channel attention block.
//!
//! - [`CaLayer`]: squeeze-and-excite style gate with a 1x1 conv bottleneck.
//! - [`EcaLayer`]: efficient channel attention, a depthwise 1-D conv over each
//!   channel's neighbourhood in the pooled descriptor.
//! - [`Rcab`]: two 3x3 convs followed by a [`CaLayer`], plus the input.
//!
//! References:
//! - [RCAN](https://arxiv.org/abs/1807.02758)
//! - [ECA-Net](https://arxiv.org/abs/1910.03151)

use candle::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Conv2dConfig, VarBuilder};

use crate::models::with_tracing::{conv2d, conv2d_no_bias, Conv2d};

fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    xs.mean_keepdim((2, 3))
}

#[derive(Debug, Clone)]
pub struct CaLayer {
    conv_down: Conv2d,
    conv_up: Conv2d,
}

impl CaLayer {
    pub fn new(channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
        if reduction == 0 || channels < reduction {
            candle::bail!("channel attention reduction {reduction} does not fit {channels} channels")
        }
        let vb = vb.pp("conv_du");
        let conv_down = conv2d(
            channels,
            channels / reduction,
            1,
            Default::default(),
            vb.pp("0"),
        )?;
        let conv_up = conv2d(
            channels / reduction,
            channels,
            1,
            Default::default(),
            vb.pp("2"),
        )?;
        Ok(Self { conv_down, conv_up })
    }
}

impl Module for CaLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = global_avg_pool(xs)?;
        let gate = self.conv_down.forward(&gate)?.relu()?;
        let gate = candle_nn::ops::sigmoid(&self.conv_up.forward(&gate)?)?;
        xs.broadcast_mul(&gate)
    }
}

#[derive(Debug, Clone)]
pub struct EcaLayer {
    conv: Conv1d,
    k_size: usize,
}

impl EcaLayer {
    pub fn new(channels: usize, k_size: usize, vb: VarBuilder) -> Result<Self> {
        if k_size % 2 == 0 {
            candle::bail!("eca kernel size must be odd, got {k_size}")
        }
        let cfg = Conv1dConfig {
            groups: channels,
            ..Default::default()
        };
        let conv = candle_nn::conv1d_no_bias(channels, channels, k_size, cfg, vb.pp("conv"))?;
        Ok(Self { conv, k_size })
    }

    /// `(b, c)` pooled descriptor -> `(b, c, k)` sliding windows over the channel axis.
    fn channel_windows(&self, pooled: &Tensor) -> Result<Tensor> {
        let (_, c) = pooled.dims2()?;
        let pad = (self.k_size - 1) / 2;
        let padded = pooled.pad_with_zeros(1, pad, pad)?;
        let windows = (0..self.k_size)
            .map(|j| padded.narrow(1, j, c))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&windows, 2)
    }
}

impl Module for EcaLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let pooled = global_avg_pool(xs)?.reshape((b, c))?;
        let windows = self.channel_windows(&pooled)?;
        // Depthwise: channel i only sees its own window.
        let gate = self.conv.forward(&windows)?;
        let gate = candle_nn::ops::sigmoid(&gate)?.reshape((b, c, 1, 1))?;
        xs.broadcast_mul(&gate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcabConfig {
    pub kernel_size: usize,
    pub reduction: usize,
    pub bias: bool,
}

impl Default for RcabConfig {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            reduction: 16,
            bias: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rcab {
    conv1: Conv2d,
    conv2: Conv2d,
    attention: CaLayer,
    span: tracing::Span,
}

impl Rcab {
    pub fn new(n_feat: usize, vb: VarBuilder) -> Result<Self> {
        Self::new_with_config(n_feat, RcabConfig::default(), vb)
    }

    pub fn new_with_config(n_feat: usize, cfg: RcabConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: cfg.kernel_size / 2,
            ..Default::default()
        };
        let vb = vb.pp("body");
        let make_conv = |vb: VarBuilder| {
            if cfg.bias {
                conv2d(n_feat, n_feat, cfg.kernel_size, conv_cfg, vb)
            } else {
                conv2d_no_bias(n_feat, n_feat, cfg.kernel_size, conv_cfg, vb)
            }
        };
        let conv1 = make_conv(vb.pp("0"))?;
        let conv2 = make_conv(vb.pp("2"))?;
        let attention = CaLayer::new(n_feat, cfg.reduction, vb.pp("3"))?;
        let span = tracing::span!(tracing::Level::TRACE, "rcab");
        Ok(Self {
            conv1,
            conv2,
            attention,
            span,
        })
    }
}

impl Module for Rcab {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let res = self.conv1.forward(xs)?.relu()?;
        let res = self.conv2.forward(&res)?;
        let res = self.attention.forward(&res)?;
        res + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn eca_windows_are_zero_padded() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let eca = EcaLayer::new(4, 3, vb)?;
        let pooled = Tensor::new(&[[1f32, 2., 3., 4.]], &dev)?;
        let windows = eca.channel_windows(&pooled)?;
        assert_eq!(windows.dims(), &[1, 4, 3]);
        assert_eq!(
            windows.squeeze(0)?.to_vec2::<f32>()?,
            &[[0., 1., 2.], [1., 2., 3.], [2., 3., 4.], [3., 4., 0.]]
        );
        Ok(())
    }
}
