use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2dConfig, VarBuilder};

use crate::models::with_tracing::{conv2d_no_bias, Conv2d};

/// Depthwise + pointwise convolution pair, each followed by batch norm.
///
/// With `relu_first` a single ReLU precedes the depthwise conv, otherwise a
/// ReLU follows each batch norm.
#[derive(Debug, Clone)]
pub struct SeparableConv2d {
    depthwise: Conv2d,
    bn_depth: BatchNorm,
    pointwise: Conv2d,
    bn_point: BatchNorm,
    relu_first: bool,
}

impl SeparableConv2d {
    pub fn new(
        inplanes: usize,
        planes: usize,
        kernel_size: usize,
        dilation: usize,
        relu_first: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("block");
        let cfg = Conv2dConfig {
            padding: dilation * (kernel_size / 2),
            dilation,
            groups: inplanes,
            ..Default::default()
        };
        let depthwise = conv2d_no_bias(inplanes, inplanes, kernel_size, cfg, vb.pp("depthwise"))?;
        let bn_depth = candle_nn::batch_norm(inplanes, 1e-5, vb.pp("bn_depth"))?;
        let pointwise = conv2d_no_bias(inplanes, planes, 1, Default::default(), vb.pp("pointwise"))?;
        let bn_point = candle_nn::batch_norm(planes, 1e-5, vb.pp("bn_point"))?;
        Ok(Self {
            depthwise,
            bn_depth,
            pointwise,
            bn_point,
            relu_first,
        })
    }
}

impl ModuleT for SeparableConv2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.relu_first {
            let xs = self.depthwise.forward(&xs.relu()?)?;
            let xs = self.bn_depth.forward_t(&xs, train)?;
            let xs = self.pointwise.forward(&xs)?;
            self.bn_point.forward_t(&xs, train)
        } else {
            let xs = self.depthwise.forward(xs)?;
            let xs = self.bn_depth.forward_t(&xs, train)?.relu()?;
            let xs = self.pointwise.forward(&xs)?;
            self.bn_point.forward_t(&xs, train)?.relu()
        }
    }
}
