use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2dConfig, PReLU, VarBuilder};

use crate::models::with_tracing::{conv2d, Conv2d};

/// Depth refinement block: injects a refined depth feature into an image feature.
///
/// Both inputs share the `(b, dim, h, w)` shape and so does the output. One
/// PReLU slope is shared by every activation of the block.
#[derive(Debug, Clone)]
pub struct Drb {
    conv_refine: Conv2d,
    bn_refine: BatchNorm,
    prelu: PReLU,
    conv_fuse: Conv2d,
    conv_out: Conv2d,
    span: tracing::Span,
}

impl Drb {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        // `conv_refine1`/`bn_refine1` never reach the output, only the second
        // refinement branch is materialized.
        let conv_refine = conv2d(dim, dim, 3, cfg, vb.pp("conv_refine2"))?;
        let bn_refine = candle_nn::batch_norm(dim, 1e-5, vb.pp("bn_refine2"))?;
        let prelu = candle_nn::prelu(None, vb.pp("prelu"))?;
        let conv_fuse = conv2d(dim, dim, 3, cfg, vb.pp("conv_fuse"))?;
        let conv_out = conv2d(dim, dim, 3, cfg, vb.pp("conv_out"))?;
        let span = tracing::span!(tracing::Level::TRACE, "drb");
        Ok(Self {
            conv_refine,
            bn_refine,
            prelu,
            conv_fuse,
            conv_out,
            span,
        })
    }

    pub fn forward_t(&self, img_feat: &Tensor, depth_feat: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let depth = self.conv_refine.forward(depth_feat)?;
        let depth = self.prelu.forward(&self.bn_refine.forward_t(&depth, train)?)?;
        let fused = (img_feat + depth)?;
        let fused_skip = (self.prelu.forward(&self.conv_fuse.forward(&fused)?)? + fused)?;
        self.conv_out.forward(&fused_skip)
    }

    pub fn forward(&self, img_feat: &Tensor, depth_feat: &Tensor) -> Result<Tensor> {
        self.forward_t(img_feat, depth_feat, false)
    }
}
