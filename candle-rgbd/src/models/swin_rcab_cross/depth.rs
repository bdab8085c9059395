use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2dConfig, VarBuilder};

use super::config::Config;
use crate::models::layers::ResidualStage;
use crate::models::with_tracing::{conv2d, Conv2d};

/// Residual tower turning a 3-channel depth map into features at strides 4, 8, 16 and 32.
///
/// All four outputs are `2 * channel_size` wide, matching the fusion stages.
#[derive(Debug, Clone)]
pub struct DepthTower {
    stem: Conv2d,
    stem_1x1: Conv2d,
    layer1_1: ResidualStage,
    layers: [ResidualStage; 4],
    span: tracing::Span,
}

impl DepthTower {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let c = cfg.channel_size;
        let wide = cfg.fusion_channels();
        let stem = conv2d(
            3,
            c / 2,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("depth_conv"),
        )?;
        let stem_1x1 = conv2d(c / 2, c, 1, Default::default(), vb.pp("depth_conv1x1"))?;
        let norm = cfg.depth_norm;
        let layer1_1 = ResidualStage::new(c, c, norm, 2, vb.pp("depth_layer1_1"))?;
        let layers = [
            ResidualStage::new(c, wide, norm, 2, vb.pp("depth_layer1_2"))?,
            ResidualStage::new(wide, wide, norm, 2, vb.pp("depth_layer2"))?,
            ResidualStage::new(wide, wide, norm, 2, vb.pp("depth_layer3"))?,
            ResidualStage::new(wide, wide, norm, 2, vb.pp("depth_layer4"))?,
        ];
        let span = tracing::span!(tracing::Level::TRACE, "depth-tower");
        Ok(Self {
            stem,
            stem_1x1,
            layer1_1,
            layers,
            span,
        })
    }

    /// Returns the depth features from finest (stride 4) to coarsest (stride 32).
    pub fn forward_t(&self, depth: &Tensor, train: bool) -> Result<[Tensor; 4]> {
        let _enter = self.span.enter();
        let xs = self.stem.forward(depth)?.relu()?;
        let xs = self.stem_1x1.forward(&xs)?.relu()?;
        let xs = self.layer1_1.forward_t(&xs, train)?;
        let feat_1 = self.layers[0].forward_t(&xs, train)?;
        let feat_2 = self.layers[1].forward_t(&feat_1, train)?;
        let feat_3 = self.layers[2].forward_t(&feat_2, train)?;
        let feat_4 = self.layers[3].forward_t(&feat_3, train)?;
        Ok([feat_1, feat_2, feat_3, feat_4])
    }
}
