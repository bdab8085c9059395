use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::Rcab;
use super::classifier::{Classifier, PREDICTION_DILATIONS};
use super::residual::BasicConv2d;
use super::upsample;

/// One step of the coarse-to-fine cascade.
///
/// Gates the fused feature with an [`Rcab`], predicts a single-channel map
/// upsampled by `scale`, and optionally squeezes the gated feature back to the
/// per-level width so the next (finer) step can carry it.
#[derive(Debug, Clone)]
pub struct FusionStage {
    rcab: Rcab,
    predict: Classifier,
    reformat: Option<BasicConv2d>,
    scale: usize,
}

impl FusionStage {
    pub fn new(
        fused_channels: usize,
        carried_channels: Option<usize>,
        scale: usize,
        vb_rcab: VarBuilder,
        vb_predict: VarBuilder,
        vb_reformat: VarBuilder,
    ) -> Result<Self> {
        let rcab = Rcab::new(fused_channels, vb_rcab)?;
        let predict =
            Classifier::with_dilations(&PREDICTION_DILATIONS, 1, fused_channels, vb_predict)?;
        let reformat = match carried_channels {
            Some(out) => Some(BasicConv2d::pointwise(fused_channels, out, vb_reformat)?),
            None => None,
        };
        Ok(Self {
            rcab,
            predict,
            reformat,
            scale,
        })
    }

    /// Returns the full-resolution prediction and the feature carried to the next stage.
    pub fn forward_t(&self, fused: &Tensor, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let gated = self.rcab.forward(fused)?;
        let prediction = upsample(&self.predict.forward(&gated)?, self.scale)?;
        let carried = match &self.reformat {
            Some(reformat) => Some(reformat.forward_t(&gated, train)?),
            None => None,
        };
        Ok((prediction, carried))
    }
}

/// Concatenates a level feature with the carried feature upsampled by two.
pub fn merge_carried(level: &Tensor, carried: &Tensor) -> Result<Tensor> {
    Tensor::cat(&[level, &upsample(carried, 2)?], 1)
}
