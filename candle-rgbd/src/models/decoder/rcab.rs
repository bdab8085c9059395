use candle::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::models::layers::{merge_carried, upsample, Classifier, FusionStage, PREDICTION_DILATIONS};

/// Coarse-to-fine RCAB cascade over five `neck_channel` wide feature maps.
///
/// The same topology as the RGB-D network without the depth refinement:
/// the two stride-32 levels are concatenated first, then every finer level
/// joins the carried feature upsampled by two.
#[derive(Debug, Clone)]
pub struct RcabDecoder {
    coarse: Classifier,
    stages: [FusionStage; 4],
    neck_channel: usize,
    span: tracing::Span,
}

impl RcabDecoder {
    pub fn new(neck_channel: usize, vb: VarBuilder) -> Result<Self> {
        let wide = 2 * neck_channel;
        let coarse =
            Classifier::with_dilations(&PREDICTION_DILATIONS, 1, neck_channel, vb.pp("layer9"))?;
        let stage = |racb: usize, layer: usize, scale: usize, reformat: bool| {
            FusionStage::new(
                wide,
                reformat.then_some(neck_channel),
                scale,
                vb.pp(format!("racb_{racb}")),
                vb.pp(format!("layer{layer}")),
                vb.pp(format!("conv_reformat_{racb}")),
            )
        };
        let stages = [
            stage(2, 8, 32, true)?,
            stage(3, 7, 16, true)?,
            stage(4, 6, 8, true)?,
            stage(5, 5, 4, false)?,
        ];
        let span = tracing::span!(tracing::Level::TRACE, "rcab-decoder");
        Ok(Self {
            coarse,
            stages,
            neck_channel,
            span,
        })
    }

    pub fn neck_channel(&self) -> usize {
        self.neck_channel
    }

    /// `features` holds five maps at strides 4, 8, 16, 32 and 32, finest first.
    /// Returns five single-channel maps at input resolution, coarsest first.
    pub fn forward_t(&self, features: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let [c1, c2, c3, c4, c5] = features else {
            candle::bail!("rcab decoder expects 5 feature maps, got {}", features.len())
        };
        for feat in features.iter() {
            let channels = feat.dim(1)?;
            if channels != self.neck_channel {
                candle::bail!(
                    "rcab decoder expects {} channels, got {channels}",
                    self.neck_channel
                )
            }
        }

        let mut outputs = Vec::with_capacity(5);
        outputs.push(upsample(&self.coarse.forward(c5)?, 32)?);
        let finer = [c3, c2, c1];
        let mut fused = Tensor::cat(&[c4, c5], 1)?;
        for (step, stage) in self.stages.iter().enumerate() {
            let (prediction, carried) = stage.forward_t(&fused, train)?;
            outputs.push(prediction);
            if let Some(carried) = carried {
                fused = merge_carried(finer[step], &carried)?;
            }
        }
        Ok(outputs)
    }

    pub fn forward(&self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        self.forward_t(features, false)
    }
}
