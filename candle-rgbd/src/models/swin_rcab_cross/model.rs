use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use super::config::Config;
use super::depth::DepthTower;
use crate::checkpoint;
use crate::models::layers::{
    merge_carried, upsample, Classifier, Drb, FusionStage, PREDICTION_DILATIONS,
    PROJECTION_DILATIONS,
};
use crate::models::swin::SwinEncoder;

/// RGB-D fusion network: Swin encoder, depth tower and an RCAB/DRB cascade.
///
/// `forward` returns five single-channel maps at input resolution, from the
/// coarsest supervision (stride 32, no depth) to the finest (stride 4).
#[derive(Debug, Clone)]
pub struct SwinRcabCross {
    encoder: SwinEncoder,
    depth: DepthTower,
    /// Per-level projections, finest (`conv1`) first.
    projections: [Classifier; 5],
    /// Prediction straight from the deepest projection.
    coarse: Classifier,
    /// DRB for each cascade step, coarsest first, paired with `stages`.
    drbs: [Drb; 4],
    stages: [FusionStage; 4],
    config: Config,
    span: tracing::Span,
}

impl SwinRcabCross {
    pub fn new(config: Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let c = config.channel_size;
        let wide = config.fusion_channels();

        let encoder = SwinEncoder::new(&config.encoder, config.img_size, vb.pp("encoder"))?;
        let depth = DepthTower::new(&config, vb.clone())?;

        let widths = config.encoder.feature_channels();
        let projection = |i: usize| {
            Classifier::with_dilations(
                &PROJECTION_DILATIONS,
                c,
                widths[i],
                vb.pp(format!("conv{}", i + 1)),
            )
        };
        let projections = [
            projection(0)?,
            projection(1)?,
            projection(2)?,
            projection(3)?,
            projection(4)?,
        ];
        let coarse = Classifier::with_dilations(&PREDICTION_DILATIONS, 1, c, vb.pp("layer9"))?;

        // Parameter names match the released checkpoints, including the
        // `racb` spelling and the reversed numbering of the fusion modules.
        let stage = |racb: usize, layer: usize, scale: usize, reformat: bool| {
            FusionStage::new(
                wide,
                reformat.then_some(c),
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
        let drbs = [
            Drb::new(wide, vb.pp("drb4"))?,
            Drb::new(wide, vb.pp("drb3"))?,
            Drb::new(wide, vb.pp("drb2"))?,
            Drb::new(wide, vb.pp("drb1"))?,
        ];
        let span = tracing::span!(tracing::Level::TRACE, "swin-rcab-cross");
        Ok(Self {
            encoder,
            depth,
            projections,
            coarse,
            drbs,
            stages,
            config,
            span,
        })
    }

    /// Builds a trainable model backed by `varmap`, then merges the pretrained
    /// backbone from `config.pretrain` when set.
    pub fn new_trainable(
        config: Config,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let pretrain = config.pretrain.clone();
        let vb = VarBuilder::from_varmap(varmap, dtype, device);
        let model = Self::new(config, vb)?;
        if let Some(path) = pretrain {
            tracing::info!("loading pretrained backbone from {}", path.display());
            let tensors = checkpoint::read_tensors(&path, device)?;
            checkpoint::load_matching(varmap, "encoder", tensors)?;
        }
        Ok(model)
    }

    /// Loads every parameter, encoder included, from safetensors files.
    pub fn load<P: AsRef<std::path::Path>>(
        config: Config,
        paths: &[P],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        Self::new(config, vb)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn encoder(&self) -> &SwinEncoder {
        &self.encoder
    }

    pub fn forward_t(&self, rgb: &Tensor, depth: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let (_, _, h, w) = rgb.dims4()?;
        let (_, _, dh, dw) = depth.dims4()?;
        if (h, w) != (dh, dw) {
            candle::bail!("rgb is {h}x{w} but depth is {dh}x{dw}")
        }

        // Finest first.
        let depth_feats = self.depth.forward_t(depth, train)?;
        let features = self.encoder.forward_features(rgb)?;
        if features.len() != self.projections.len() {
            candle::bail!(
                "expected {} encoder levels, got {}",
                self.projections.len(),
                features.len()
            )
        }
        let xs = self
            .projections
            .iter()
            .zip(features.iter())
            .map(|(proj, feat)| proj.forward(feat))
            .collect::<Result<Vec<_>>>()?;

        let mut outputs = Vec::with_capacity(5);
        outputs.push(upsample(&self.coarse.forward(&xs[4])?, 32)?);

        // x4 and x5 share stride 32, so the first step concatenates without upsampling.
        let mut fused = Tensor::cat(&[&xs[3], &xs[4]], 1)?;
        for (step, (drb, stage)) in self.drbs.iter().zip(self.stages.iter()).enumerate() {
            let depth_feat = &depth_feats[3 - step];
            let fused_depth = drb.forward_t(&fused, depth_feat, train)?;
            let (prediction, carried) = stage.forward_t(&fused_depth, train)?;
            outputs.push(prediction);
            if let Some(carried) = carried {
                fused = merge_carried(&xs[2 - step], &carried)?;
            }
        }
        Ok(outputs)
    }

    /// Inference-mode forward pass.
    pub fn forward(&self, rgb: &Tensor, depth: &Tensor) -> Result<Vec<Tensor>> {
        self.forward_t(rgb, depth, false)
    }
}
