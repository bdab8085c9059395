use candle::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use super::rcab::RcabDecoder;
use super::vit::{VisionTransformer, VitConfig};
use crate::models::layers::SeparableConv2d;

/// Runs a vision transformer on the deepest feature map, fuses its last
/// attention map back in, and hands the result to an [`RcabDecoder`].
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    vit: VisionTransformer,
    lay5: SeparableConv2d,
    lay4: SeparableConv2d,
    decoder: RcabDecoder,
    num_heads: usize,
    span: tracing::Span,
}

impl TransformerDecoder {
    /// `channels` is the width of every input map, `hid_dim` the width handed
    /// to the RCAB decoder, so the two must agree.
    pub fn new(vit_cfg: &VitConfig, channels: usize, hid_dim: usize, vb: VarBuilder) -> Result<Self> {
        if vit_cfg.input_dim != channels {
            candle::bail!(
                "vision transformer reads {} channels but the decoder gets {channels}",
                vit_cfg.input_dim
            )
        }
        if hid_dim != channels {
            candle::bail!("hid_dim {hid_dim} must match the feature width {channels}")
        }
        let vit = VisionTransformer::new(vit_cfg, vb.pp("transformer").pp("vit"))?;
        let fused = vit_cfg.embed_dim + vit_cfg.num_heads;
        let lay5 = SeparableConv2d::new(fused, hid_dim, 3, 1, false, vb.pp("lay5"))?;
        let lay4 = SeparableConv2d::new(hid_dim, hid_dim, 3, 1, false, vb.pp("lay4"))?;
        let decoder = RcabDecoder::new(hid_dim, vb.pp("decoder"))?;
        let span = tracing::span!(tracing::Level::TRACE, "transformer-decoder");
        Ok(Self {
            vit,
            lay5,
            lay4,
            decoder,
            num_heads: vit_cfg.num_heads,
            span,
        })
    }

    pub fn forward_t(&self, features: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let [c1, c2, c3, c4, c5] = features else {
            candle::bail!(
                "transformer decoder expects 5 feature maps, got {}",
                features.len()
            )
        };
        let (feat_enc, attns) = self.vit.forward(c5)?;
        let Some(attn) = attns.last() else {
            candle::bail!("vision transformer returned no attention maps")
        };
        let (b, queries, heads, _) = attn.dims4()?;
        if heads != self.num_heads {
            candle::bail!("expected {} attention heads, got {heads}", self.num_heads)
        }
        let (_, _, h, w) = feat_enc.dims4()?;
        let attn = attn.reshape((b * queries, heads, h, w))?;
        let xs = Tensor::cat(&[&feat_enc, &attn], 1)?;
        let xs = self.lay5.forward_t(&xs, train)?;
        let c5 = self.lay4.forward_t(&xs, train)?;
        let features = [c1.clone(), c2.clone(), c3.clone(), c4.clone(), c5];
        self.decoder.forward_t(&features, train)
    }

    pub fn forward(&self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        self.forward_t(features, false)
    }
}
