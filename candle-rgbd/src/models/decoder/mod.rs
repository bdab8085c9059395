//! Saliency decoders working on a five level, fixed width feature pyramid.
//!
//! Two kinds are available: `rcab`, a coarse-to-fine residual channel
//! attention cascade, and `trans`, which first refines the deepest level with
//! a small vision transformer. The kind is picked by name in [`DecoderConfig`]
//! and resolved when the configuration is parsed.
mod rcab;
mod transformer;
mod vit;

pub use rcab::RcabDecoder;
pub use transformer::TransformerDecoder;
pub use vit::{VisionTransformer, VitConfig};

use candle::{Result, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

use crate::models::layers::RcabConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DecoderKind {
    Rcab,
    Trans,
}

impl std::str::FromStr for DecoderKind {
    type Err = candle::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rcab" => Ok(Self::Rcab),
            "trans" => Ok(Self::Trans),
            _ => Err(candle::Error::Msg(format!(
                "unknown decoder '{s}', expected `rcab` or `trans`"
            ))),
        }
    }
}

impl TryFrom<String> for DecoderKind {
    type Error = candle::Error;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl DecoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rcab => "rcab",
            Self::Trans => "trans",
        }
    }
}

impl std::fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DecoderConfig {
    pub decoder: DecoderKind,
    pub neck_channel: usize,
}

impl DecoderConfig {
    /// Settings of the vision transformer used by the `trans` decoder.
    pub fn vit_config(&self) -> VitConfig {
        VitConfig {
            input_dim: self.neck_channel,
            embed_dim: self.neck_channel,
            depth: 4,
            num_heads: 4,
            mlp_ratio: 3.0,
            decoder_feat_hw: 12 * 12,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.neck_channel == 0 {
            candle::bail!("neck_channel must be positive")
        }
        let reduction = RcabConfig::default().reduction;
        if 2 * self.neck_channel < reduction {
            candle::bail!(
                "neck_channel {} is too narrow for a channel reduction of {reduction}",
                self.neck_channel
            )
        }
        if self.decoder == DecoderKind::Trans {
            self.vit_config().validate()?;
        }
        Ok(())
    }
}

/// A decoder picked from a [`DecoderConfig`].
#[derive(Debug, Clone)]
pub enum Decoder {
    Rcab(RcabDecoder),
    Trans(TransformerDecoder),
}

impl Decoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let decoder = match cfg.decoder {
            DecoderKind::Rcab => Self::Rcab(RcabDecoder::new(cfg.neck_channel, vb)?),
            DecoderKind::Trans => Self::Trans(TransformerDecoder::new(
                &cfg.vit_config(),
                cfg.neck_channel,
                cfg.neck_channel,
                vb,
            )?),
        };
        Ok(decoder)
    }

    pub fn kind(&self) -> DecoderKind {
        match self {
            Self::Rcab(_) => DecoderKind::Rcab,
            Self::Trans(_) => DecoderKind::Trans,
        }
    }

    pub fn forward_t(&self, features: &[Tensor], train: bool) -> Result<Vec<Tensor>> {
        match self {
            Self::Rcab(decoder) => decoder.forward_t(features, train),
            Self::Trans(decoder) => decoder.forward_t(features, train),
        }
    }

    pub fn forward(&self, features: &[Tensor]) -> Result<Vec<Tensor>> {
        self.forward_t(features, false)
    }
}
