//! RGB-only saliency model: Swin encoder, a 1x1 neck per level, and one of
//! the [`crate::models::decoder`] heads.
use candle::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

use crate::models::decoder::{Decoder, DecoderConfig, DecoderKind};
use crate::models::layers::BasicConv2d;
use crate::models::swin::{SwinConfig, SwinEncoder};

fn default_img_size() -> usize {
    384
}

fn default_decoder() -> DecoderConfig {
    DecoderConfig {
        decoder: DecoderKind::Rcab,
        neck_channel: 128,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    #[serde(default)]
    pub encoder: SwinConfig,
    #[serde(default = "default_decoder")]
    pub decoder: DecoderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            img_size: default_img_size(),
            encoder: SwinConfig::default(),
            decoder: default_decoder(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwinSaliency {
    encoder: SwinEncoder,
    neck: Vec<BasicConv2d>,
    decoder: Decoder,
    span: tracing::Span,
}

impl SwinSaliency {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.decoder.validate()?;
        let encoder = SwinEncoder::new(&cfg.encoder, cfg.img_size, vb.pp("encoder"))?;
        let neck = cfg
            .encoder
            .feature_channels()
            .into_iter()
            .enumerate()
            .map(|(i, channels)| {
                BasicConv2d::pointwise(channels, cfg.decoder.neck_channel, vb.pp(format!("neck.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let decoder = Decoder::new(&cfg.decoder, vb.pp("decoder"))?;
        let span = tracing::span!(tracing::Level::TRACE, "swin-saliency");
        Ok(Self {
            encoder,
            neck,
            decoder,
            span,
        })
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let features = self
            .encoder
            .forward_features(xs)?
            .iter()
            .zip(self.neck.iter())
            .map(|(feat, neck)| neck.forward_t(feat, train))
            .collect::<Result<Vec<_>>>()?;
        self.decoder.forward_t(&features, train)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        self.forward_t(xs, false)
    }
}
