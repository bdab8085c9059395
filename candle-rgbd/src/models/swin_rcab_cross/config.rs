//! Configuration of the RGB-D fusion network.

use std::path::PathBuf;

use serde::Deserialize;

use crate::models::layers::NormKind;
use crate::models::swin::SwinConfig;

fn default_img_size() -> usize {
    384
}

fn default_channel_size() -> usize {
    128
}

/// Main configuration for [`super::SwinRcabCross`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Nominal square input size.
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    /// Width every encoder level is projected to; fusion stages run at twice
    /// this width.
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    #[serde(default)]
    pub encoder: SwinConfig,
    /// Normalization used by the residual blocks of the depth tower.
    #[serde(default)]
    pub depth_norm: NormKind,
    /// Optional pretrained backbone checkpoint, merged by key intersection.
    #[serde(default)]
    pub pretrain: Option<PathBuf>,
}

impl Config {
    pub fn swin_b_384() -> Self {
        Self {
            img_size: 384,
            channel_size: 128,
            encoder: SwinConfig::base_384(),
            depth_norm: NormKind::Batch,
            pretrain: None,
        }
    }

    /// Width of the concatenated features in every fusion stage.
    pub fn fusion_channels(&self) -> usize {
        self.channel_size * 2
    }

    pub fn validate(&self) -> candle::Result<()> {
        self.encoder.validate()?;
        if self.encoder.depths.len() != 4 {
            candle::bail!(
                "the fusion cascade needs a four stage encoder, got {} stages",
                self.encoder.depths.len()
            )
        }
        let stride = self.encoder.max_stride();
        if self.img_size == 0 || self.img_size % stride != 0 {
            candle::bail!(
                "img_size {} is not a multiple of the encoder stride {stride}",
                self.img_size
            )
        }
        if self.channel_size < 16 || self.channel_size % 8 != 0 {
            candle::bail!(
                "channel_size must be a multiple of 8 and at least 16, got {}",
                self.channel_size
            )
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::swin_b_384()
    }
}
