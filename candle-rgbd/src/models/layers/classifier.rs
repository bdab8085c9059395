//! Multi-dilation classifier head.
//!
//! A set of parallel 3x3 convolutions sharing input and output widths, each with
//! its own dilation, whose outputs are summed. With `padding == dilation` every
//! branch preserves the spatial size of its input.

use candle::{Module, Result, Tensor};
use candle_nn::{Conv2dConfig, Init, VarBuilder};

use crate::models::with_tracing::{conv2d_with_init, Conv2d};

/// Dilations (and paddings) used to project encoder features.
pub const PROJECTION_DILATIONS: [usize; 4] = [3, 6, 12, 18];
/// Dilations (and paddings) used by the single-channel prediction heads.
pub const PREDICTION_DILATIONS: [usize; 4] = [6, 12, 18, 24];

#[derive(Debug, Clone)]
pub struct Classifier {
    branches: Vec<Conv2d>,
    span: tracing::Span,
}

impl Classifier {
    /// Builds one branch per `(dilation, padding)` pair. Branch weights are
    /// drawn from `N(0, 0.01)`.
    pub fn new(
        dilations: &[usize],
        paddings: &[usize],
        out_channels: usize,
        in_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if dilations.is_empty() {
            candle::bail!("classifier needs at least one dilation")
        }
        if dilations.len() != paddings.len() {
            candle::bail!(
                "classifier dilations and paddings differ in length ({} <> {})",
                dilations.len(),
                paddings.len()
            )
        }
        let vb = vb.pp("conv2d_list");
        let branches = dilations
            .iter()
            .zip(paddings.iter())
            .enumerate()
            .map(|(i, (&dilation, &padding))| {
                let cfg = Conv2dConfig {
                    padding,
                    dilation,
                    ..Default::default()
                };
                conv2d_with_init(
                    in_channels,
                    out_channels,
                    3,
                    cfg,
                    Init::Randn {
                        mean: 0.,
                        stdev: 0.01,
                    },
                    vb.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "classifier");
        Ok(Self { branches, span })
    }

    /// Same-padding classifier: each branch pads by its own dilation.
    pub fn with_dilations(
        dilations: &[usize],
        out_channels: usize,
        in_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(dilations, dilations, out_channels, in_channels, vb)
    }

    pub fn branches(&self) -> &[Conv2d] {
        &self.branches
    }
}

impl Module for Classifier {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut out = self.branches[0].forward(xs)?;
        for branch in self.branches[1..].iter() {
            out = (out + branch.forward(xs)?)?;
        }
        Ok(out)
    }
}
