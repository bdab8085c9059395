//! Building blocks shared by the RGB-D fusion network and the decoders.

mod attention;
mod classifier;
mod drb;
mod edge;
mod fusion;
mod residual;
mod separable;

pub use attention::{CaLayer, EcaLayer, Rcab, RcabConfig};
pub use classifier::{Classifier, PREDICTION_DILATIONS, PROJECTION_DILATIONS};
pub use drb::Drb;
pub use edge::{Aspp, EdgeModule};
pub use fusion::{merge_carried, FusionStage};
pub use residual::{instance_norm, BasicConv2d, Norm2d, NormKind, ResidualBlock, ResidualStage};
pub use separable::SeparableConv2d;

use candle::{Result, Tensor};

/// Bilinear upsampling by an integer factor with `align_corners = true`.
pub fn upsample(xs: &Tensor, factor: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    xs.upsample_bilinear2d(h * factor, w * factor, true)
}
