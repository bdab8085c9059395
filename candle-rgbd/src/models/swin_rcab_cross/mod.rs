//! Swin based RGB-D saliency network with depth refinement and RCAB fusion.
//!
//! The RGB image goes through a Swin encoder whose five feature maps are
//! projected to a common width. A residual depth tower produces matching depth
//! features at strides 4 to 32, and a coarse-to-fine cascade merges both
//! streams with depth refinement blocks and residual channel attention. Five
//! single-channel maps come out, one per cascade step, all at input
//! resolution.
mod config;
mod depth;
mod model;

pub use config::Config;
pub use depth::DepthTower;
pub use model::SwinRcabCross;
