//! Salient object prediction models for RGB and RGB-D inputs, built on candle.
//!
//! - [`models::swin_rcab_cross::SwinRcabCross`]: Swin encoder and depth tower
//!   fused by depth refinement and residual channel attention blocks.
//! - [`models::swin_saliency::SwinSaliency`]: Swin encoder with a selectable
//!   [`models::decoder::Decoder`] head.
//!
//! Weights are read through `candle_nn::VarBuilder`, using the parameter names
//! of the reference PyTorch checkpoints. [`checkpoint`] merges a pretrained
//! backbone into a freshly initialized `VarMap`.
pub mod checkpoint;
pub mod models;
