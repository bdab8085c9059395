//! Candle implementations of the saliency models and their building blocks.
pub mod decoder;
pub mod layers;
pub mod swin;
pub mod swin_rcab_cross;
pub mod swin_saliency;
pub mod with_tracing;
