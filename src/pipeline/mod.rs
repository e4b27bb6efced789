//! The asset pipelines, one per [`Category`](crate::config::Category).

pub mod images;
mod partials;
pub mod scripts;
#[cfg(feature = "live")]
pub mod session;
pub mod styles;
pub mod svg;

pub use images::{ImageError, ImagePipeline, ImageReport};
pub use partials::ImportError;
pub use scripts::{Bundle, Bundler, Esbuild, ScriptError, ScriptPipeline};
pub use styles::{StyleError, StylePipeline};
