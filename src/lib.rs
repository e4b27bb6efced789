#![forbid(unsafe_code)]
//! Front-end asset pipeline for a WordPress theme.
//!
//! Three pipelines turn sources under `assets/` into browser artifacts under
//! `dist/`: stylesheets are flattened, compiled and minified, scripts are
//! bundled with esbuild, images are recompressed. An [`Orchestrator`] wires
//! them into a [`TaskGraph`], and its `default` task keeps everything rebuilt
//! while a development proxy reloads the browser.
//!
//! The [`intro`] module plans the logo entrance animation the theme plays on
//! page load.

pub mod config;
pub mod error;
pub mod graph;
mod hash;
pub mod intro;
pub mod orchestrator;
pub mod pipeline;
pub mod reload;
#[cfg(feature = "server")]
pub mod server;
pub mod sink;
pub mod utils;
#[cfg(feature = "live")]
pub mod watch;

pub use crate::config::Config;
pub use crate::error::*;
pub use crate::graph::{TaskContext, TaskGraph};
pub use crate::orchestrator::Orchestrator;
pub use crate::sink::ErrorSink;

/// Whether a pipeline runs once and stops, or keeps watching its inputs. In
/// `Watch` mode the script pipeline opens a bundler session that rebundles
/// whenever one of the files reachable from the entry point changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Build once.
    Build,
    /// Build, then rebuild on every change.
    Watch,
}
