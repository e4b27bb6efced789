//! The script pipeline bundles `main.js` with esbuild into `app.js`, with an
//! inline source map, and a minified `app.min.js`.

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::Mode;
use crate::config::{PathEntry, ScriptConfig};
use crate::hash::Digest;
use crate::reload::{Reloader, Signal};
use crate::sink::ErrorSink;
use crate::utils::{as_overhead, write_artifact};

pub const OUTPUT_NAME: &str = "app.js";
pub const DIST_NAME: &str = "app.min.js";

const DIR_CACHE: &str = ".cache/bundle";

/// Errors that can occur when bundling scripts.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// An I/O error occurred during process execution.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't run '{0}'. Is it installed?\n{1}")]
    Spawn(String, std::io::Error),

    /// The Esbuild process returned a non-zero exit code.
    #[error("Esbuild execution failed: {0}")]
    Esbuild(String),

    /// Failed to parse Esbuild output as UTF-8.
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Malformed esbuild metafile: {0}")]
    Metafile(#[from] serde_json::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Output of a bundler run.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub code: String,
    /// Every source file that went into the bundle, absolute.
    pub inputs: Vec<Utf8PathBuf>,
}

/// The tool doing the actual bundling.
pub trait Bundler: Send + Sync {
    fn bundle(&self, entry: &Utf8Path) -> Result<Bundle, ScriptError>;
    fn minify(&self, code: &str) -> Result<String, ScriptError>;
}

/// Bundles through the `esbuild` binary, which has to be available.
#[derive(Debug, Clone)]
pub struct Esbuild {
    pub program: String,
    pub target: String,
    pub jsx: bool,
    pub cache: Utf8PathBuf,
}

impl Esbuild {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            program: config.esbuild.clone(),
            target: config.target.clone(),
            jsx: config.jsx,
            cache: DIR_CACHE.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn check(&self, output: std::process::Output) -> Result<String, ScriptError> {
        if !output.status.success() {
            return Err(ScriptError::Esbuild(String::from_utf8(output.stderr)?));
        }

        Ok(String::from_utf8(output.stdout)?)
    }

    fn spawn_error(&self) -> impl FnOnce(std::io::Error) -> ScriptError + '_ {
        |e| ScriptError::Spawn(self.program.clone(), e)
    }
}

#[derive(Deserialize)]
struct Metafile {
    inputs: std::collections::BTreeMap<String, serde_json::Value>,
}

impl Bundler for Esbuild {
    fn bundle(&self, entry: &Utf8Path) -> Result<Bundle, ScriptError> {
        fs::create_dir_all(&self.cache)?;
        let meta = self
            .cache
            .join(format!("{}.meta.json", Digest::of(entry.as_str())));

        let mut cmd = self.command();
        cmd.arg(entry.as_str())
            .arg("--bundle")
            .arg("--sourcemap=inline")
            .arg(format!("--target={}", self.target))
            .arg(format!("--metafile={meta}"))
            .arg("--log-level=error");

        if self.jsx {
            cmd.arg("--loader:.js=jsx");
        }

        let output = cmd.output().map_err(self.spawn_error())?;
        let code = self.check(output)?;

        let metafile: Metafile = serde_json::from_slice(&fs::read(&meta)?)?;
        let inputs = metafile
            .inputs
            .keys()
            .filter_map(|path| Utf8Path::new(path).canonicalize_utf8().ok())
            .collect();

        Ok(Bundle { code, inputs })
    }

    fn minify(&self, code: &str) -> Result<String, ScriptError> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .arg("--minify")
            .arg("--loader=js")
            .arg("--log-level=error")
            .spawn()
            .map_err(self.spawn_error())?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(code.as_bytes())?;
        }

        self.check(child.wait_with_output()?)
    }
}

/// Paths of the artifacts written by a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptArtifacts {
    pub js: Utf8PathBuf,
    pub min: Utf8PathBuf,
    pub inputs: Vec<Utf8PathBuf>,
}

pub struct ScriptPipeline {
    pub(crate) paths: PathEntry,
    bundler: Arc<dyn Bundler>,
    pub(crate) sink: ErrorSink,
    reload: Reloader,
}

impl ScriptPipeline {
    pub fn new(
        paths: PathEntry,
        bundler: Arc<dyn Bundler>,
        sink: ErrorSink,
        reload: Reloader,
    ) -> Self {
        Self {
            paths,
            bundler,
            sink,
            reload,
        }
    }

    pub fn entry(&self) -> &Utf8Path {
        &self.paths.input
    }

    /// Bundles the entry, writes `app.js`, then minifies what was written into
    /// `app.min.js`.
    pub fn rebundle(&self) -> Result<ScriptArtifacts, ScriptError> {
        let s = Instant::now();
        let bundle = self.bundler.bundle(&self.paths.input)?;

        let js = write_artifact(&self.paths.output, OUTPUT_NAME, &bundle.code)?;
        let code = fs::read_to_string(&js)?;

        let min = self.bundler.minify(&code)?;
        let min = write_artifact(self.paths.dist_dir(), DIST_NAME, min)?;

        tracing::info!("Bundled {js} {}", as_overhead(s));
        self.reload.signal(Signal::Reload);

        Ok(ScriptArtifacts {
            js,
            min,
            inputs: bundle.inputs,
        })
    }

    /// [`rebundle`](Self::rebundle) with failures routed to the error sink.
    pub fn build_once(&self) -> Option<ScriptArtifacts> {
        self.sink.absorb("scripts", self.rebundle())
    }

    /// In [`Mode::Build`] bundles once. In [`Mode::Watch`] keeps rebundling
    /// whenever a file that went into the bundle changes, and never returns
    /// unless the watcher breaks down.
    pub fn build(&self, mode: Mode) -> anyhow::Result<()> {
        match mode {
            Mode::Build => {
                self.build_once();
                Ok(())
            }
            #[cfg(feature = "live")]
            Mode::Watch => match super::session::BundlerSession::new(self)?.run()? {},
            #[cfg(not(feature = "live"))]
            Mode::Watch => {
                tracing::warn!("built without the 'live' feature, bundling once");
                self.build_once();
                Ok(())
            }
        }
    }
}
