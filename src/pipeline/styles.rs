//! The style pipeline.
//!
//! `main.css` goes through an ordered chain of [`Stage`]s. Each stage takes
//! the whole sheet and hands a new one to the next:
//!
//! 1. [`PartialImports`] inlines local `@import`s.
//! 2. [`Preprocess`] evaluates the sheet as SCSS, which expands nested rules,
//!    substitutes `$variables` and resolves `@if`/`@else` blocks.
//! 3. [`Lowering`] rewrites modern syntax for the configured browsers and
//!    records a source map.
//!
//! The result is written as `style.css` with the map inlined, then minified
//! for a legacy baseline into `style.min.css`.

use std::fs;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use parcel_sourcemap::SourceMap;
use thiserror::Error;

use super::partials::{ImportError, inline_imports};
use crate::config::{BrowserTargets, PathEntry, StyleConfig};
use crate::reload::{Reloader, Signal};
use crate::sink::ErrorSink;
use crate::utils::{as_overhead, write_artifact};

pub const OUTPUT_NAME: &str = "style.css";
pub const DIST_NAME: &str = "style.min.css";

/// Errors that can occur when compiling stylesheets.
#[derive(Debug, Error)]
pub enum StyleError {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Import(#[from] ImportError),

    /// A Sass compilation error occurred.
    #[error("Sass compilation error: {0}")]
    Sass(#[from] Box<grass::Error>),

    #[error("CSS error in '{0}': {1}")]
    Css(String, String),

    #[error("Invalid browser version '{0}'")]
    Target(String),

    #[error("Source map error: {0}")]
    SourceMap(String),
}

/// A stylesheet in flight.
#[derive(Debug, Clone)]
pub struct Sheet {
    /// The file the sheet was read from.
    pub file: Utf8PathBuf,
    pub code: String,
    /// Source map JSON, once a stage produced one.
    pub map: Option<String>,
}

impl Sheet {
    /// The code with its source map appended as a data URL.
    pub fn with_inline_map(&self) -> String {
        match &self.map {
            Some(map) => format!(
                "{}\n/*# sourceMappingURL=data:application/json;charset=utf-8;base64,{} */\n",
                self.code.trim_end(),
                STANDARD.encode(map)
            ),
            None => self.code.clone(),
        }
    }
}

/// One step of the transform chain.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, sheet: Sheet) -> Result<Sheet, StyleError>;
}

pub struct PartialImports;

impl Stage for PartialImports {
    fn name(&self) -> &'static str {
        "imports"
    }

    fn apply(&self, sheet: Sheet) -> Result<Sheet, StyleError> {
        let code = inline_imports(&sheet.file, &sheet.code)?;
        Ok(Sheet { code, ..sheet })
    }
}

pub struct Preprocess;

impl Stage for Preprocess {
    fn name(&self) -> &'static str {
        "preprocess"
    }

    fn apply(&self, sheet: Sheet) -> Result<Sheet, StyleError> {
        let dir = sheet.file.parent().unwrap_or(Utf8Path::new("."));
        let options = grass::Options::default()
            .input_syntax(grass::InputSyntax::Scss)
            .style(grass::OutputStyle::Expanded)
            .load_path(dir.as_std_path());

        let code = grass::from_string(sheet.code.as_str(), &options)?;
        Ok(Sheet { code, ..sheet })
    }
}

pub struct Lowering {
    pub browsers: Browsers,
}

impl Stage for Lowering {
    fn name(&self) -> &'static str {
        "lowering"
    }

    fn apply(&self, sheet: Sheet) -> Result<Sheet, StyleError> {
        let filename = sheet.file.to_string();
        let targets = Targets::from(self.browsers);

        let mut map = SourceMap::new("/");
        map.add_source(&filename);
        map.set_source_content(0, &sheet.code)
            .map_err(|e| StyleError::SourceMap(format!("{e:?}")))?;

        let mut stylesheet = StyleSheet::parse(
            &sheet.code,
            ParserOptions {
                filename: filename.clone(),
                ..ParserOptions::default()
            },
        )
        .map_err(|e| css_error(&filename, e))?;

        stylesheet
            .minify(MinifyOptions {
                targets,
                ..MinifyOptions::default()
            })
            .map_err(|e| css_error(&filename, e))?;

        let result = stylesheet
            .to_css(PrinterOptions {
                minify: false,
                source_map: Some(&mut map),
                targets,
                ..PrinterOptions::default()
            })
            .map_err(|e| css_error(&filename, e))?;

        let map = map
            .to_json(None)
            .map_err(|e| StyleError::SourceMap(format!("{e:?}")))?;

        Ok(Sheet {
            file: sheet.file,
            code: result.code,
            map: Some(map),
        })
    }
}

/// Minifies already lowered CSS for a legacy baseline.
pub fn minify(code: &str, browsers: Browsers) -> Result<String, StyleError> {
    let targets = Targets::from(browsers);

    let mut stylesheet = StyleSheet::parse(
        code,
        ParserOptions {
            filename: DIST_NAME.into(),
            ..ParserOptions::default()
        },
    )
    .map_err(|e| css_error(DIST_NAME, e))?;

    stylesheet
        .minify(MinifyOptions {
            targets,
            ..MinifyOptions::default()
        })
        .map_err(|e| css_error(DIST_NAME, e))?;

    let result = stylesheet
        .to_css(PrinterOptions {
            minify: true,
            targets,
            ..PrinterOptions::default()
        })
        .map_err(|e| css_error(DIST_NAME, e))?;

    Ok(result.code)
}

fn css_error(file: &str, e: impl std::fmt::Display) -> StyleError {
    StyleError::Css(file.to_string(), e.to_string())
}

/// Converts configured versions like `"9.1"` into the packed
/// `major << 16 | minor << 8 | patch` form lightningcss expects.
pub fn browsers(targets: &BrowserTargets) -> Result<Browsers, StyleError> {
    let parse = |version: &Option<String>| -> Result<Option<u32>, StyleError> {
        let Some(version) = version else {
            return Ok(None);
        };

        let mut packed = 0;
        let mut parts = version.split('.');
        for shift in [16, 8, 0] {
            let Some(part) = parts.next() else { break };
            let value: u32 = part
                .trim()
                .parse()
                .map_err(|_| StyleError::Target(version.clone()))?;
            if value > 0xff && shift != 16 {
                return Err(StyleError::Target(version.clone()));
            }
            packed |= value << shift;
        }

        if parts.next().is_some() {
            return Err(StyleError::Target(version.clone()));
        }

        Ok(Some(packed))
    };

    Ok(Browsers {
        android: parse(&targets.android)?,
        chrome: parse(&targets.chrome)?,
        edge: parse(&targets.edge)?,
        firefox: parse(&targets.firefox)?,
        ie: parse(&targets.ie)?,
        ios_saf: parse(&targets.ios_saf)?,
        opera: parse(&targets.opera)?,
        safari: parse(&targets.safari)?,
        samsung: parse(&targets.samsung)?,
    })
}

/// Paths of the artifacts written by a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleArtifacts {
    pub css: Utf8PathBuf,
    pub min: Utf8PathBuf,
}

pub struct StylePipeline {
    paths: PathEntry,
    config: StyleConfig,
    sink: ErrorSink,
    reload: Reloader,
}

impl StylePipeline {
    pub fn new(paths: PathEntry, config: StyleConfig, sink: ErrorSink, reload: Reloader) -> Self {
        Self {
            paths,
            config,
            sink,
            reload,
        }
    }

    /// The transform chain, in order.
    pub fn stages(&self) -> Result<Vec<Box<dyn Stage>>, StyleError> {
        Ok(vec![
            Box::new(PartialImports),
            Box::new(Preprocess),
            Box::new(Lowering {
                browsers: browsers(&self.config.lower)?,
            }),
        ])
    }

    /// Compiles the root stylesheet from scratch and writes both artifacts.
    pub fn run(&self) -> Result<StyleArtifacts, StyleError> {
        let s = Instant::now();
        let file = self.paths.input.clone();
        let code = fs::read_to_string(&file)?;

        let mut sheet = Sheet {
            file,
            code,
            map: None,
        };

        for stage in self.stages()? {
            let t = Instant::now();
            sheet = stage.apply(sheet)?;
            tracing::debug!(stage = stage.name(), "done {}", as_overhead(t));
        }

        let css = write_artifact(&self.paths.output, OUTPUT_NAME, sheet.with_inline_map())?;

        let min = minify(&sheet.code, browsers(&self.config.minify)?)?;
        let min = write_artifact(self.paths.dist_dir(), DIST_NAME, min)?;

        tracing::info!("Compiled {css} {}", as_overhead(s));

        Ok(StyleArtifacts { css, min })
    }

    /// Runs the pipeline with failures routed to the error sink. Connected
    /// browsers swap their stylesheets on success.
    pub fn trigger(&self) -> Option<StyleArtifacts> {
        let artifacts = self.sink.absorb("styles", self.run())?;
        self.reload.signal(Signal::Css);
        Some(artifacts)
    }
}
