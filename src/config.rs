//! Static configuration: where every asset category lives on disk and how
//! each pipeline is tuned.
//!
//! Everything has a default matching the site layout, so `mintkit.toml` is
//! optional. A file only needs to list what differs:
//!
//! ```toml
//! [paths.styles]
//! base = "theme/css"
//! input = "theme/css/main.css"
//! output = "public/css"
//! dist = "public/css/dist"
//!
//! [server]
//! proxy = "localhost:8000"
//! browser = "firefox"
//! ```

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::svg::SvgOptions;

/// The asset categories known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Scripts,
    Styles,
    Images,
}

/// Source and output locations of a single asset category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathEntry {
    /// Root of the source tree, watched for changes.
    #[serde(default)]
    pub base: Option<Utf8PathBuf>,
    /// Entry file, or a glob for categories made of many files.
    pub input: Utf8PathBuf,
    /// Directory receiving the unminified artifacts.
    pub output: Utf8PathBuf,
    /// Directory receiving the minified artifacts.
    #[serde(default)]
    pub dist: Option<Utf8PathBuf>,
}

impl PathEntry {
    fn new(base: &str, input: &str, output: &str, dist: Option<&str>) -> Self {
        Self {
            base: Some(base.into()),
            input: input.into(),
            output: output.into(),
            dist: dist.map(Into::into),
        }
    }

    /// The directory to watch for this category. Falls back to the static
    /// part of the input path when no base is configured.
    pub fn watch_root(&self) -> Utf8PathBuf {
        match &self.base {
            Some(base) => base.clone(),
            None => {
                let (root, suffix) = crate::utils::split_glob(self.input.as_str());
                match suffix.as_str().is_empty() {
                    true => root.parent().map(Utf8Path::to_path_buf).unwrap_or(root),
                    false => root,
                }
            }
        }
    }

    /// Glob matching every file below the watch root.
    pub fn watch_glob(&self) -> String {
        format!("{}/**/*", self.watch_root())
    }

    /// Where minified artifacts go; the output directory when no dist
    /// directory is configured.
    pub fn dist_dir(&self) -> &Utf8Path {
        self.dist.as_deref().unwrap_or(&self.output)
    }

    fn rebase(&self, root: &Utf8Path) -> Self {
        Self {
            base: self.base.as_ref().map(|p| root.join(p)),
            input: root.join(&self.input),
            output: root.join(&self.output),
            dist: self.dist.as_ref().map(|p| root.join(p)),
        }
    }
}

/// Maps every [`Category`] to its locations. Loaded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathRegistry {
    pub scripts: PathEntry,
    pub styles: PathEntry,
    pub images: PathEntry,
}

impl PathRegistry {
    pub fn get(&self, category: Category) -> &PathEntry {
        match category {
            Category::Scripts => &self.scripts,
            Category::Styles => &self.styles,
            Category::Images => &self.images,
        }
    }

    /// Returns a copy of the registry with every path joined onto `root`.
    pub fn rebase(&self, root: &Utf8Path) -> Self {
        Self {
            scripts: self.scripts.rebase(root),
            styles: self.styles.rebase(root),
            images: self.images.rebase(root),
        }
    }
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self {
            scripts: PathEntry::new(
                "assets/js",
                "assets/js/main.js",
                "assets/build/js",
                Some("assets/build/js/dist"),
            ),
            styles: PathEntry::new(
                "assets/css",
                "assets/css/main.css",
                "assets/build/css",
                Some("assets/build/css/dist"),
            ),
            images: PathEntry::new(
                "assets/images",
                "assets/images/**/*",
                "assets/build/images",
                None,
            ),
        }
    }
}

/// Development proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Upstream host the proxy sits in front of.
    pub proxy: String,
    /// Browser to open, `None` for the system default.
    pub browser: Option<String>,
    /// Whether to open a browser at all.
    pub open: bool,
    /// Port of the proxy.
    pub port: u16,
    /// Preferred port of the live reload socket.
    pub reload_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy: "mintclothier.dev".into(),
            browser: Some("google chrome".into()),
            open: true,
            port: 3000,
            reload_port: 1337,
        }
    }
}

/// Minimum browser versions, e.g. `ie = "10"` or `safari = "9.1"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserTargets {
    pub android: Option<String>,
    pub chrome: Option<String>,
    pub edge: Option<String>,
    pub firefox: Option<String>,
    pub ie: Option<String>,
    pub ios_saf: Option<String>,
    pub opera: Option<String>,
    pub safari: Option<String>,
    pub samsung: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StyleConfig {
    /// Targets for lowering modern syntax in `style.css`.
    pub lower: BrowserTargets,
    /// Compatibility baseline of `style.min.css`.
    pub minify: BrowserTargets,
}

impl Default for StyleConfig {
    fn default() -> Self {
        let version = |v: &str| Some(v.to_string());

        Self {
            lower: BrowserTargets {
                android: version("4.4"),
                chrome: version("49"),
                edge: version("13"),
                firefox: version("45"),
                ie: version("11"),
                ios_saf: version("9"),
                safari: version("9"),
                ..BrowserTargets::default()
            },
            minify: BrowserTargets {
                ie: version("10"),
                ..BrowserTargets::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptConfig {
    /// The esbuild executable.
    pub esbuild: String,
    /// Language level the bundle is lowered to.
    pub target: String,
    /// Treat `.js` sources as JSX.
    pub jsx: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            esbuild: "esbuild".into(),
            target: "es2015".into(),
            jsx: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Palette size PNG files are quantized to (2-256).
    pub png_colors: u16,
    /// Re-encode JPEG files at this quality (1-100). Lossy, so off unless
    /// set; JPEG files are copied as they are.
    pub jpeg_quality: Option<u8>,
    pub svg: SvgOptions,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            png_colors: 256,
            jpeg_quality: None,
            svg: SvgOptions::default(),
        }
    }
}

/// Top level configuration, usually read from `mintkit.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathRegistry,
    pub server: ServerConfig,
    pub styles: StyleConfig,
    pub scripts: ScriptConfig,
    pub images: ImageConfig,
}

impl Config {
    /// Loads the configuration from `path`. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(%path, "no config file, using defaults");
            return Ok(Self::default());
        }

        let text =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;

        Self::parse(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_site_layout() {
        let config = Config::default();
        let styles = config.paths.get(Category::Styles);

        assert_eq!(styles.input.as_str(), "assets/css/main.css");
        assert_eq!(styles.dist_dir().as_str(), "assets/build/css/dist");
        assert_eq!(config.paths.images.dist, None);
        assert_eq!(config.paths.images.dist_dir().as_str(), "assets/build/images");
        assert_eq!(config.server.proxy, "mintclothier.dev");
        assert_eq!(config.server.browser.as_deref(), Some("google chrome"));
        assert_eq!(config.styles.minify.ie.as_deref(), Some("10"));
        assert_eq!(config.images.png_colors, 256);
        assert_eq!(config.images.jpeg_quality, None);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [paths.styles]
            input = "theme/main.css"
            output = "public/css"

            [server]
            proxy = "localhost:8000"

            [images]
            jpeg_quality = 85
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.styles.input.as_str(), "theme/main.css");
        assert_eq!(config.paths.styles.base, None);
        assert_eq!(config.paths.styles.dist_dir().as_str(), "public/css");
        // untouched sections keep their defaults
        assert_eq!(config.paths.scripts, PathRegistry::default().scripts);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.proxy, "localhost:8000");
        assert_eq!(config.images.jpeg_quality, Some(85));
        assert_eq!(config.images.png_colors, 256);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(Config::parse("[paths.styles]\ninput = 'a'\noutput = 'b'\nfoo = 1").is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("mintkit.toml");

        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("mintkit.toml");
        fs::write(&path, "[server\nport = 1").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_watch_root() {
        let paths = PathRegistry::default();
        assert_eq!(paths.styles.watch_glob(), "assets/css/**/*");

        let entry = PathEntry {
            base: None,
            input: "assets/images/**/*".into(),
            output: "out".into(),
            dist: None,
        };
        assert_eq!(entry.watch_root().as_str(), "assets/images");

        let entry = PathEntry {
            base: None,
            input: "assets/css/main.css".into(),
            output: "out".into(),
            dist: None,
        };
        assert_eq!(entry.watch_root().as_str(), "assets/css");
    }

    #[test]
    fn test_rebase() {
        let paths = PathRegistry::default().rebase(Utf8Path::new("/site"));
        assert_eq!(paths.scripts.input.as_str(), "/site/assets/js/main.js");
        assert_eq!(paths.images.dist, None);
    }
}
