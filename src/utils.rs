use std::fmt::Display;
use std::fs;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const ANSI_BLUE: Style = Style::new().blue();

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed}] {span_name} {msg}")
        .expect("Error setting progress bar template")
});

/// Installs the global `tracing` subscriber. Log lines are routed through the
/// indicatif writer so they don't tear the progress spinners apart.
pub fn init_logging() -> anyhow::Result<()> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}

pub(crate) fn task_style() -> ProgressStyle {
    TASK_STYLE.clone()
}

pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Writes `data` to `dir/name`, creating the directory when needed. Existing
/// files are overwritten.
pub(crate) fn write_artifact(
    dir: &Utf8Path,
    name: impl AsRef<Utf8Path>,
    data: impl AsRef<[u8]>,
) -> std::io::Result<Utf8PathBuf> {
    let path = dir.join(name);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&path, data)?;

    Ok(path)
}

/// Splits a glob into its static root and the dynamic suffix starting at the
/// first component holding a wildcard.
///
/// `assets/images/**/*` becomes `("assets/images", "**/*")`.
pub fn split_glob(glob: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    let path = Utf8Path::new(glob);
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix: Utf8PathBuf = components.iter().skip(split_idx).collect();

    (root, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_glob_wildcard() {
        let (root, suffix) = split_glob("assets/images/**/*");
        assert_eq!(root.as_str(), "assets/images");
        assert_eq!(suffix.as_str(), "**/*");
    }

    #[test]
    fn test_split_glob_concrete() {
        let (root, suffix) = split_glob("assets/css/main.css");
        assert_eq!(root.as_str(), "assets/css/main.css");
        assert_eq!(suffix.as_str(), "");
    }

    #[test]
    fn test_split_glob_wildcard_in_name() {
        let (root, suffix) = split_glob("assets/images/*.png");
        assert_eq!(root.as_str(), "assets/images");
        assert_eq!(suffix.as_str(), "*.png");
    }

    #[test]
    fn test_write_artifact_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let path = write_artifact(&dir.join("build/js"), "app.js", "1").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");

        // overwrite in place
        write_artifact(&dir.join("build/js"), "app.js", "2").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2");
    }
}
