use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use thiserror::Error;

static RE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?["']([^"']+)["']\s*\)?([^;]*);"#)
        .expect("Invalid import regex")
});

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Couldn't read stylesheet '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't find partial '{name}' imported from '{from}'")]
    NotFound { name: String, from: Utf8PathBuf },

    #[error("Stylesheet '{0}' imports itself")]
    Cycle(Utf8PathBuf),
}

/// Inlines the local `@import`s of `code`, which was read from `file`.
///
/// Remote imports and imports carrying a media query are kept as they are.
pub(crate) fn inline_imports(file: &Utf8Path, code: &str) -> Result<String, ImportError> {
    let mut stack = vec![canonical(file)?];
    inline(file, code, &mut stack)
}

fn inline(file: &Utf8Path, code: &str, stack: &mut Vec<Utf8PathBuf>) -> Result<String, ImportError> {
    let dir = file.parent().unwrap_or(Utf8Path::new(""));
    let mut out = String::with_capacity(code.len());
    let mut last = 0;

    for caps in RE_IMPORT.captures_iter(code) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        let media = caps.get(2).map_or("", |m| m.as_str()).trim();
        if is_remote(name.as_str()) || !media.is_empty() {
            continue;
        }

        let path = resolve(dir, name.as_str()).ok_or_else(|| ImportError::NotFound {
            name: name.as_str().to_string(),
            from: file.to_path_buf(),
        })?;

        let key = canonical(&path)?;
        if stack.contains(&key) {
            return Err(ImportError::Cycle(path));
        }

        let text = fs::read_to_string(&path).map_err(|source| ImportError::Io {
            path: path.clone(),
            source,
        })?;

        stack.push(key);
        let text = inline(&path, &text, stack)?;
        stack.pop();

        out.push_str(&code[last..whole.start()]);
        out.push_str(&text);
        last = whole.end();
    }

    out.push_str(&code[last..]);
    Ok(out)
}

fn is_remote(name: &str) -> bool {
    name.starts_with("http:") || name.starts_with("https:") || name.starts_with("//")
}

/// Tries `name`, `name.css`, `_name` and `_name.css` next to the importing
/// file.
fn resolve(dir: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let name = Utf8Path::new(name);
    let parent = name.parent().unwrap_or(Utf8Path::new(""));
    let stem = name.file_name()?;

    [
        stem.to_string(),
        format!("{stem}.css"),
        format!("_{stem}"),
        format!("_{stem}.css"),
    ]
    .into_iter()
    .map(|candidate| dir.join(parent).join(candidate))
    .find(|path| path.is_file())
}

fn canonical(path: &Utf8Path) -> Result<Utf8PathBuf, ImportError> {
    path.canonicalize_utf8().map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        fs::create_dir_all(root.join("css/components")).unwrap();
        (dir, root)
    }

    fn main(root: &Utf8Path, code: &str) -> Utf8PathBuf {
        let path = root.join("css/main.css");
        fs::write(&path, code).unwrap();
        path
    }

    #[test]
    fn test_partial_conventions() {
        let (_guard, root) = site();
        fs::write(root.join("css/_vars.css"), "$brand: teal;").unwrap();
        fs::write(root.join("css/reset.css"), "* { margin: 0; }").unwrap();
        fs::write(
            root.join("css/components/_nav.css"),
            "@import 'icons';\n.nav { color: $brand; }",
        )
        .unwrap();
        fs::write(root.join("css/components/icons"), ".icon {}").unwrap();

        let code = "@import \"vars\";\n@import url('reset.css');\n@import \"components/nav\";\n";
        let out = inline_imports(&main(&root, code), code).unwrap();

        assert_eq!(
            out,
            "$brand: teal;\n* { margin: 0; }\n.icon {}\n.nav { color: $brand; }\n"
        );
    }

    #[test]
    fn test_remote_and_media_imports_are_kept() {
        let (_guard, root) = site();
        fs::write(root.join("css/print.css"), ".x {}").unwrap();

        let code = "@import url(\"https://fonts.example/css\");\n@import \"print.css\" print;\n";
        let out = inline_imports(&main(&root, code), code).unwrap();

        assert_eq!(out, code);
    }

    #[test]
    fn test_missing_partial() {
        let (_guard, root) = site();
        let code = "@import 'nope';";
        let err = inline_imports(&main(&root, code), code).unwrap_err();

        assert!(matches!(err, ImportError::NotFound { name, .. } if name == "nope"));
    }

    #[test]
    fn test_cycle() {
        let (_guard, root) = site();
        fs::write(root.join("css/_a.css"), "@import 'b';").unwrap();
        fs::write(root.join("css/_b.css"), "@import 'a';").unwrap();

        let code = "@import 'a';";
        let err = inline_imports(&main(&root, code), code).unwrap_err();
        assert!(matches!(err, ImportError::Cycle(_)));
    }
}
