//! A narrow SVG cleaner.
//!
//! This is not an optimiser. It only removes the parts of a document that
//! editors tend to leave behind and that browsers never look at.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static RE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("Invalid comment regex"));

static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<title(?:\s[^>]*)?>.*?</title>").expect("Invalid title regex"));

static RE_VIEW_BOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s+viewBox\s*=\s*("[^"]*"|'[^']*')"#).expect("Invalid viewBox regex"));

static RE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s+id\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("Invalid id regex"));

static RE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:url\(\s*['\x22]?#|href\s*=\s*['\x22]#)([^'\x22)\s]+)").expect("Invalid ref regex"));

static RE_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("Invalid whitespace regex"));

/// Whitespace inside these elements is rendered.
static RE_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<text[\s>].*?</text\s*>").expect("Invalid text regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SvgOptions {
    /// Drop the `viewBox` attribute.
    pub remove_view_box: bool,
    /// Drop `id` attributes nothing in the document refers to.
    pub cleanup_ids: bool,
    /// Drop `<title>` elements.
    pub remove_title: bool,
}

impl Default for SvgOptions {
    fn default() -> Self {
        Self {
            remove_view_box: false,
            cleanup_ids: false,
            remove_title: true,
        }
    }
}

pub fn clean(source: &str, options: &SvgOptions) -> String {
    let mut text = RE_COMMENT.replace_all(source, "").into_owned();

    if options.remove_title {
        text = RE_TITLE.replace_all(&text, "").into_owned();
    }

    if options.remove_view_box {
        text = RE_VIEW_BOX.replace_all(&text, "").into_owned();
    }

    if options.cleanup_ids {
        let used: HashSet<String> = RE_REF
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();

        text = RE_ID
            .replace_all(&text, |c: &regex::Captures| {
                let id = c.get(1).or_else(|| c.get(2)).map_or("", |m| m.as_str());
                match used.contains(id) {
                    true => c[0].to_string(),
                    false => String::new(),
                }
            })
            .into_owned();
    }

    collapse_gaps(&text).trim().to_string()
}

/// Drops whitespace between tags, except within `<text>` elements.
fn collapse_gaps(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for m in RE_TEXT.find_iter(text) {
        out.push_str(&RE_GAP.replace_all(&text[last..m.start()], "><"));
        out.push_str(m.as_str());
        last = m.end();
    }

    out.push_str(&RE_GAP.replace_all(&text[last..], "><"));
    out
}
