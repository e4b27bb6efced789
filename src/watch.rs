//! File system watches.
//!
//! A [`WatchRegistration`] pairs a set of globs with the name of the task
//! they trigger. Starting it splits every glob into a static root, which is
//! watched recursively, and an absolute pattern, which filters the events
//! coming back. Roots nested inside other roots are collapsed, so every
//! directory is watched once.
//!
//! An [`ActiveWatch`] owns its own debounced event channel. Its loop handles
//! one batch at a time, so invocations of the triggered task never overlap.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use camino::Utf8PathBuf;
use glob::Pattern;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache};

use crate::error::WatchError;
use crate::graph::TaskGraph;

pub(crate) const DEBOUNCE: Duration = Duration::from_millis(250);

/// Globs to watch and the task to run when anything matching them changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub patterns: Vec<String>,
    pub task: String,
}

impl WatchRegistration {
    pub fn new(
        patterns: impl IntoIterator<Item = impl Into<String>>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            task: task.into(),
        }
    }

    /// Registers the OS level watches. Once this returns, every change below
    /// the watched roots is queued, even if nobody consumes the events yet.
    pub fn start(&self) -> Result<ActiveWatch, WatchError> {
        let mut roots = HashSet::new();
        let mut filters = Vec::new();

        for glob in &self.patterns {
            let (root, pattern) = resolve_watch_path(glob)?;
            roots.insert(root);
            filters.push(pattern);
        }

        let roots = collapse_watch_paths(roots);

        let (tx, rx) = channel();
        let mut debouncer = notify_debouncer_full::new_debouncer(DEBOUNCE, None, tx)?;

        for root in &roots {
            tracing::info!(task = %self.task, "watching {root}");
            debouncer.watch(root, RecursiveMode::Recursive)?;
        }

        Ok(ActiveWatch {
            task: self.task.clone(),
            roots,
            filters,
            rx,
            _debouncer: debouncer,
        })
    }
}

pub struct ActiveWatch {
    task: String,
    roots: Vec<Utf8PathBuf>,
    filters: Vec<Pattern>,
    rx: Receiver<DebounceEventResult>,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl ActiveWatch {
    /// Absolute directories being watched.
    pub fn roots(&self) -> &[Utf8PathBuf] {
        &self.roots
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Blocks until the next batch of events and returns the changed paths
    /// matching the registration. The result may be empty when the batch held
    /// nothing relevant.
    pub fn changes(&self) -> Result<Vec<Utf8PathBuf>, WatchError> {
        match self.rx.recv() {
            Ok(Ok(events)) => Ok(matching_paths(&events, &self.filters)),
            Ok(Err(errors)) => {
                for e in errors {
                    tracing::error!(task = %self.task, "watch error: {e}");
                }
                Ok(Vec::new())
            }
            Err(_) => Err(WatchError::Closed),
        }
    }

    /// Runs the registered task for every relevant batch of changes. A failing
    /// run is logged and the watch carries on.
    pub fn run(self, graph: &TaskGraph) -> Result<Infallible, WatchError> {
        loop {
            let changed = self.changes()?;
            if changed.is_empty() {
                continue;
            }

            tracing::info!(task = %self.task, "{} file(s) changed", changed.len());
            for path in &changed {
                tracing::debug!(task = %self.task, "changed {path}");
            }

            if let Err(e) = graph.run(&self.task) {
                tracing::error!("{e}");
            }
        }
    }
}

fn matching_paths(events: &[DebouncedEvent], filters: &[Pattern]) -> Vec<Utf8PathBuf> {
    let mut seen = HashSet::new();

    events
        .iter()
        .filter(|de| {
            matches!(
                de.event.kind,
                EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
            )
        })
        .flat_map(|de| &de.event.paths)
        .filter(|path| filters.iter().any(|filter| filter.matches_path(path)))
        .filter_map(|path| Utf8PathBuf::from_path_buf(PathBuf::clone(path)).ok())
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob: impl AsRef<str>) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let (root, suffix) = crate::utils::split_glob(glob.as_ref());

    // The static root must exist on disk.
    let absolute = root.canonicalize_utf8()?;

    // A concrete file is watched through its parent, so that editors which
    // save by renaming are still caught.
    let (watch_root, pattern) = if !suffix.as_str().is_empty() {
        let pattern = absolute.join(&suffix);
        (absolute, pattern)
    } else if absolute.is_file() {
        let parent = absolute.parent().unwrap_or(&absolute).to_path_buf();
        (parent, absolute)
    } else {
        // A bare directory stands for everything below it.
        let pattern = absolute.join("**/*");
        (absolute, pattern)
    };

    let pattern = Pattern::new(pattern.as_str())?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because the
/// watcher is recursive.
pub(crate) fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
