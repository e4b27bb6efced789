//! Incremental bundling in watch mode.
//!
//! The session watches the directories holding the files that went into the
//! last successful bundle, one level deep. A batch of events causes a
//! rebundle only when one of those files actually changed contents. Events
//! that pile up while esbuild runs are drained and merged into a single
//! follow-up rebundle, so the session never runs two bundles at once.
//!
//! Until a bundle has succeeded the inputs are unknown, so the whole scripts
//! tree is watched instead and any change in it triggers a retry.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::mpsc::{Receiver, channel};

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache};

use super::scripts::ScriptPipeline;
use crate::error::WatchError;
use crate::hash::Digest;
use crate::watch::DEBOUNCE;

/// Digest of every bundle input; `None` for a file that couldn't be read.
type Inputs = HashMap<Utf8PathBuf, Option<Digest>>;

pub struct BundlerSession<'a> {
    pipeline: &'a ScriptPipeline,
    inputs: Inputs,
    /// Directories watched one level deep for the known inputs.
    watched: HashSet<Utf8PathBuf>,
    /// The scripts tree, watched recursively until a bundle succeeds.
    fallback: Option<Utf8PathBuf>,
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    rx: Receiver<DebounceEventResult>,
}

impl<'a> BundlerSession<'a> {
    pub fn new(pipeline: &'a ScriptPipeline) -> Result<Self, WatchError> {
        let (tx, rx) = channel();
        let debouncer = notify_debouncer_full::new_debouncer(DEBOUNCE, None, tx)?;

        Ok(Self {
            pipeline,
            inputs: HashMap::new(),
            watched: HashSet::new(),
            fallback: None,
            debouncer,
            rx,
        })
    }

    /// Files the session currently reacts to.
    pub fn inputs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.inputs.keys().map(Utf8PathBuf::as_path)
    }

    /// Bundles right away, then once per relevant change.
    pub fn run(mut self) -> Result<Infallible, WatchError> {
        self.rebundle()?;

        loop {
            let mut changed = HashSet::new();

            let batch = self.rx.recv().map_err(|_| WatchError::Closed)?;
            self.collect(batch, &mut changed);

            // Whatever queued up in the meantime goes into the same rebundle.
            let queued: Vec<_> = self.rx.try_iter().collect();
            for batch in queued {
                self.collect(batch, &mut changed);
            }

            if !self.is_stale(&changed) {
                continue;
            }

            tracing::info!("Rebundle...");
            self.rebundle()?;
        }
    }

    /// Before the first successful bundle any change in the scripts tree
    /// counts, afterwards only real edits to known inputs.
    fn is_stale(&self, changed: &HashSet<Utf8PathBuf>) -> bool {
        match &self.fallback {
            Some(root) => changed.iter().any(|path| path.starts_with(root)),
            None => !stale_inputs(&self.inputs, changed).is_empty(),
        }
    }

    fn collect(&self, batch: DebounceEventResult, changed: &mut HashSet<Utf8PathBuf>) {
        match batch {
            Ok(events) => changed.extend(
                events
                    .iter()
                    .filter(|de| {
                        matches!(
                            de.event.kind,
                            EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                        )
                    })
                    .flat_map(|de| &de.event.paths)
                    .filter_map(|path| Utf8PathBuf::from_path_buf(path.clone()).ok()),
            ),
            Err(errors) => {
                for e in errors {
                    tracing::error!(task = "scripts", "watch error: {e}");
                }
            }
        }
    }

    fn rebundle(&mut self) -> Result<(), WatchError> {
        match self.pipeline.build_once() {
            Some(artifacts) => self.track(artifacts.inputs),
            // The failing file may be any of the entry's imports, none of
            // which are known yet.
            None if self.inputs.is_empty() => self.watch_tree(),
            // Keep the previous dependency graph.
            None => Ok(()),
        }
    }

    fn watch_tree(&mut self) -> Result<(), WatchError> {
        if self.fallback.is_some() {
            return Ok(());
        }

        let root = self.pipeline.paths.watch_root().canonicalize_utf8()?;
        tracing::debug!(task = "scripts", "watching {root} until a bundle succeeds");

        self.debouncer.watch(&root, RecursiveMode::Recursive)?;
        self.fallback = Some(root);

        Ok(())
    }

    fn track(&mut self, inputs: Vec<Utf8PathBuf>) -> Result<(), WatchError> {
        if let Some(root) = self.fallback.take()
            && let Err(e) = self.debouncer.unwatch(&root)
        {
            tracing::debug!("couldn't unwatch {root}: {e}");
        }

        self.inputs = inputs
            .into_iter()
            .map(|path| {
                let digest = Digest::of_file(&path).ok();
                (path, digest)
            })
            .collect();

        let dirs: HashSet<Utf8PathBuf> = self
            .inputs
            .keys()
            .filter_map(|path| path.parent().map(Utf8Path::to_path_buf))
            .collect();

        for dir in self.watched.difference(&dirs) {
            if let Err(e) = self.debouncer.unwatch(dir) {
                tracing::debug!("couldn't unwatch {dir}: {e}");
            }
        }

        for dir in dirs.difference(&self.watched) {
            tracing::debug!(task = "scripts", "watching {dir}");
            self.debouncer.watch(dir, RecursiveMode::NonRecursive)?;
        }

        self.watched = dirs;
        Ok(())
    }
}

/// The tracked inputs among `changed` whose contents differ from what was
/// last bundled. A file that can no longer be read counts as changed.
pub(crate) fn stale_inputs<'a>(
    inputs: &Inputs,
    changed: &'a HashSet<Utf8PathBuf>,
) -> Vec<&'a Utf8Path> {
    changed
        .iter()
        .filter(|path| match inputs.get(*path) {
            Some(digest) => Digest::of_file(path).ok() != *digest,
            None => false,
        })
        .map(Utf8PathBuf::as_path)
        .collect()
}
