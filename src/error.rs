use std::sync::mpsc::RecvError;

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Malformed config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, toml::de::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is defined more than once")]
    Duplicate(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),

    #[error("Task '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Task '{0}':\n{1:#}")]
    Task(String, anyhow::Error),

    #[error("Task scheduler lost its workers")]
    Scheduler(#[from] RecvError),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("File watcher stopped delivering events")]
    Closed,
}
