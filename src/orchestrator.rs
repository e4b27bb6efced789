//! Wires the pipelines into the task graph.
//!
//! | task           | depends on                | does                                  |
//! |----------------|---------------------------|---------------------------------------|
//! | `images`       |                           | optimise the image tree               |
//! | `styles`       |                           | compile `main.css`                    |
//! | `scripts`      |                           | bundle `main.js` once                 |
//! | `browser-sync` |                           | start live reload and the dev proxy   |
//! | `default`      | `images`, `browser-sync`  | watch everything, rebuild on change   |

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use crate::Mode;
use crate::config::Config;
use crate::error::{GraphError, TaskError};
use crate::graph::TaskGraph;
use crate::pipeline::{Bundler, Esbuild, ImagePipeline, ScriptPipeline, StylePipeline};
use crate::reload::{Reloader, Signal};
use crate::sink::ErrorSink;
#[cfg(feature = "live")]
use crate::watch::WatchRegistration;

#[cfg(feature = "server")]
type Proxy = crate::server::RunningServer;
#[cfg(not(feature = "server"))]
type Proxy = ();

/// Holds the proxy `browser-sync` started until someone waits on it.
type ProxySlot = Arc<Mutex<Option<Proxy>>>;

pub struct Orchestrator {
    graph: TaskGraph,
    proxy: ProxySlot,
    #[cfg(feature = "live")]
    registrations: Arc<Vec<WatchRegistration>>,
}

impl Orchestrator {
    /// Uses esbuild for bundling and desktop notifications for compile
    /// errors.
    pub fn new(config: Config) -> Result<Self, GraphError> {
        let bundler = Arc::new(Esbuild::new(&config.scripts));
        Self::with_services(config, ErrorSink::desktop(), bundler)
    }

    pub fn with_services(
        config: Config,
        sink: ErrorSink,
        bundler: Arc<dyn Bundler>,
    ) -> Result<Self, GraphError> {
        let (reload, signals) = Reloader::channel();
        let signals = Arc::new(Mutex::new(Some(signals)));
        let proxy = ProxySlot::default();

        let images = Arc::new(ImagePipeline::new(
            config.paths.images.clone(),
            config.images.clone(),
        ));
        let styles = Arc::new(StylePipeline::new(
            config.paths.styles.clone(),
            config.styles.clone(),
            sink.clone(),
            reload.clone(),
        ));
        let scripts = Arc::new(ScriptPipeline::new(
            config.paths.scripts.clone(),
            bundler,
            sink,
            reload,
        ));

        #[cfg(feature = "live")]
        let registrations = Arc::new(vec![
            WatchRegistration::new([config.paths.styles.watch_glob()], "styles"),
            WatchRegistration::new([config.paths.images.watch_glob()], "images"),
        ]);

        let graph = TaskGraph::builder()
            .task("images", [], {
                let images = images.clone();
                move |_| {
                    images.run()?;
                    Ok(())
                }
            })
            .task("styles", [], {
                let styles = styles.clone();
                move |_| {
                    styles.trigger();
                    Ok(())
                }
            })
            .task("scripts", [], {
                let scripts = scripts.clone();
                move |_| scripts.build(Mode::Build)
            })
            .task("browser-sync", [], {
                let server = config.server.clone();
                let signals = signals.clone();
                let proxy = proxy.clone();
                move |_| {
                    let signals = signals.lock().unwrap_or_else(PoisonError::into_inner).take();
                    browser_sync(&server, signals, &proxy)
                }
            })
            .task("default", ["images", "browser-sync"], {
                #[cfg(feature = "live")]
                let registrations = registrations.clone();
                let scripts = scripts.clone();
                move |ctx| {
                    #[cfg(feature = "live")]
                    let result = watch_all(ctx.graph, &registrations, &scripts);

                    #[cfg(not(feature = "live"))]
                    let result = {
                        let _ = ctx;
                        tracing::warn!("built without the 'live' feature, nothing to watch");
                        scripts.build(Mode::Build)
                    };

                    result
                }
            })
            .build()?;

        Ok(Self {
            graph,
            proxy,
            #[cfg(feature = "live")]
            registrations,
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Runs a task after its dependencies. Asked for on its own,
    /// `browser-sync` then keeps serving until the proxy stops.
    pub fn run(&self, name: &str) -> Result<(), TaskError> {
        self.graph.run(name)?;

        if name == "browser-sync" {
            self.serve(name)?;
        }

        Ok(())
    }

    #[cfg(feature = "server")]
    fn serve(&self, name: &str) -> Result<(), TaskError> {
        let running = self.proxy.lock().unwrap_or_else(PoisonError::into_inner).take();

        match running {
            Some(server) => server.wait().map_err(|e| TaskError::Task(name.into(), e)),
            None => Ok(()),
        }
    }

    #[cfg(not(feature = "server"))]
    fn serve(&self, _: &str) -> Result<(), TaskError> {
        let _ = &self.proxy;
        Ok(())
    }

    /// Optimises images and starts the proxy, then watches styles, images and
    /// scripts. Only returns if something breaks.
    pub fn run_default(&self) -> Result<(), TaskError> {
        self.run("default")
    }

    pub fn run_scripts_once(&self) -> Result<(), TaskError> {
        self.run("scripts")
    }

    /// The watches `default` registers.
    #[cfg(feature = "live")]
    pub fn watch_registrations(&self) -> &[WatchRegistration] {
        &self.registrations
    }
}

#[cfg(feature = "server")]
fn browser_sync(
    config: &crate::config::ServerConfig,
    signals: Option<Receiver<Signal>>,
    slot: &Mutex<Option<Proxy>>,
) -> anyhow::Result<()> {
    let Some(signals) = signals else {
        tracing::info!("proxy is already running");
        return Ok(());
    };

    let server = crate::server::start(config, signals)?;
    tracing::info!(reload = server.reload_port(), "serving {}", server.url());
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);

    Ok(())
}

#[cfg(not(feature = "server"))]
fn browser_sync(
    _: &crate::config::ServerConfig,
    _: Option<Receiver<Signal>>,
    _: &Mutex<Option<Proxy>>,
) -> anyhow::Result<()> {
    tracing::warn!("built without the 'server' feature, no proxy");
    Ok(())
}

/// Registers every watch, then blocks on them and on the bundler session,
/// one thread each.
#[cfg(feature = "live")]
fn watch_all(
    graph: &TaskGraph,
    registrations: &[WatchRegistration],
    scripts: &ScriptPipeline,
) -> anyhow::Result<()> {
    let watches = registrations
        .iter()
        .map(WatchRegistration::start)
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!("watching for changes...");

    std::thread::scope(|s| {
        let mut handles = Vec::new();

        for watch in watches {
            handles.push(s.spawn(move || {
                let task = watch.task().to_string();
                match watch.run(graph) {
                    Ok(never) => match never {},
                    Err(e) => tracing::error!(task = %task, "watch stopped: {e}"),
                }
            }));
        }

        handles.push(s.spawn(move || {
            if let Err(e) = scripts.build(Mode::Watch) {
                tracing::error!(task = "scripts", "bundler session stopped: {e:#}");
            }
        }));

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("watch thread panicked");
            }
        }
    });

    anyhow::bail!("every watcher has stopped")
}
