use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use mintkit::utils::init_logging;
use mintkit::{Config, Orchestrator};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Task {
    Images,
    Styles,
    Scripts,
    BrowserSync,
    Default,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::Images => "images",
            Task::Styles => "styles",
            Task::Scripts => "scripts",
            Task::BrowserSync => "browser-sync",
            Task::Default => "default",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[clap(value_enum, index = 1, default_value = "default")]
    task: Task,

    /// Settings file; missing means defaults.
    #[clap(long, default_value = "mintkit.toml")]
    config: Utf8PathBuf,

    /// Print the task graph as a Mermaid diagram and exit.
    #[clap(long)]
    graph: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging()?;

    let config = Config::load(&args.config)?;
    let orchestrator = Orchestrator::new(config)?;

    if args.graph {
        println!("{}", orchestrator.graph());
        return Ok(());
    }

    match args.task {
        Task::Default => orchestrator.run_default()?,
        Task::Scripts => orchestrator.run_scripts_once()?,
        task => orchestrator.run(task.name())?,
    }

    Ok(())
}
