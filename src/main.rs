use anyhow::Result;
use clap::{Parser, Subcommand};
use warp::commands::{plan, research, resume, sessions};

#[derive(Parser)]
#[command(name = "warp")]
#[command(about = "Multi-agent research orchestration CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-round research session toward a goal
    Research {
        /// The research goal
        goal: String,

        /// Number of rounds (overrides warp.toml)
        #[arg(short, long)]
        rounds: Option<u32>,

        /// Parallel analysts in the analysis step (overrides warp.toml)
        #[arg(long)]
        analysts: Option<usize>,

        /// Parallel implementers in the methodology step (overrides warp.toml)
        #[arg(long)]
        implementers: Option<usize>,

        /// Experiments per round (overrides warp.toml)
        #[arg(long)]
        experiments: Option<usize>,

        /// Run all rounds without asking between them
        #[arg(short, long)]
        yes: bool,
    },

    /// Decompose a goal into a task graph and execute it once
    Plan {
        /// The goal to decompose
        goal: String,

        /// Extra instructions prepended to every task
        #[arg(short, long)]
        context: Option<String>,

        /// Maximum concurrently running tasks
        #[arg(short = 'p', long)]
        max_parallel: Option<usize>,
    },

    /// Resume an interrupted session from its last checkpoint
    Resume {
        /// Session id (see `warp sessions list`)
        session_id: String,

        /// Run remaining rounds without asking between them
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// List sessions, most recently updated first
    List {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one session in detail
    Show {
        /// Session id
        session_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Research {
            goal,
            rounds,
            analysts,
            implementers,
            experiments,
            yes,
        } => research::execute(
            goal,
            research::Overrides {
                rounds,
                analysts,
                implementers,
                experiments,
            },
            yes,
        ),
        Commands::Plan {
            goal,
            context,
            max_parallel,
        } => plan::execute(goal, context, max_parallel),
        Commands::Resume { session_id, yes } => resume::execute(session_id, yes),
        Commands::Sessions { command } => match command {
            SessionsCommands::List { limit } => sessions::list(limit),
            SessionsCommands::Show { session_id } => sessions::show(session_id),
        },
    }
}
