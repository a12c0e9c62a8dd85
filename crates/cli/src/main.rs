//! ciq CLI — the main entry point.
//!
//! Commands:
//! - `ask`      — Answer a question, streaming the answer as it is generated
//! - `sessions` — Create, list, inspect and delete conversation sessions
//! - `config`   — Print the effective configuration

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "ciq",
    about = "ciq — competitive-intelligence answers grounded in your corpus",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question
    Ask(AskArgs),

    /// Manage conversation sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Print the effective configuration (keys redacted)
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[derive(Args, Debug)]
pub struct AskArgs {
    /// The question
    #[arg(required = true, num_args = 1..)]
    pub text: Vec<String>,

    /// Continue (and record into) this session
    #[arg(short, long)]
    pub session: Option<String>,

    /// Restrict to competitor(s)
    #[arg(long = "competitor")]
    pub competitors: Vec<String>,

    /// Restrict to topic(s)
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    /// Restrict to source type(s)
    #[arg(long = "source-type")]
    pub source_types: Vec<String>,

    /// Restrict to credibility level(s)
    #[arg(long)]
    pub credibility: Vec<String>,

    /// Only passages dated on or after (YYYY-MM-DD)
    #[arg(long)]
    pub after: Option<NaiveDate>,

    /// Only passages dated on or before (YYYY-MM-DD)
    #[arg(long)]
    pub before: Option<NaiveDate>,

    /// Number of fused passages to retrieve
    #[arg(short = 'n', long)]
    pub results: Option<usize>,

    /// Use the fast model (disables reasoning)
    #[arg(long)]
    pub fast: bool,

    /// Disable extended reasoning
    #[arg(long)]
    pub no_reasoning: bool,

    /// Print every event as one JSON line
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Start a new session and print its id
    New,

    /// List recent sessions
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print every turn of a session
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Print a session's token totals
    Totals { id: String },

    /// Delete one session, or all of the owner's sessions
    Delete {
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Ask(args) => commands::ask::run(args).await?,
        Commands::Sessions { command } => commands::sessions::run(command).await?,
        Commands::Config { path } => commands::config_cmd::run(path)?,
    }

    Ok(())
}
