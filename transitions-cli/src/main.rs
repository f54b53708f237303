mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers::{self, RunArgs};
use transitions_core::models::LogLevel;
use transitions_core::services::init_logging;

#[derive(Parser)]
#[command(name = "transitions")]
#[command(version)]
#[command(about = "Run and track lifecycle transitions of inventory objects")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a definition file or directory
    Validate {
        /// Definition file or directory (default: configured definitions_dir)
        #[arg(short, long)]
        file: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List transition definitions
    ///
    /// Examples:
    ///   transitions list --kind back_office_asset
    ///   transitions list --kind back_office_asset --state damaged --actor alice --permission can_scrap
    List {
        #[arg(short, long)]
        file: Option<String>,

        /// Only definitions for this object kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Only definitions applicable from this state (requires --kind)
        #[arg(short, long)]
        state: Option<String>,

        /// Only definitions this actor may run
        #[arg(long)]
        actor: Option<String>,

        /// Permissions held by --actor
        #[arg(long = "permission")]
        permissions: Vec<String>,

        /// Treat --actor as a superuser
        #[arg(long)]
        superuser: bool,

        #[arg(long)]
        json: bool,
    },

    /// Run a transition on one or more objects
    ///
    /// Action parameters are passed as `<action>__<param>=<value>`; values that
    /// parse as JSON keep their type.
    ///
    /// Examples:
    ///   transitions run deploy --object back_office_asset:1 --param assign_owner__owner=alice
    ///   transitions run reinstall --object server:db-1 --object server:db-2 --wait
    Run {
        /// Transition name
        transition: String,

        #[arg(short, long)]
        file: Option<String>,

        /// Target object as kind:id (repeatable)
        #[arg(short, long = "object", required = true)]
        objects: Vec<String>,

        /// Actor running the transition (default: configured default_actor)
        #[arg(long)]
        actor: Option<String>,

        /// Permissions held by the actor
        #[arg(long = "permission")]
        permissions: Vec<String>,

        #[arg(long)]
        superuser: bool,

        /// Parameter as key=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Print progress of asynchronous runs while waiting
        #[arg(short, long)]
        wait: bool,

        #[arg(long)]
        json: bool,
    },

    /// Finish runs left unfinished by an interrupted process
    ///
    /// Actions already recorded as succeeded are not repeated.
    Resume {
        #[arg(short, long)]
        file: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Record the current state of an object
    SetState {
        /// Object as kind:id
        object: String,

        /// New state
        state: String,
    },

    /// Show the progress of a run
    Status {
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Wait until a run finishes
    Wait {
        run_id: String,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "300")]
        timeout: u64,

        #[arg(long)]
        json: bool,
    },

    /// Show transition history
    History {
        /// Only history of this object (kind:id)
        #[arg(short, long)]
        object: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show run metrics
    Metrics {
        /// Only runs of this transition
        #[arg(short, long)]
        transition: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { init } = &cli.command {
        if *init {
            handlers::handle_config_init(cli.config.as_deref()).await?;
        } else {
            println!("Config command requires --init flag");
            println!("Usage: transitions config --init [--config PATH]");
        }
        return Ok(());
    }

    let mut config = handlers::load_configuration(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Err(e) = init_logging(config.log_level) {
        eprintln!("⚠  Failed to initialize logging: {}", e);
    }

    let definitions = |file: Option<String>| {
        file.unwrap_or_else(|| config.definitions_dir.to_string_lossy().to_string())
    };

    match cli.command {
        Commands::Validate { file, json } => {
            handlers::handle_validate(definitions(file), json).await?;
        }
        Commands::List {
            file,
            kind,
            state,
            actor,
            permissions,
            superuser,
            json,
        } => {
            let actor = actor.map(|username| handlers::build_actor(username, permissions, superuser));
            handlers::handle_list(definitions(file), kind, state, actor, json).await?;
        }
        Commands::Run {
            transition,
            file,
            objects,
            actor,
            permissions,
            superuser,
            params,
            wait,
            json,
        } => {
            let args = RunArgs {
                file: definitions(file),
                transition,
                objects,
                actor,
                permissions,
                superuser,
                params,
                wait,
                json,
            };
            handlers::handle_run(&config, args).await?;
        }
        Commands::Resume { file, json } => {
            handlers::handle_resume(&config, definitions(file), json).await?;
        }
        Commands::SetState { object, state } => {
            handlers::handle_set_state(&config, object, state).await?;
        }
        Commands::Status { run_id, json } => {
            handlers::handle_status(&config, run_id, json).await?;
        }
        Commands::Wait {
            run_id,
            timeout,
            json,
        } => {
            handlers::handle_wait(&config, run_id, timeout, json).await?;
        }
        Commands::History { object, json } => {
            handlers::handle_history(&config, object, json).await?;
        }
        Commands::Metrics { transition, json } => {
            handlers::handle_metrics(&config, transition, json).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
