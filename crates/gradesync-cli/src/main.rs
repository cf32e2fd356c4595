use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;
mod config;

use config::Config;

/// gradesync: keep a grades table in sync across several stores.
///
/// Runs GET/SET/MERGE scripts against the configured replicas and inspects
/// their operation logs.
#[derive(Parser)]
#[command(name = "gradesync", version, about, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to ./gradesync.toml, then to the
    /// built-in postgresql/mongodb/pig mesh.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script of GET/SET/MERGE instructions, one per line.
    Run {
        /// Script file, e.g. `t1.in`.
        script: String,

        /// Delete all operation logs and merge histories first.
        #[arg(long)]
        fresh: bool,
    },

    /// Read one grade.
    Get {
        /// Replica name.
        system: String,
        /// Student identifier.
        student: String,
        /// Course identifier.
        course: String,
    },

    /// Write one grade.
    Set {
        /// Replica name.
        system: String,
        /// Student identifier.
        student: String,
        /// Course identifier.
        course: String,
        /// New grade.
        grade: String,
    },

    /// Pull unseen writes from another replica.
    Merge {
        /// Replica receiving the writes.
        system: String,
        /// Replica the writes come from.
        other: String,
    },

    /// Show a replica's operation log.
    Log {
        /// Replica name.
        system: String,

        /// Only show the last N operations.
        #[arg(long)]
        last: Option<usize>,

        /// Print the operations as JSON, as stored on disk.
        #[arg(long)]
        json: bool,
    },

    /// Show every replica's backend, log size, and merge bookmarks.
    Status,
}

// Logs go to stderr so script output on stdout stays clean.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = Config::load(cli.config.as_deref())
        .map_err(Into::into)
        .and_then(|config| match cli.command {
            Commands::Run { script, fresh } => commands::run(&config, &script, fresh),
            Commands::Get {
                system,
                student,
                course,
            } => commands::get(&config, &system, &student, &course),
            Commands::Set {
                system,
                student,
                course,
                grade,
            } => commands::set(&config, &system, &student, &course, &grade),
            Commands::Merge { system, other } => commands::merge(&config, &system, &other),
            Commands::Log { system, last, json } => commands::log(&config, &system, last, json),
            Commands::Status => commands::status(&config),
        });

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
