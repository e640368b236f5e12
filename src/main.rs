mod commands;

use clap::{Parser, Subcommand};
use commands::{Context, KeyArgs, RotateKeyArgs, RuleArgs};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sops")]
#[command(version)]
#[command(about = "Encrypt the values of structured documents", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a plaintext file
    Encrypt {
        file: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,

        #[command(flatten)]
        rules: RuleArgs,

        /// Number of key groups required to recover the data key
        #[arg(long = "shamir-secret-sharing-threshold", default_value_t = 0)]
        threshold: usize,

        /// Write the result back to FILE instead of stdout
        #[arg(short, long)]
        in_place: bool,
    },

    /// Decrypt an encrypted file
    Decrypt {
        file: PathBuf,

        /// Only print the value at this path, e.g. '["db"]["password"]'
        #[arg(long)]
        extract: Option<String>,

        /// Do not fail when the MAC is missing or does not match
        #[arg(long)]
        ignore_mac: bool,

        #[arg(short, long, conflicts_with = "extract")]
        in_place: bool,
    },

    /// Generate a new data key and re-encrypt every value
    Rotate {
        file: PathBuf,

        #[command(flatten)]
        keys: RotateKeyArgs,

        #[arg(short, long)]
        in_place: bool,
    },

    /// Store a JSON value at a path, in place
    Set {
        file: PathBuf,
        path: String,
        value: String,
    },

    /// Remove the value at a path, in place
    Unset { file: PathBuf, path: String },

    /// Manage key groups, in place
    Groups {
        #[command(subcommand)]
        command: GroupCommands,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Add a key group built from the given keys
    Add {
        file: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Delete the key group at INDEX
    Delete { file: PathBuf, index: usize },
}

fn main() {
    let filter = EnvFilter::try_from_env("SOPS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = Context::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Encrypt {
            file,
            keys,
            rules,
            threshold,
            in_place,
        } => commands::encrypt(&ctx, &file, &keys, &rules, threshold, in_place),
        Commands::Decrypt {
            file,
            extract,
            ignore_mac,
            in_place,
        } => commands::decrypt(&ctx, &file, extract.as_deref(), ignore_mac, in_place),
        Commands::Rotate {
            file,
            keys,
            in_place,
        } => commands::rotate(&ctx, &file, &keys, in_place),
        Commands::Set { file, path, value } => commands::set(&ctx, &file, &path, &value),
        Commands::Unset { file, path } => commands::unset(&ctx, &file, &path),
        Commands::Groups { command } => match command {
            GroupCommands::Add { file, keys } => commands::add_group(&ctx, &file, &keys),
            GroupCommands::Delete { file, index } => commands::delete_group(&ctx, &file, index),
        },
    }
}
