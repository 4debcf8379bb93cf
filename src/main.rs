// ABOUTME: CLI entry point for table-relay
// ABOUTME: Parses commands, initializes logging and routes to the send/receive/cursor handlers

use clap::{Parser, Subcommand};
use table_relay::commands::{self, CursorArgs, ReceiveArgs, SendArgs};

#[derive(Parser)]
#[command(name = "table-relay")]
#[command(about = "Ship new rows from a PostgreSQL table to a remote target table", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a source table and send new rows to a receiver
    Send(SendArgs),
    /// Accept rows from senders and write them to a target table
    Receive(ReceiveArgs),
    /// Show, set or reset the sender's saved cursor
    Cursor(CursorArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Send(mut args) => {
            args.allow_self_signed_certs = cli.allow_self_signed_certs;
            commands::send::command(args).await
        }
        Commands::Receive(mut args) => {
            args.allow_self_signed_certs = cli.allow_self_signed_certs;
            commands::receive::command(args).await
        }
        Commands::Cursor(args) => commands::cursor::command(args).await,
    }
}
