// ABOUTME: `cursor` command - inspect or rewrite the sender's persisted cursor
// ABOUTME: Lets an operator re-ship rows (set lower / reset) or skip them (set higher)

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::sync::{Cursor, CursorFile, CursorState};
use crate::utils::validate_postgres_identifier;

#[derive(Args, Debug)]
pub struct CursorArgs {
    /// Cursor file used by `table-relay send`
    #[arg(long, env = "CURSOR_PATH", value_name = "PATH", global = true)]
    cursor_path: Option<PathBuf>,
    #[command(subcommand)]
    command: CursorCommands,
}

#[derive(Subcommand, Debug)]
enum CursorCommands {
    /// Print the saved cursor
    Show,
    /// Overwrite the saved cursor
    Set {
        /// New cursor value (highest key already delivered)
        value: i64,
        /// Table the cursor belongs to
        #[arg(long, env = "TABLE_NAME")]
        table: String,
    },
    /// Delete the saved cursor so the next run starts from the beginning
    Reset,
}

pub async fn command(args: CursorArgs) -> Result<()> {
    let store = CursorFile::new(args.cursor_path.unwrap_or_else(CursorFile::default_path));

    match args.command {
        CursorCommands::Show => match store.load().await? {
            Some(state) => {
                println!("Table:          {}", state.table);
                println!("Cursor:         {}", state.cursor);
                println!("Updated at:     {}", state.updated_at.to_rfc3339());
                println!("Last row count: {}", state.last_row_count);
            }
            None => println!("No cursor saved at {}", store.path().display()),
        },
        CursorCommands::Set { value, table } => {
            validate_postgres_identifier(&table).context("Invalid table name")?;
            store
                .save(&CursorState::new(&table, Cursor(value), 0))
                .await
                .context("Failed to save cursor")?;
            println!("Cursor for {} set to {}", table, value);
        }
        CursorCommands::Reset => {
            if store.reset().await? {
                println!("Cursor reset. The next run starts from the beginning.");
            } else {
                println!("No cursor saved at {}", store.path().display());
            }
        }
    }
    Ok(())
}
