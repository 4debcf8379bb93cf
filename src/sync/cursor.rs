// ABOUTME: Cursor newtype and the JSON file that persists it between sender runs
// ABOUTME: Writes go through a temp file + rename so a crash never leaves half a cursor

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Highest key known to have been transmitted.
///
/// `Option<Cursor>::None` means "from the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl Cursor {
    pub fn value(self) -> i64 {
        self.0
    }

    /// Combine a previous cursor with the max key of a fresh extraction.
    ///
    /// Never moves backwards, even when a lookback window re-reads older keys.
    pub fn advance(previous: Option<Cursor>, extracted: Option<Cursor>) -> Option<Cursor> {
        match (previous, extracted) {
            (Some(prev), Some(next)) => Some(prev.max(next)),
            (prev, None) => prev,
            (None, next) => next,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Cursor(value)
    }
}

/// What gets written to disk after every committed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    /// Table the cursor belongs to
    pub table: String,
    pub cursor: Cursor,
    /// When the frame that produced this cursor was committed
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Rows carried by that frame
    pub last_row_count: u64,
}

impl CursorState {
    pub fn new(table: &str, cursor: Cursor, row_count: u64) -> Self {
        Self {
            table: table.to_string(),
            cursor,
            updated_at: chrono::Utc::now(),
            last_row_count: row_count,
        }
    }
}

/// File-backed cursor store.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default location, relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".table-relay/cursor.json")
    }

    /// Read the persisted state.
    ///
    /// A missing file is `Ok(None)`. An unreadable or unparsable file is an
    /// error: restarting from the beginning would re-ship the whole table.
    pub async fn load(&self) -> Result<Option<CursorState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read cursor file {:?}", self.path))
            }
        };

        let state: CursorState = serde_json::from_str(&contents).with_context(|| {
            format!(
                "Cursor file {:?} is corrupt. Fix it or run `table-relay cursor reset`",
                self.path
            )
        })?;
        Ok(Some(state))
    }

    /// Load and check the cursor belongs to `table`.
    pub async fn load_for_table(&self, table: &str) -> Result<Option<Cursor>> {
        match self.load().await? {
            None => Ok(None),
            Some(state) if state.table == table => Ok(Some(state.cursor)),
            Some(state) => bail!(
                "Cursor file {:?} tracks table '{}', not '{}'",
                self.path,
                state.table,
                table
            ),
        }
    }

    /// Persist `state` atomically.
    pub async fn save(&self, state: &CursorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(state).context("Failed to serialize cursor state")?;
        let tmp = self.tmp_path();
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write cursor file {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move {:?} into place at {:?}", tmp, self.path))?;
        Ok(())
    }

    /// Forget the cursor. Returns whether a file was removed.
    pub async fn reset(&self) -> Result<bool> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", self.path)),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursor.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
