// ABOUTME: Utility functions for identifier validation, SQL quoting and retries
// ABOUTME: Guards every name and type tag that ends up spliced into SQL text

use anyhow::{bail, Result};
use std::time::Duration;

/// Retry an async operation with exponential backoff
///
/// # Arguments
///
/// * `operation` - Async function to retry
/// * `max_retries` - Maximum number of retry attempts (0 = just the initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use table_relay::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("success") },
///     3,
///     Duration::from_secs(1)
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        retry_in = ?delay,
                        error = %format!("{:#}", e),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Validate a PostgreSQL identifier (schema, table or column name)
///
/// Identifiers must:
/// - Be 1-63 characters long
/// - Start with a letter or underscore
/// - Contain only letters, digits and underscores
///
/// # Examples
///
/// ```
/// # use table_relay::utils::validate_postgres_identifier;
/// assert!(validate_postgres_identifier("users").is_ok());
/// assert!(validate_postgres_identifier("_private").is_ok());
/// assert!(validate_postgres_identifier("123abc").is_err());
/// assert!(validate_postgres_identifier("users\"; DROP TABLE x; --").is_err());
/// ```
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    if let Some(first_char) = trimmed.chars().next() {
        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first_char
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Validate a column type tag received from a peer before it is used in DDL.
///
/// Type tags come from the origin catalog (`integer`, `character varying(255)`,
/// `timestamp with time zone`, `numeric(10,2)`, `text[]`, ...). They cannot be
/// quoted like identifiers, so anything outside that shape is rejected.
///
/// # Examples
///
/// ```
/// # use table_relay::utils::validate_type_name;
/// assert!(validate_type_name("character varying(255)").is_ok());
/// assert!(validate_type_name("numeric(10,2)").is_ok());
/// assert!(validate_type_name("text[]").is_ok());
/// assert!(validate_type_name("int); DROP TABLE users; --").is_err());
/// ```
pub fn validate_type_name(type_name: &str) -> Result<()> {
    let trimmed = type_name.trim();
    if trimmed.is_empty() {
        bail!("Column type cannot be empty");
    }
    if trimmed.len() > 128 {
        bail!("Column type exceeds maximum length of 128 characters");
    }
    if !trimmed.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        bail!(
            "Column type '{}' must start with a letter or underscore",
            sanitize_identifier(trimmed)
        );
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '[' | ']')))
    {
        bail!(
            "Column type '{}' contains invalid character '{}'",
            sanitize_identifier(trimmed),
            bad.escape_default()
        );
    }

    let mut depth = 0i32;
    for c in trimmed.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 || depth > 1 {
            bail!(
                "Column type '{}' has unbalanced parentheses",
                sanitize_identifier(trimmed)
            );
        }
    }
    if depth != 0 {
        bail!(
            "Column type '{}' has unbalanced parentheses",
            sanitize_identifier(trimmed)
        );
    }

    Ok(())
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length to prevent log injection.
/// This is for display only; SQL safety comes from validation plus quoting.
///
/// ```
/// # use table_relay::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// assert_eq!(sanitize_identifier(&"a".repeat(200)).len(), 100);
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
///
/// ```
/// # use table_relay::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a schema-qualified table name: `"schema"."table"`.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
