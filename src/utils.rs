use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::errors::{Result, RecorderError};

/// Shortest segment the recorder will produce, whatever the config says.
pub const MIN_ROTATION: Duration = Duration::from_secs(30);

/// Placeholder replaced by the temp output path in the encoder command.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Parse a rotation duration like "30s", "10m" or "1h 30m", clamped to `MIN_ROTATION`.
pub fn parse_rotation(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RecorderError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(s)
        .map_err(|e| RecorderError::config(format!("Invalid duration '{}': {}", s, e)))?;

    Ok(duration.max(MIN_ROTATION))
}

/// Split the encoder command template on whitespace and substitute the output path
/// into every argument that carries the placeholder.
pub fn render_command(template: &str, output: &Path) -> Result<Vec<String>> {
    let output = output.to_string_lossy();
    let args: Vec<String> = template
        .split_whitespace()
        .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
        .collect();

    if args.is_empty() {
        return Err(RecorderError::config("Encoder command is empty"));
    }

    Ok(args)
}

/// Hex dump of the first bytes of a payload, for decode diagnostics.
pub fn hex_prefix(data: &[u8], len: usize) -> String {
    data.iter()
        .take(len)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Make a camera name safe to embed in a file name.
pub fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Rename `from` to `to`, falling back to copy + remove when they live on different filesystems.
pub async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!("rename {} -> {} failed ({}), copying instead", from.display(), to.display(), rename_err);
            if tokio::fs::metadata(from).await.is_err() {
                return Err(rename_err);
            }
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
