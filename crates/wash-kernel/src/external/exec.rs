//! The exec output protocol.
//!
//! A plugin serving `exec` multiplexes the remote command's stdout and
//! stderr onto its own stdout as newline-delimited JSON chunks:
//!
//! ```text
//! {"stream":"stdout","data":"<base64>"}
//! {"stream":"stderr","data":"<base64>"}
//! {"exit_code":0}
//! ```
//!
//! The `exit_code` chunk terminates the sequence and carries the remote
//! command's exit status; the plugin process itself exits zero unless it
//! failed to run the command at all.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use wash_types::{WashError, WashResult};

#[derive(Debug, Deserialize)]
struct ExecChunk {
    stream: Option<String>,
    data: Option<String>,
    exit_code: Option<i32>,
}

/// The decoded chunk sequence: demultiplexed output plus the terminator,
/// if one arrived before EOF.
#[derive(Debug, Default)]
pub struct ExecChunks {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// Consume chunks from the plugin's stdout until the terminator or EOF.
pub async fn decode_exec_chunks<R>(reader: &mut R) -> WashResult<ExecChunks>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunks = ExecChunks::default();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| WashError::Transient(format!("failed to read exec output: {}", e)))?;
        if n == 0 {
            return Ok(chunks);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let chunk: ExecChunk = serde_json::from_str(trimmed).map_err(|e| {
            WashError::decode(format!("plugin stdout contains a malformed exec chunk: {}", e))
        })?;

        if let Some(code) = chunk.exit_code {
            chunks.exit_code = Some(code);
            return Ok(chunks);
        }

        let data = match &chunk.data {
            Some(data) => BASE64.decode(data).map_err(|e| {
                WashError::decode(format!("exec chunk data is not valid base64: {}", e))
            })?,
            None => Vec::new(),
        };
        match chunk.stream.as_deref() {
            Some("stdout") => chunks.stdout.extend_from_slice(&data),
            Some("stderr") => chunks.stderr.extend_from_slice(&data),
            other => {
                return Err(WashError::decode(format!(
                    "exec chunk names unknown stream {:?}",
                    other.unwrap_or("")
                )))
            }
        }
    }
}
