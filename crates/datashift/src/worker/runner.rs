//! Serve the worker protocol over a line-oriented byte stream.
//!
//! A worker process runs [`serve_stdio`]: messages arrive on stdin and
//! replies leave on stdout, one JSON object per line. Logging must go to
//! stderr, since anything else on stdout corrupts the protocol.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::core::BackendCatalog;
use crate::error::Result;

use super::protocol::{decode, encode, CoordinatorMessage, WorkerMessage};
use super::WorkerExecutor;

/// Run `executor` against `reader`/`writer` until `Terminate` or end of input.
///
/// End of input without `Terminate` is handled as `Terminate`, so the
/// target's end hook still runs when the coordinator goes away.
pub async fn serve<R, W>(mut executor: WorkerExecutor, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            debug!("Coordinator closed the channel, terminating");
            executor.handle(CoordinatorMessage::Terminate).await;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: CoordinatorMessage = match decode(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                write_message(&mut writer, &WorkerMessage::error(e.to_string(), true)).await?;
                continue;
            }
        };
        let terminate = matches!(message, CoordinatorMessage::Terminate);

        if let Some(reply) = executor.handle(message).await {
            write_message(&mut writer, &reply).await?;
        }
        if terminate {
            return Ok(());
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage) -> Result<()> {
    let mut line = encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve the protocol on this process's stdin and stdout.
pub async fn serve_stdio(catalog: Arc<BackendCatalog>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(WorkerExecutor::new(catalog), stdin, stdout).await
}
