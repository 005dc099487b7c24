//! Newline-delimited JSON request intake.

use futures_util::StreamExt;
use futures_util::stream::FuturesOrdered;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::WorkerPool;

/// Reads one request per line from `input` and writes one reply per line to
/// `output`, in request order.
///
/// Requests are handed to the pool as they arrive, so several can be in
/// flight at once. Blank lines are skipped. Returns once `input` reaches
/// EOF and every pending reply has been written.
pub async fn serve_lines<R, W>(input: R, mut output: W, pool: &WorkerPool) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut pending = FuturesOrdered::new();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    metrics::counter!("allocation_requests_received").increment(1);
                    pending.push_back(pool.submit(line));
                }
                None => {
                    tracing::debug!(pending = pending.len(), "input closed");
                    input_open = false;
                }
            },
            Some(reply) = pending.next(), if !pending.is_empty() => {
                let mut encoded = serde_json::to_vec(&reply).map_err(std::io::Error::other)?;
                encoded.push(b'\n');
                output.write_all(&encoded).await?;
                output.flush().await?;
            }
            else => break,
        }
    }

    Ok(())
}
