//! Worker process mode: NDJSON frames over stdin/stdout.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use super::dispatcher::SequentialDispatcher;
use super::protocol::{CallFrame, ErrorDescriptor, ReplyEnvelope, ReplyFrame};
use super::runtime::{serve, QueuedCall};
use crate::engine;
use crate::storage::Storage;

/// Serve calls from stdin until it closes, writing replies to stdout.
pub async fn serve_stdio(storage: Arc<dyn Storage>) -> std::io::Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    let output = BufWriter::new(tokio::io::stdout());
    serve_stream(input, output, storage).await
}

/// Serve calls read line by line from `input`, writing one reply line per call.
pub async fn serve_stream<R, W>(input: R, output: W, storage: Arc<dyn Storage>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel::<ReplyFrame>();
            // The stream closing is the only shutdown signal; the kill switch never fires.
            let (_kill_tx, kill_rx) = oneshot::channel();

            let ready = async {
                if let Err(e) = engine::initialize() {
                    warn!(error = %e, "engine failed to initialize");
                }
            };
            let worker = serve(inbox_rx, SequentialDispatcher::new(storage), ready, kill_rx);
            let reader = read_frames(input, inbox_tx, out_tx);
            let writer = write_frames(output, out_rx);

            let (read, (), written) = tokio::join!(reader, worker, writer);
            info!("stdio worker finished");
            read.and(written)
        })
        .await
}

/// Pull the `id` out of a line that failed to parse as a frame.
fn salvage_id(line: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

async fn read_frames<R>(
    input: R,
    inbox: mpsc::UnboundedSender<QueuedCall>,
    out: mpsc::UnboundedSender<ReplyFrame>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame = match serde_json::from_str::<CallFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
                if let Some(id) = salvage_id(&line) {
                    let reply = ReplyEnvelope::err(ErrorDescriptor {
                        name: "InvalidArguments".to_string(),
                        message: format!("malformed call frame: {}", e),
                        stack: None,
                    });
                    let _ = out.send(ReplyFrame { id, reply });
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = frame.id;
        if inbox
            .send(QueuedCall {
                call: frame.call,
                reply_to: reply_tx,
            })
            .is_err()
        {
            break;
        }
        let out = out.clone();
        tokio::task::spawn_local(async move {
            if let Ok(reply) = reply_rx.await {
                let _ = out.send(ReplyFrame { id, reply });
            }
        });
    }
    debug!("input closed");
    Ok(())
}

async fn write_frames<W>(output: W, mut frames: mpsc::UnboundedReceiver<ReplyFrame>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut output = output;
    while let Some(frame) = frames.recv().await {
        let line = serde_json::to_string(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            + "\n";
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskStorage;

    #[tokio::test]
    async fn test_stream_replies_echo_ids() {
        let input = concat!(
            r#"{"id":"a","operation":"constructor","arguments":[]}"#,
            "\n",
            "not json\n",
            r#"{"id":"b","operation":"__proto__"}"#,
            "\n",
            r#"{"id":"c","arguments":[]}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_stream(input.as_bytes(), &mut output, Arc::new(DiskStorage::new()))
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let frames: Vec<ReplyFrame> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(frames.len(), 3);

        let by_id = |id: &str| frames.iter().find(|f| f.id == id).unwrap().reply.clone();
        assert!(by_id("a").is_ok());
        assert_eq!(by_id("b").error.unwrap().name, "UnknownOperation");
        assert_eq!(by_id("c").error.unwrap().name, "InvalidArguments");
    }
}
