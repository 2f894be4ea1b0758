use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::controller::{CancelToken, DecodeController, DecodedEvent, FinishReason};
use crate::errors::{DecodeError, DecodeResult};

use super::ServerStats;

/// One message from the blocking decode worker to the SSE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Token(String),
    Done(FinishReason),
    Failed(String),
}

/// Cancels the request's decode loop when the response body goes away.
#[derive(Debug)]
pub struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs one generation on the blocking pool and forwards its events over a
/// bounded channel.
///
/// Resolves once the first event exists, so anything that fails before a
/// byte is streamed (validation, prefill, the first decode step) comes back
/// here as an error instead of inside a 200 response. Waiting for the
/// pipeline lock happens on the blocking thread.
pub async fn start_generation(
    controller: Arc<DecodeController>,
    prompt: String,
    buffer: usize,
    stats: Arc<ServerStats>,
) -> DecodeResult<(mpsc::Receiver<StreamItem>, CancelOnDrop)> {
    if !controller.is_ready() {
        return Err(DecodeError::NotReady);
    }

    let (tx, rx) = mpsc::channel(buffer.max(1));
    let (started_tx, started_rx) = oneshot::channel::<DecodeResult<()>>();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        let mut stream = match controller.begin(&prompt, worker_cancel) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = started_tx.send(Err(e));
                return;
            }
        };
        let first = match stream.next() {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                let _ = started_tx.send(Err(e));
                return;
            }
            None => {
                let _ = started_tx.send(Err(DecodeError::Generation(anyhow!(
                    "decode stream ended without a terminal event"
                ))));
                return;
            }
        };
        if started_tx.send(Ok(())).is_err() {
            debug!("client went away while queued for the pipeline");
            return;
        }
        pump(std::iter::once(Ok(first)).chain(stream), &tx, &stats);
    });

    match started_rx.await {
        Ok(Ok(())) => Ok((rx, CancelOnDrop(cancel))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DecodeError::Generation(anyhow!(
            "decode worker exited before the first token"
        ))),
    }
}

/// Drains `events` into `tx`. Returning drops the stream and frees the lock.
fn pump(
    events: impl Iterator<Item = DecodeResult<DecodedEvent>>,
    tx: &mpsc::Sender<StreamItem>,
    stats: &ServerStats,
) {
    for item in events {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                let _ = tx.blocking_send(StreamItem::Failed(e.to_string()));
                return;
            }
        };

        if !event.is_final {
            stats.tokens_generated.fetch_add(1, Ordering::Relaxed);
        }
        if !event.token_text.is_empty()
            && tx.blocking_send(StreamItem::Token(event.token_text)).is_err()
        {
            debug!("client disconnected, stopping generation");
            return;
        }
        if let Some(reason) = event.finish_reason {
            if tx.blocking_send(StreamItem::Done(reason)).is_err() {
                warn!(reason = reason.as_str(), "client disconnected before terminal event");
            }
            return;
        }
    }
}
