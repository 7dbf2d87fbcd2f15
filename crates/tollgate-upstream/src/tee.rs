//! Forward an upstream byte stream to the caller while buffering it
//!
//! The upstream is drained by a spawned task, so a caller that goes away only
//! stops the forwarding side. The task always reaches its finish callback,
//! whether the stream ended, failed or ran past its deadline.

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

const CLIENT_BUFFER: usize = 32;

/// How the upstream stream stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Failed(String),
    TimedOut,
}

/// Everything received from upstream
#[derive(Debug)]
pub struct TeeOutcome {
    pub body: Bytes,
    pub chunks: usize,
    pub end: StreamEnd,
    /// Whether the caller was still reading when the stream stopped
    pub client_connected: bool,
}

/// Start draining `upstream` and return the caller-facing stream
///
/// `finish` runs once, on the draining task, after the last chunk.
pub fn spawn_tee<S, E, F, Fut>(
    upstream: S,
    timeout: Duration,
    finish: F,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    F: FnOnce(TeeOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);

    tokio::spawn(async move {
        let outcome = drain(upstream, Instant::now() + timeout, tx).await;
        finish(outcome).await;
    });

    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

async fn drain<S, E>(upstream: S, deadline: Instant, tx: mpsc::Sender<Result<Bytes, io::Error>>) -> TeeOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut body = BytesMut::new();
    let mut chunks = 0;
    let mut client = Some(tx);

    let end = loop {
        match tokio::time::timeout_at(deadline, upstream.next()).await {
            Err(_) => break StreamEnd::TimedOut,
            Ok(None) => break StreamEnd::Completed,
            Ok(Some(Err(e))) => break StreamEnd::Failed(e.to_string()),
            Ok(Some(Ok(chunk))) => {
                chunks += 1;
                body.extend_from_slice(&chunk);
                if let Some(tx) = &client
                    && tx.send(Ok(chunk)).await.is_err()
                {
                    tracing::debug!(chunks, "client disconnected, draining upstream");
                    client = None;
                }
            }
        }
    };

    if let Some(tx) = &client {
        let message = match &end {
            StreamEnd::Completed => None,
            StreamEnd::Failed(message) => Some(message.clone()),
            StreamEnd::TimedOut => Some("upstream stream timed out".to_owned()),
        };
        // Abort the caller's response so a truncated body is not mistaken for a complete one
        if let Some(message) = message {
            let _ = tx.send(Err(io::Error::other(message))).await;
        }
    }

    TeeOutcome {
        body: body.freeze(),
        chunks,
        end,
        client_connected: client.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream;
    use tokio::sync::{Mutex, oneshot};

    use super::*;

    fn chunks(n: usize) -> Vec<Result<Bytes, io::Error>> {
        (0..n).map(|i| Ok(Bytes::from(format!("chunk-{i};")))).collect()
    }

    #[tokio::test]
    async fn forwards_and_buffers_everything() {
        let (done_tx, done_rx) = oneshot::channel();
        let client = spawn_tee(stream::iter(chunks(3)), Duration::from_secs(5), |outcome| async move {
            let _ = done_tx.send(outcome);
        });

        let received: Vec<Bytes> = client.map(Result::unwrap).collect().await;
        let outcome = done_rx.await.unwrap();

        assert_eq!(received.len(), 3);
        assert_eq!(outcome.body, Bytes::from("chunk-0;chunk-1;chunk-2;"));
        assert_eq!(outcome.end, StreamEnd::Completed);
        assert!(outcome.client_connected);
    }

    #[tokio::test]
    async fn keeps_draining_after_client_disconnects() {
        let (done_tx, done_rx) = oneshot::channel();
        let upstream = stream::iter(chunks(10)).then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            chunk
        });
        let client = spawn_tee(Box::pin(upstream), Duration::from_secs(5), |outcome| async move {
            let _ = done_tx.send(outcome);
        });

        let mut client = Box::pin(client);
        client.next().await.unwrap().unwrap();
        client.next().await.unwrap().unwrap();
        drop(client);

        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.chunks, 10);
        assert!(outcome.body.ends_with(b"chunk-9;"));
        assert_eq!(outcome.end, StreamEnd::Completed);
        assert!(!outcome.client_connected);
    }

    #[tokio::test]
    async fn stuck_stream_is_timed_out() {
        let seen = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = oneshot::channel();
        let upstream = stream::iter(chunks(1)).chain(stream::pending());
        let recorded = seen.clone();
        let client = spawn_tee(Box::pin(upstream), Duration::from_millis(50), move |outcome| async move {
            *recorded.lock().await = Some(outcome.end.clone());
            let _ = done_tx.send(());
        });

        let items: Vec<_> = client.collect().await;
        done_rx.await.unwrap();

        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert_eq!(*seen.lock().await, Some(StreamEnd::TimedOut));
    }

    #[tokio::test]
    async fn upstream_error_ends_stream() {
        let (done_tx, done_rx) = oneshot::channel();
        let upstream = stream::iter(vec![
            Ok(Bytes::from("a")),
            Err(io::Error::other("reset by peer")),
            Ok(Bytes::from("never")),
        ]);
        let client = spawn_tee(upstream, Duration::from_secs(5), |outcome| async move {
            let _ = done_tx.send(outcome);
        });

        let _: Vec<_> = client.collect().await;
        let outcome = done_rx.await.unwrap();

        assert_eq!(outcome.body, Bytes::from("a"));
        assert_eq!(outcome.end, StreamEnd::Failed("reset by peer".to_owned()));
    }
}
