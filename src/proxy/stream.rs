//! Streaming relay.
//!
//! Forwards backend chunks to the caller one-for-one, in order, without
//! buffering the whole response. Two timers bound the relay: an idle timer
//! restarted by every chunk and a total deadline fixed when the request
//! started. Both are checked at every chunk boundary. Once bytes have reached
//! the caller a failure can no longer be retried, so the relay appends a
//! terminal error event and ends the stream cleanly instead.
//!
//! Upstream chunks are transport reads, not whole SSE events. If the last
//! chunk sent stopped mid-event, the error event is preceded by a blank line
//! so it is parsed as an event of its own.
//!
//! The in-flight guard of the serving backend lives inside the relay state,
//! so the backend's counter is released however the stream ends: completion,
//! upstream failure, timeout, or the caller going away (axum drops the body).

use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::Error;
use crate::registry::InFlightGuard;

type Upstream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct Relay<E> {
    backend_id: String,
    upstream: Upstream<E>,
    first: Option<Bytes>,
    idle_timeout: Duration,
    deadline: Instant,
    chunks: u64,
    /// Whether the bytes sent so far end on an SSE event boundary.
    at_event_boundary: bool,
    finished: bool,
    guard: InFlightGuard,
}

impl<E> Relay<E> {
    /// Build the terminal error event and mark the relay finished.
    fn abort(&mut self, message: String) -> Bytes {
        self.finished = true;
        self.guard.backend().record_error();
        let err = Error::StreamAborted {
            backend: self.backend_id.clone(),
            message,
        };
        tracing::warn!(
            backend = %self.backend_id,
            chunks = self.chunks,
            error = %err,
            "Stream aborted after response was committed"
        );
        if self.at_event_boundary {
            error_marker(&err)
        } else {
            let mut marker = b"\n\n".to_vec();
            marker.extend_from_slice(&error_marker(&err));
            Bytes::from(marker)
        }
    }

    fn sent(&mut self, chunk: &Bytes) {
        self.chunks += 1;
        if !chunk.is_empty() {
            self.at_event_boundary = ends_event(chunk);
        }
    }
}

fn ends_event(chunk: &[u8]) -> bool {
    chunk.ends_with(b"\n\n") || chunk.ends_with(b"\r\n\r\n") || chunk.ends_with(b"\r\r")
}

/// Encode `err` as the terminal SSE event sent after a mid-stream failure.
///
/// The payload is the same JSON error object non-streaming failures return.
pub fn error_marker(err: &Error) -> Bytes {
    Bytes::from(format!("data: {}\n\n", err.to_body()))
}

/// Relay an upstream byte stream to the caller.
///
/// `first` is a chunk already read from `upstream` (the handler peeks one
/// chunk before committing the response) and is emitted before anything else.
pub fn relay_stream<S, E>(
    backend_id: String,
    first: Option<Bytes>,
    upstream: S,
    idle_timeout: Duration,
    deadline: Instant,
    guard: InFlightGuard,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let relay = Relay {
        backend_id,
        upstream: Box::pin(upstream),
        first,
        idle_timeout,
        deadline,
        chunks: 0,
        at_event_boundary: true,
        finished: false,
        guard,
    };

    futures::stream::unfold(relay, |mut relay| async move {
        if relay.finished {
            return None;
        }

        if let Some(first) = relay.first.take() {
            relay.sent(&first);
            return Some((Ok(first), relay));
        }

        // An upstream that is always ready would otherwise never see the timer.
        if Instant::now() >= relay.deadline {
            let marker = relay.abort("total stream timeout exceeded".to_string());
            return Some((Ok(marker), relay));
        }

        let idle_deadline = (Instant::now() + relay.idle_timeout).min(relay.deadline);
        match tokio::time::timeout_at(idle_deadline, relay.upstream.next()).await {
            Ok(Some(Ok(chunk))) => {
                relay.sent(&chunk);
                Some((Ok(chunk), relay))
            }
            Ok(Some(Err(e))) => {
                let marker = relay.abort(format!("upstream error: {}", e));
                Some((Ok(marker), relay))
            }
            Ok(None) => {
                tracing::debug!(
                    backend = %relay.backend_id,
                    chunks = relay.chunks,
                    "Stream completed"
                );
                None
            }
            Err(_) => {
                let message = if Instant::now() >= relay.deadline {
                    "total stream timeout exceeded".to_string()
                } else {
                    format!(
                        "no data for {}s (idle timeout)",
                        relay.idle_timeout.as_secs()
                    )
                };
                let marker = relay.abort(message);
                Some((Ok(marker), relay))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::registry::Backend;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    type Chunk = Result<Bytes, String>;

    fn backend() -> Arc<Backend> {
        Arc::new(Backend::new(BackendConfig {
            id: "gpu-a".to_string(),
            url: "http://gpu-a.test/v1".to_string(),
            api_key: None,
            models: vec!["llama".to_string()],
            model_map: BTreeMap::new(),
            rate_limit: None,
        }))
    }

    fn relay(
        backend: &Arc<Backend>,
        first: Option<Bytes>,
        rx: mpsc::Receiver<Chunk>,
        idle: Duration,
        total: Duration,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        relay_stream(
            "gpu-a".to_string(),
            first,
            ReceiverStream::new(rx),
            idle,
            Instant::now() + total,
            backend.begin_request(),
        )
    }

    async fn collect(stream: impl Stream<Item = Result<Bytes, std::io::Error>>) -> Vec<Bytes> {
        stream.map(|item| item.unwrap()).collect().await
    }

    fn marker_json(chunk: &Bytes) -> serde_json::Value {
        let text = std::str::from_utf8(chunk).unwrap();
        let payload = text
            .trim_start_matches('\n')
            .strip_prefix("data: ")
            .and_then(|t| t.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn relays_chunks_in_order() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        for chunk in ["a", "b", "c"] {
            tx.send(Ok(Bytes::from(chunk))).await.unwrap();
        }
        drop(tx);

        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out, vec!["a", "b", "c"]);
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.total_errors(), 0);
    }

    #[tokio::test]
    async fn peeked_chunk_comes_first() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from("b"))).await.unwrap();
        drop(tx);

        let out = collect(relay(
            &backend,
            Some(Bytes::from("a")),
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn upstream_failure_appends_error_marker() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from("data: 1\n\n"))).await.unwrap();
        tx.send(Ok(Bytes::from("data: 2\n\n"))).await.unwrap();
        tx.send(Err("connection reset".to_string())).await.unwrap();

        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "data: 1\n\n");
        assert_eq!(out[1], "data: 2\n\n");
        let marker = marker_json(&out[2]);
        assert_eq!(marker["error"]["type"], "stream_aborted");
        assert!(marker["error"]["message"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.total_errors(), 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_stream() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from("a"))).await.unwrap();

        // Sender stays open but silent.
        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(5),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out.len(), 2);
        let marker = marker_json(&out[1]);
        assert!(marker["error"]["message"]
            .as_str()
            .unwrap()
            .contains("idle timeout"));
        assert_eq!(backend.in_flight(), 0);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn total_deadline_ends_stream() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);

        // A backend that trickles a chunk every second never trips the idle timer.
        let producer = tokio::spawn(async move {
            loop {
                if tx.send(Ok(Bytes::from("tick"))).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let start = Instant::now();
        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(5),
            Duration::from_secs(30),
        ))
        .await;

        assert!(start.elapsed() >= Duration::from_secs(30));
        let marker = marker_json(out.last().unwrap());
        assert!(marker["error"]["message"]
            .as_str()
            .unwrap()
            .contains("total stream timeout"));
        assert!(out.len() > 2);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn marker_after_partial_event_starts_new_event() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        )))
        .await
        .unwrap();
        tx.send(Ok(Bytes::from("data: {\"choices\":[{\"del")))
            .await
            .unwrap();
        tx.send(Err("connection reset".to_string())).await.unwrap();

        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out.len(), 3);
        let wire: Vec<u8> = out.iter().flat_map(|c| c.iter().copied()).collect();
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.ends_with("\n\n"));
        let last_event = wire
            .trim_end_matches('\n')
            .rsplit("\n\n")
            .next()
            .unwrap();
        let payload = last_event.strip_prefix("data: ").unwrap();
        let marker: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(marker["error"]["type"], "stream_aborted");
        assert_eq!(backend.total_errors(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn marker_after_complete_event_has_no_padding() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from("data: 1\r\n\r\n"))).await.unwrap();
        tx.send(Err("connection reset".to_string())).await.unwrap();

        let out = collect(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
        .await;

        assert_eq!(out.len(), 2);
        assert!(out[1].starts_with(b"data: "));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn total_deadline_applies_to_always_ready_upstream() {
        let backend = backend();
        let upstream =
            futures::stream::repeat_with(|| Ok::<_, String>(Bytes::from("data: tick\n\n")));
        let mut stream = Box::pin(relay_stream(
            "gpu-a".to_string(),
            None,
            upstream,
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(30),
            backend.begin_request(),
        ));

        for _ in 0..3 {
            assert_eq!(stream.next().await.unwrap().unwrap(), "data: tick\n\n");
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        let marker = marker_json(&stream.next().await.unwrap().unwrap());
        assert!(marker["error"]["message"]
            .as_str()
            .unwrap()
            .contains("total stream timeout"));
        assert!(stream.next().await.is_none());
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_relay_releases_backend_and_upstream() {
        let backend = backend();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from("a"))).await.unwrap();

        let mut stream = Box::pin(relay(
            &backend,
            None,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(backend.in_flight(), 1);

        // Caller disconnects.
        drop(stream);

        assert_eq!(backend.in_flight(), 0);
        tx.closed().await;
        assert!(tx.is_closed());
    }
}
