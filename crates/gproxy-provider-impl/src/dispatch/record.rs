use std::future::Future;

use bytes::{Bytes, BytesMut};
use futures_util::stream::unfold;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use gproxy_provider_core::BodyStream;

enum TeeEvent {
    Chunk(Bytes),
    Failed(String),
}

/// What the caller received, as seen by the recorder.
pub(super) struct Captured {
    pub body: Bytes,
    pub truncated: bool,
    pub stream_error: Option<String>,
}

/// Forwards `upstream` untouched while copying up to `capture_limit` bytes to
/// a background task. `on_complete` runs once the stream ends or is dropped.
pub(super) fn tee_stream<F, Fut>(
    upstream: BodyStream,
    capture_limit: usize,
    on_complete: F,
) -> BodyStream
where
    F: FnOnce(Captured) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<TeeEvent>(256);
    tokio::spawn(async move {
        let mut body = BytesMut::new();
        let mut truncated = false;
        let mut stream_error = None;
        while let Some(event) = rx.recv().await {
            match event {
                TeeEvent::Chunk(chunk) => {
                    let room = capture_limit.saturating_sub(body.len());
                    if chunk.len() > room {
                        truncated = true;
                    }
                    body.extend_from_slice(&chunk[..room.min(chunk.len())]);
                }
                TeeEvent::Failed(err) => stream_error = Some(err),
            }
        }
        on_complete(Captured {
            body: body.freeze(),
            truncated,
            stream_error,
        })
        .await;
    });

    let stream = unfold((upstream, tx), |(mut upstream, tx)| async move {
        match upstream.next().await {
            Some(Ok(bytes)) => {
                let _ = tx.send(TeeEvent::Chunk(bytes.clone())).await;
                Some((Ok(bytes), (upstream, tx)))
            }
            Some(Err(err)) => {
                let _ = tx.send(TeeEvent::Failed(err.to_string())).await;
                Some((Err(err), (upstream, tx)))
            }
            None => None,
        }
    });
    Box::pin(stream)
}
