use std::sync::Arc;

use bytes::Bytes;
use control_plane::SessionStore;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ByteStream;

/// Endpoint announcement emitted by legacy event-stream backends.
pub const SSE_SESSION_MARKER: &str = "/messages/?session_id=";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerRewrite {
    pub chunk: Bytes,
    pub session_id: Option<String>,
}

/// Prefixes every marker occurrence in `chunk` with `/adapters/{adapter}`.
/// Returns `None` when the chunk carries no marker.
pub fn rewrite_session_marker(chunk: &[u8], adapter: &str) -> Option<MarkerRewrite> {
    let text = String::from_utf8_lossy(chunk);
    // ASCII lowering keeps byte offsets aligned with `text`.
    let lowered = text.to_ascii_lowercase();
    let positions: Vec<usize> = lowered
        .match_indices(SSE_SESSION_MARKER)
        .map(|(index, _)| index)
        .collect();
    let first = *positions.first()?;

    let prefix = format!("/adapters/{adapter}");
    let mut rewritten = String::with_capacity(text.len() + prefix.len() * positions.len());
    let mut cursor = 0;
    for position in &positions {
        rewritten.push_str(&text[cursor..*position]);
        rewritten.push_str(&prefix);
        cursor = *position;
    }
    rewritten.push_str(&text[cursor..]);

    let after = &text[first + SSE_SESSION_MARKER.len()..];
    let session_id: String = after
        .chars()
        .take_while(|ch| !ch.is_whitespace() && *ch != '&')
        .collect();

    Some(MarkerRewrite {
        chunk: Bytes::from(rewritten),
        session_id: (!session_id.is_empty()).then_some(session_id),
    })
}

/// Relays `upstream` unchanged until it ends or `cancel` fires.
pub fn relay_until_cancelled(upstream: ByteStream, cancel: CancellationToken) -> ByteStream {
    Box::pin(upstream.take_until(cancel.cancelled_owned()))
}

struct RelayState {
    upstream: ByteStream,
    adapter: String,
    target: String,
    sessions: Arc<dyn SessionStore>,
    cancel: CancellationToken,
    marker_seen: bool,
}

/// Relays a legacy event stream chunk by chunk, rewriting the first chunk
/// that announces the message endpoint and recording its session.
pub fn relay_event_stream(
    upstream: ByteStream,
    adapter: String,
    target: String,
    sessions: Arc<dyn SessionStore>,
    cancel: CancellationToken,
) -> ByteStream {
    let state = RelayState {
        upstream,
        adapter,
        target,
        sessions,
        cancel,
        marker_seen: false,
    };
    let stream = futures_util::stream::unfold(state, |mut state| async move {
        let next = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {
                debug!(adapter = %state.adapter, "event stream relay cancelled");
                return None;
            }
            next = state.upstream.next() => next,
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                warn!(adapter = %state.adapter, error = %err, "event stream upstream failed");
                return None;
            }
            None => {
                debug!(adapter = %state.adapter, "event stream upstream ended");
                return None;
            }
        };
        if state.marker_seen {
            return Some((Ok::<Bytes, std::io::Error>(chunk), state));
        }
        let Some(rewrite) = rewrite_session_marker(&chunk, &state.adapter) else {
            return Some((Ok::<Bytes, std::io::Error>(chunk), state));
        };
        state.marker_seen = true;
        match rewrite.session_id.as_deref() {
            Some(session_id) => match state.sessions.set(session_id, &state.target).await {
                Ok(()) => info!(
                    adapter = %state.adapter,
                    session_id,
                    target = %state.target,
                    "new event stream session"
                ),
                Err(err) => warn!(
                    adapter = %state.adapter,
                    session_id,
                    error = %err,
                    "failed to record event stream session"
                ),
            },
            None => warn!(adapter = %state.adapter, "message endpoint announced without session id"),
        }
        Some((Ok::<Bytes, std::io::Error>(rewrite.chunk), state))
    });
    Box::pin(stream)
}
