//! Progress events produced incrementally by every lookup.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::common::{DhtRecord, MessageType, PeerId, PeerInfo};
use crate::Error;

/// Events buffered between a producer task and its consumer.
const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// A request is about to be sent to `to`.
    SendQuery {
        to: PeerId,
        message_type: MessageType,
    },
    /// A peer answered a request.
    PeerResponse {
        from: PeerId,
        message_type: MessageType,
        closer: Vec<PeerInfo>,
        providers: Vec<PeerInfo>,
        record: Option<DhtRecord>,
    },
    /// A peer that answers the lookup.
    FinalPeer { from: PeerId, peer: PeerInfo },
    /// A request to `from` failed, or the lookup ended without a result.
    QueryError { from: PeerId, error: Error },
    /// Providers of a key.
    Provider {
        from: PeerId,
        providers: Vec<PeerInfo>,
    },
    /// A value for the looked up key.
    Value { from: PeerId, value: Bytes },
    /// A connection to `peer` is being made.
    DialPeer { peer: PeerId },
}

impl QueryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::SendQuery { .. } => "SEND_QUERY",
            QueryEvent::PeerResponse { .. } => "PEER_RESPONSE",
            QueryEvent::FinalPeer { .. } => "FINAL_PEER",
            QueryEvent::QueryError { .. } => "QUERY_ERROR",
            QueryEvent::Provider { .. } => "PROVIDER",
            QueryEvent::Value { .. } => "VALUE",
            QueryEvent::DialPeer { .. } => "DIAL_PEER",
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            QueryEvent::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn final_peer(&self) -> Option<&PeerInfo> {
        match self {
            QueryEvent::FinalPeer { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            QueryEvent::QueryError { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// A lazily produced stream of [QueryEvent]s.
pub type EventStream = BoxStream<'static, QueryEvent>;

/// End `stream` as soon as `signal` fires.
pub(crate) fn abortable<T: Send + 'static>(
    stream: BoxStream<'static, T>,
    signal: &CancellationToken,
) -> BoxStream<'static, T> {
    stream.take_until(signal.clone().cancelled_owned()).boxed()
}

/// Sending half handed to the producer of a [spawn_stream].
pub(crate) struct StreamSender<T>(flume::Sender<T>);

impl<T> StreamSender<T> {
    /// Returns `false` once the consumer dropped the stream.
    pub async fn send(&self, item: T) -> bool {
        self.0.send_async(item).await.is_ok()
    }
}

/// Run `producer` as a task feeding the returned stream.
///
/// The producer gets a child token of `signal`, cancelled when `signal` fires
/// or when the consumer drops the stream; either way the producer future is
/// dropped along with every request it has in flight.
pub(crate) fn spawn_stream<T, F, Fut>(signal: &CancellationToken, producer: F) -> BoxStream<'static, T>
where
    T: Send + 'static,
    F: FnOnce(StreamSender<T>, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = signal.child_token();
    let (sender, receiver) = flume::bounded(EVENT_BUFFER);

    let producer = producer(StreamSender(sender), token.clone());
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            _ = producer => {}
        }
    });

    GuardedStream {
        inner: abortable(receiver.into_stream().boxed(), &token),
        _guard: token.drop_guard(),
    }
    .boxed()
}

/// Cancels its producer when dropped.
struct GuardedStream<T> {
    inner: BoxStream<'static, T>,
    _guard: DropGuard,
}

impl<T> Stream for GuardedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn spawned_stream_yields_in_order() {
        let signal = CancellationToken::new();

        let stream = spawn_stream(&signal, |sender, _| async move {
            for i in 0..40 {
                if !sender.send(i).await {
                    return;
                }
            }
        });

        assert_eq!(stream.collect::<Vec<_>>().await, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_producer() {
        let signal = CancellationToken::new();
        let (done_tx, done_rx) = flume::bounded::<CancellationToken>(1);

        let mut stream = spawn_stream(&signal, move |sender, token| async move {
            let _ = done_tx.send(token);
            let mut i = 0_u32;
            while sender.send(i).await {
                i += 1;
            }
        });

        assert_eq!(stream.next().await, Some(0));
        let token = done_rx.recv_async().await.unwrap();
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn signal_ends_the_stream() {
        let signal = CancellationToken::new();

        let mut stream = spawn_stream(&signal, |sender, _| async move {
            let _ = sender.send(1).await;
            futures::future::pending::<()>().await;
        });

        assert_eq!(stream.next().await, Some(1));
        signal.cancel();
        assert_eq!(stream.next().await, None);
    }
}
