//! Transport seam: how a DHT instance talks to other peers.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::common::{Message, MessageType, PeerId};
use crate::events::{EventStream, QueryEvent};
use crate::{Error, Result};

/// Protocol spoken by WAN (and unscoped) instances.
pub const WAN_PROTOCOL: &str = "/ipfs/kad/1.0.0";
/// Protocol spoken by LAN instances.
pub const LAN_PROTOCOL: &str = "/ipfs/lan/kad/1.0.0";

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Fires when the request should be abandoned.
    pub signal: CancellationToken,
    /// Give up waiting for a response after this long.
    pub timeout: Option<Duration>,
    /// Protocol the request is sent over.
    pub protocol: &'static str,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            signal: CancellationToken::new(),
            timeout: None,
            protocol: WAN_PROTOCOL,
        }
    }
}

/// Sends requests to remote peers.
///
/// An implementation yields a [QueryEvent::SendQuery] before the request goes
/// out, then exactly one [QueryEvent::PeerResponse] or [QueryEvent::QueryError].
/// [request_stream] builds that sequence from a plain request future.
pub trait Network: Send + Sync + 'static {
    fn send_request(&self, to: PeerId, message: Message, options: RequestOptions) -> EventStream;
}

/// Event sequence of a single request/response exchange with `to`.
pub fn request_stream<F>(
    to: PeerId,
    message_type: MessageType,
    options: RequestOptions,
    request: F,
) -> EventStream
where
    F: Future<Output = Result<Message>> + Send + 'static,
{
    let head = stream::iter([
        QueryEvent::DialPeer { peer: to.clone() },
        QueryEvent::SendQuery {
            to: to.clone(),
            message_type,
        },
    ]);

    let response = stream::once(async move {
        let result = tokio::select! {
            biased;
            _ = options.signal.cancelled() => Err(Error::Aborted),
            result = with_timeout(options.timeout, request) => result,
        };

        match result {
            Ok(response) => QueryEvent::PeerResponse {
                from: to,
                message_type: response.message_type,
                closer: response.closer_peers,
                providers: response.provider_peers,
                record: response.record,
            },
            Err(error) => QueryEvent::QueryError { from: to, error },
        }
    });

    head.chain(response).boxed()
}

async fn with_timeout<F>(timeout: Option<Duration>, request: F) -> Result<Message>
where
    F: Future<Output = Result<Message>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(Error::Timeout)),
        None => request.await,
    }
}
