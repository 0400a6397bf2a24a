// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packing of queued events into batch messages bounded by the peer's max message size.

use bytes::Bytes;
use thiserror::Error;

use crate::codec::MessageCodec;
use crate::error::{EventSendError, TransportError};
use crate::interface::{AmqpMessage, AmqpSession};
use crate::messenger::delivery::{InFlightTasks, OutboundQueue, SendRequest};
use crate::messenger::event_sender::EventSender;

/// Bytes of the peer's max message size reserved for the overhead of the batch message itself
pub(crate) const BATCHING_RESERVE_SIZE: u64 = 1024;

/// Reason a batching pass failed
#[derive(Debug, Error)]
pub(crate) enum BatchingError {
    #[error("could not get peer max message size: {0}")]
    PeerMaxMessageSize(#[source] TransportError),
    #[error(
        "peer max message size {0} does not exceed the batch reserve of {reserve} bytes",
        reserve = BATCHING_RESERVE_SIZE
    )]
    ReserveExceedsPeerMax(u64),
    #[error("could not hand batch to the event sender: {0}")]
    Send(#[source] TransportError),
}

/// Batch being filled, and the requests it carries
struct PendingBatch<M> {
    message: AmqpMessage,
    requests: Vec<SendRequest<M>>,
    bytes_pending: u64,
}

impl<M> Default for PendingBatch<M> {
    fn default() -> Self {
        Self {
            message: AmqpMessage::batch(),
            requests: Vec::new(),
            bytes_pending: 0,
        }
    }
}

impl<M> PendingBatch<M> {
    fn add(&mut self, request: SendRequest<M>, encoded: Bytes, size: u64) {
        self.message.add_body_data(encoded);
        self.requests.push(request);
        self.bytes_pending += size;
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Bytes available for encoded events in one batch
fn batching_budget<S: AmqpSession>(sender: &EventSender<S>) -> Result<u64, BatchingError> {
    let peer_max = sender
        .peer_max_message_size()
        .map_err(BatchingError::PeerMaxMessageSize)?;
    if peer_max <= BATCHING_RESERVE_SIZE {
        return Err(BatchingError::ReserveExceedsPeerMax(peer_max));
    }
    Ok(peer_max - BATCHING_RESERVE_SIZE)
}

/// Hand `batch` to the event sender and track it as in flight.
///
/// On failure every request of the batch is reported as [`EventSendError::FailSending`].
fn flush<S: AmqpSession, M>(
    batch: PendingBatch<M>,
    in_flight: &mut InFlightTasks<M>,
    sender: &mut EventSender<S>,
) -> Result<(), BatchingError> {
    let token = in_flight.next_token();
    let count = batch.requests.len();
    match sender.send_async(batch.message, token) {
        Ok(()) => {
            log::debug!(
                "Sent batch {token:?} of {count} event(s), {} bytes",
                batch.bytes_pending
            );
            in_flight.track(token, batch.requests);
            Ok(())
        }
        Err(e) => {
            log::error!("Failed sending batch of {count} event(s): {e}");
            for request in batch.requests {
                request.complete(Err(EventSendError::FailSending));
            }
            Err(BatchingError::Send(e))
        }
    }
}

/// Drain the outbound queue into as few batches as the peer's max message size allows.
///
/// Events are packed greedily in queue order. An event that cannot be encoded, or whose encoding
/// alone exceeds the batch budget, is reported to its caller and skipped without failing the pass.
///
/// # Errors
/// Returns a [`BatchingError`] if the batch budget cannot be determined or a batch cannot be
/// handed to the event sender. Requests not yet batched remain queued.
pub(crate) fn send_pending_events<S, C>(
    queue: &mut OutboundQueue<C::Message>,
    in_flight: &mut InFlightTasks<C::Message>,
    sender: &mut EventSender<S>,
    codec: &C,
) -> Result<(), BatchingError>
where
    S: AmqpSession,
    C: MessageCodec,
{
    let mut budget = None;
    let mut batch = PendingBatch::default();

    while let Some(request) = queue.pop_front() {
        let max_size = match budget {
            Some(max_size) => max_size,
            None => match batching_budget(sender) {
                Ok(max_size) => *budget.insert(max_size),
                Err(e) => {
                    log::error!("Cannot batch events: {e}");
                    request.complete(Err(EventSendError::FailSending));
                    return Err(e);
                }
            },
        };

        let encoded = match codec.encode(request.message()) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed encoding event, skipping it: {e}");
                request.complete(Err(EventSendError::CannotParse));
                continue;
            }
        };
        let size = u64::try_from(encoded.len()).unwrap_or(u64::MAX);
        if size > max_size {
            log::error!(
                "Event encodes to {size} bytes, larger than the {max_size} bytes allowed on the link, skipping it"
            );
            request.complete(Err(EventSendError::FailSending));
            continue;
        }

        if batch.bytes_pending + size > max_size {
            if let Err(e) = flush(std::mem::take(&mut batch), in_flight, sender) {
                queue.push_front(request);
                return Err(e);
            }
        }
        batch.add(request, encoded, size);
    }

    if !batch.is_empty() {
        flush(batch, in_flight, sender)?;
    }
    Ok(())
}
