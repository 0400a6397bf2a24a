// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracking of outbound send requests, from the outbound queue through the batches in flight.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::EventSendError;
use crate::interface::{MessageSendResult, SendToken};

/// Callback reporting the result of a send. Ownership of the message is handed back to the caller.
pub type SendCompleteCallback<M> = Box<dyn FnOnce(M, Result<(), EventSendError>) + Send>;

/// One call to [`send_async`](crate::TelemetryMessenger::send_async), not yet reported
pub(crate) struct SendRequest<M> {
    message: M,
    on_complete: SendCompleteCallback<M>,
}

impl<M> SendRequest<M> {
    pub fn new(message: M, on_complete: SendCompleteCallback<M>) -> Self {
        Self {
            message,
            on_complete,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    /// Report the result of this request to the caller. Consumes the request.
    pub fn complete(self, result: Result<(), EventSendError>) {
        (self.on_complete)(self.message, result);
    }
}

/// Requests waiting to be batched, in `send_async` order
pub(crate) struct OutboundQueue<M> {
    requests: VecDeque<SendRequest<M>>,
}

impl<M> Default for OutboundQueue<M> {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
        }
    }
}

impl<M> OutboundQueue<M> {
    pub fn push_back(&mut self, request: SendRequest<M>) {
        self.requests.push_back(request);
    }

    pub fn push_front(&mut self, request: SendRequest<M>) {
        self.requests.push_front(request);
    }

    pub fn pop_front(&mut self) -> Option<SendRequest<M>> {
        self.requests.pop_front()
    }

    /// Place `requests` ahead of everything already queued, preserving their order
    pub fn requeue_front(&mut self, requests: Vec<SendRequest<M>>) {
        for request in requests.into_iter().rev() {
            self.requests.push_front(request);
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SendRequest<M>> + '_ {
        self.requests.drain(..)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// A batch handed to the link layer, and the requests it carries
struct DeliveryTask<M> {
    requests: Vec<SendRequest<M>>,
    send_time: Instant,
    timed_out: bool,
}

impl<M> DeliveryTask<M> {
    /// Report `result` to every request, in the order they joined the batch
    fn fan_out(requests: Vec<SendRequest<M>>, result: Result<(), EventSendError>) {
        for request in requests {
            request.complete(result);
        }
    }
}

/// Batches in flight, keyed by the token handed to the link layer.
///
/// Tokens are allocated in increasing order and never reused, so iteration order is hand-off order.
pub(crate) struct InFlightTasks<M> {
    tasks: BTreeMap<SendToken, DeliveryTask<M>>,
    next_token: u64,
}

impl<M> Default for InFlightTasks<M> {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_token: 0,
        }
    }
}

impl<M> InFlightTasks<M> {
    /// Allocate the token for the next batch to be handed off
    pub fn next_token(&mut self) -> SendToken {
        let token = SendToken::new(self.next_token);
        self.next_token += 1;
        token
    }

    /// Track a batch that was just handed off with `token`
    pub fn track(&mut self, token: SendToken, requests: Vec<SendRequest<M>>) {
        self.tasks.insert(
            token,
            DeliveryTask {
                requests,
                send_time: Instant::now(),
                timed_out: false,
            },
        );
    }

    /// Handle the completion of the batch sent with `token`.
    ///
    /// Returns false if no batch is tracked for the token.
    pub fn on_send_complete(&mut self, token: SendToken, result: MessageSendResult) -> bool {
        let Some(task) = self.tasks.remove(&token) else {
            return false;
        };
        if task.timed_out {
            log::debug!("Batch {token:?} completed after timing out, already reported");
            return true;
        }
        let result = match result {
            MessageSendResult::Ok => Ok(()),
            other => {
                log::error!("Batch {token:?} failed to send ({other:?})");
                Err(EventSendError::FailSending)
            }
        };
        log::debug!(
            "Batch {token:?} completed, reporting to {} request(s)",
            task.requests.len()
        );
        DeliveryTask::fan_out(task.requests, result);
        true
    }

    /// Report [`EventSendError::Timeout`] for every batch in flight longer than `timeout`.
    ///
    /// Timed out batches stay tracked until their completion arrives, and are never reported twice.
    /// Returns the number of batches that timed out.
    pub fn process_timeouts(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut count = 0;
        for (token, task) in &mut self.tasks {
            if task.timed_out || now.saturating_duration_since(task.send_time) < timeout {
                continue;
            }
            task.timed_out = true;
            count += 1;
            log::info!(
                "Batch {token:?} timed out, reporting to {} request(s)",
                task.requests.len()
            );
            DeliveryTask::fan_out(std::mem::take(&mut task.requests), Err(EventSendError::Timeout));
        }
        count
    }

    /// Stop tracking every batch, returning the requests not yet reported in hand-off order
    pub fn drain_unnotified(&mut self) -> Vec<SendRequest<M>> {
        std::mem::take(&mut self.tasks)
            .into_values()
            .filter(|task| !task.timed_out)
            .flat_map(|task| task.requests)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
