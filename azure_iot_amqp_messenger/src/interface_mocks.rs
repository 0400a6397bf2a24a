// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bespoke mocks for relevant traits defined in the interface module.
//!
//! A [`MockSession`] records every operation performed on it and on the links, senders and
//! receivers created from it, and can be instructed to fail operations or to report events as
//! the link layer would. All clones of a [`MockSession`] share the same state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::TransportError;
use crate::interface::{
    AmqpLink, AmqpMessage, AmqpMessageReceiver, AmqpMessageSender, AmqpSession, AttachProperties,
    DeliveryNumber, DeliveryOutcome, LinkRole, MessageSendResult, ReceivedMessage, ReceiverEvent,
    ReceiverEventSink, ReceiverSettleMode, ReceiverState, SendToken, SenderEvent, SenderEventSink,
    SenderState,
};

/// Peer max message size reported by default
pub const DEFAULT_MOCK_PEER_MAX_MESSAGE_SIZE: u64 = 256 * 1024;

/// Record of a link created on a [`MockSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLinkRecord {
    /// Name of the link
    pub name: String,
    /// Role of the link
    pub role: LinkRole,
    /// Source address
    pub source: String,
    /// Target address
    pub target: String,
    /// Max message size set on the link, if any
    pub max_message_size: Option<u64>,
    /// Attach properties set on the link
    pub attach_properties: AttachProperties,
    /// Receiver settle mode set on the link, if any
    pub settle_mode: Option<ReceiverSettleMode>,
}

/// Operations the mock can be instructed to fail
#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    link_creation: bool,
    sender_creation: bool,
    sender_open: bool,
    receiver_creation: bool,
    receiver_open: bool,
    send: bool,
    peer_max_message_size: bool,
    receiver_link_name: bool,
    disposition: bool,
}

#[derive(Debug)]
struct MockState {
    failures: Failures,
    peer_max_message_size: u64,
    links: Vec<MockLinkRecord>,
    live_links: usize,
    live_senders: usize,
    live_receivers: usize,
    senders_opened: usize,
    receivers_opened: usize,
    receivers_closed: usize,
    next_id: u64,
    /// Event sink of the most recently created sender, and its id
    sender_events: Option<(u64, SenderEventSink)>,
    sender_state: SenderState,
    /// Event sink of the most recently created receiver, and its id
    receiver_events: Option<(u64, ReceiverEventSink)>,
    receiver_state: ReceiverState,
    sent: Vec<(SendToken, AmqpMessage)>,
    pending_sends: Vec<SendToken>,
    dispositions: Vec<(String, DeliveryNumber, DeliveryOutcome)>,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notify_sender(&self, event: SenderEvent) {
        if let Some((_, sink)) = &self.sender_events {
            if sink.notify(event).is_err() {
                log::debug!("Mock sender event dropped, sender already torn down");
            }
        }
    }

    fn notify_receiver(&self, event: ReceiverEvent) {
        if let Some((_, sink)) = &self.receiver_events {
            if sink.notify(event).is_err() {
                log::debug!("Mock receiver event dropped, receiver already torn down");
            }
        }
    }
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected(operation: &'static str) -> TransportError {
    TransportError::new(operation, "injected failure")
}

/// Mock implementation of an AMQP session.
#[derive(Debug, Clone)]
pub struct MockSession {
    state: SharedState,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Return a new mocked AMQP session where all operations succeed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                failures: Failures::default(),
                peer_max_message_size: DEFAULT_MOCK_PEER_MAX_MESSAGE_SIZE,
                links: Vec::new(),
                live_links: 0,
                live_senders: 0,
                live_receivers: 0,
                senders_opened: 0,
                receivers_opened: 0,
                receivers_closed: 0,
                next_id: 0,
                sender_events: None,
                sender_state: SenderState::Idle,
                receiver_events: None,
                receiver_state: ReceiverState::Idle,
                sent: Vec::new(),
                pending_sends: Vec::new(),
                dispositions: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    // ---------- Failure injection ----------

    /// Fail link creation
    pub fn fail_link_creation(&self, fail: bool) {
        self.state().failures.link_creation = fail;
    }

    /// Fail message sender creation
    pub fn fail_sender_creation(&self, fail: bool) {
        self.state().failures.sender_creation = fail;
    }

    /// Fail opening message senders
    pub fn fail_sender_open(&self, fail: bool) {
        self.state().failures.sender_open = fail;
    }

    /// Fail message receiver creation
    pub fn fail_receiver_creation(&self, fail: bool) {
        self.state().failures.receiver_creation = fail;
    }

    /// Fail opening message receivers
    pub fn fail_receiver_open(&self, fail: bool) {
        self.state().failures.receiver_open = fail;
    }

    /// Fail handing messages to message senders
    pub fn fail_send(&self, fail: bool) {
        self.state().failures.send = fail;
    }

    /// Fail querying the peer max message size of links
    pub fn fail_peer_max_message_size(&self, fail: bool) {
        self.state().failures.peer_max_message_size = fail;
    }

    /// Fail querying the link name of message receivers
    pub fn fail_receiver_link_name(&self, fail: bool) {
        self.state().failures.receiver_link_name = fail;
    }

    /// Fail sending dispositions
    pub fn fail_disposition(&self, fail: bool) {
        self.state().failures.disposition = fail;
    }

    /// Set the peer max message size reported by links
    pub fn set_peer_max_message_size(&self, max_message_size: u64) {
        self.state().peer_max_message_size = max_message_size;
    }

    // ---------- Event injection ----------

    /// Report a state change of the current message sender
    pub fn set_sender_state(&self, new_state: SenderState) {
        let mut state = self.state();
        let previous_state = std::mem::replace(&mut state.sender_state, new_state);
        state.notify_sender(SenderEvent::StateChanged {
            new_state,
            previous_state,
        });
    }

    /// Report a state change of the current message receiver
    pub fn set_receiver_state(&self, new_state: ReceiverState) {
        let mut state = self.state();
        let previous_state = std::mem::replace(&mut state.receiver_state, new_state);
        state.notify_receiver(ReceiverEvent::StateChanged {
            new_state,
            previous_state,
        });
    }

    /// Report completion of the send identified by `token` on the current message sender
    pub fn complete_send(&self, token: SendToken, result: MessageSendResult) {
        let mut state = self.state();
        state.pending_sends.retain(|pending| *pending != token);
        let outcome = match result {
            MessageSendResult::Ok => Some(DeliveryOutcome::Accepted),
            _ => None,
        };
        state.notify_sender(SenderEvent::SendComplete {
            token,
            result,
            outcome,
        });
    }

    /// Report completion of every send not yet completed, in send order
    pub fn complete_all_sends(&self, result: MessageSendResult) {
        let pending = std::mem::take(&mut self.state().pending_sends);
        for token in pending {
            self.complete_send(token, result);
        }
    }

    /// Deliver a message on the current message receiver
    pub fn deliver_message(&self, delivery_number: DeliveryNumber, message: AmqpMessage) {
        self.state()
            .notify_receiver(ReceiverEvent::MessageReceived(ReceivedMessage {
                delivery_number,
                message,
            }));
    }

    // ---------- Inspection ----------

    /// Every link created so far
    #[must_use]
    pub fn links(&self) -> Vec<MockLinkRecord> {
        self.state().links.clone()
    }

    /// Every message handed to a message sender so far, with its token
    #[must_use]
    pub fn sent(&self) -> Vec<(SendToken, AmqpMessage)> {
        self.state().sent.clone()
    }

    /// Tokens of sends not yet completed
    #[must_use]
    pub fn pending_sends(&self) -> Vec<SendToken> {
        self.state().pending_sends.clone()
    }

    /// Every disposition sent so far, as `(link name, delivery number, outcome)`
    #[must_use]
    pub fn dispositions(&self) -> Vec<(String, DeliveryNumber, DeliveryOutcome)> {
        self.state().dispositions.clone()
    }

    /// Number of links not yet destroyed
    #[must_use]
    pub fn live_links(&self) -> usize {
        self.state().live_links
    }

    /// Number of message senders not yet destroyed
    #[must_use]
    pub fn live_senders(&self) -> usize {
        self.state().live_senders
    }

    /// Number of message receivers not yet destroyed
    #[must_use]
    pub fn live_receivers(&self) -> usize {
        self.state().live_receivers
    }

    /// Number of successful message sender opens
    #[must_use]
    pub fn senders_opened(&self) -> usize {
        self.state().senders_opened
    }

    /// Number of successful message receiver opens
    #[must_use]
    pub fn receivers_opened(&self) -> usize {
        self.state().receivers_opened
    }

    /// Number of message receiver closes
    #[must_use]
    pub fn receivers_closed(&self) -> usize {
        self.state().receivers_closed
    }
}

impl AmqpSession for MockSession {
    type Link = MockLink;
    type Sender = MockSender;
    type Receiver = MockReceiver;

    fn create_link(
        &self,
        name: &str,
        role: LinkRole,
        source: &str,
        target: &str,
    ) -> Result<MockLink, TransportError> {
        let mut state = self.state();
        if state.failures.link_creation {
            return Err(injected("create_link"));
        }
        state.links.push(MockLinkRecord {
            name: name.to_string(),
            role,
            source: source.to_string(),
            target: target.to_string(),
            max_message_size: None,
            attach_properties: AttachProperties::new(),
            settle_mode: None,
        });
        state.live_links += 1;
        Ok(MockLink {
            index: state.links.len() - 1,
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    fn create_message_sender(
        &self,
        link: &MockLink,
        events: SenderEventSink,
    ) -> Result<MockSender, TransportError> {
        let mut state = self.state();
        if state.failures.sender_creation {
            return Err(injected("create_message_sender"));
        }
        let id = state.next_id();
        state.sender_events = Some((id, events));
        state.sender_state = SenderState::Idle;
        state.live_senders += 1;
        log::debug!("Mock sender {id} created on link {}", link.name);
        Ok(MockSender {
            id,
            state: self.state.clone(),
        })
    }

    fn create_message_receiver(
        &self,
        link: &MockLink,
        events: ReceiverEventSink,
    ) -> Result<MockReceiver, TransportError> {
        let mut state = self.state();
        if state.failures.receiver_creation {
            return Err(injected("create_message_receiver"));
        }
        let id = state.next_id();
        state.receiver_events = Some((id, events));
        state.receiver_state = ReceiverState::Idle;
        state.live_receivers += 1;
        Ok(MockReceiver {
            id,
            link_name: link.name.clone(),
            state: self.state.clone(),
        })
    }
}

/// Mock implementation of an AMQP link.
#[derive(Debug)]
pub struct MockLink {
    index: usize,
    name: String,
    state: SharedState,
}

impl AmqpLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_max_message_size(&mut self, max_message_size: u64) -> Result<(), TransportError> {
        lock(&self.state).links[self.index].max_message_size = Some(max_message_size);
        Ok(())
    }

    fn set_attach_properties(
        &mut self,
        properties: AttachProperties,
    ) -> Result<(), TransportError> {
        lock(&self.state).links[self.index].attach_properties = properties;
        Ok(())
    }

    fn set_receiver_settle_mode(
        &mut self,
        mode: ReceiverSettleMode,
    ) -> Result<(), TransportError> {
        lock(&self.state).links[self.index].settle_mode = Some(mode);
        Ok(())
    }

    fn peer_max_message_size(&self) -> Result<u64, TransportError> {
        let state = lock(&self.state);
        if state.failures.peer_max_message_size {
            return Err(injected("peer_max_message_size"));
        }
        Ok(state.peer_max_message_size)
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        lock(&self.state).live_links -= 1;
    }
}

/// Mock implementation of an AMQP message sender.
///
/// Opening reports a change to [`SenderState::Opening`]. Further state changes and send
/// completions are reported through the [`MockSession`].
#[derive(Debug)]
pub struct MockSender {
    id: u64,
    state: SharedState,
}

impl AmqpMessageSender for MockSender {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failures.sender_open {
            return Err(injected("open"));
        }
        state.senders_opened += 1;
        state.sender_state = SenderState::Opening;
        state.notify_sender(SenderEvent::StateChanged {
            new_state: SenderState::Opening,
            previous_state: SenderState::Idle,
        });
        Ok(())
    }

    fn send_async(&mut self, message: AmqpMessage, token: SendToken) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failures.send {
            return Err(injected("send_async"));
        }
        state.sent.push((token, message));
        state.pending_sends.push(token);
        Ok(())
    }
}

impl Drop for MockSender {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_senders -= 1;
        if matches!(state.sender_events, Some((id, _)) if id == self.id) {
            state.sender_events = None;
            state.sender_state = SenderState::Idle;
        }
    }
}

/// Mock implementation of an AMQP message receiver.
///
/// Opening reports a change to [`ReceiverState::Opening`]. Further state changes and received
/// messages are reported through the [`MockSession`].
#[derive(Debug)]
pub struct MockReceiver {
    id: u64,
    link_name: String,
    state: SharedState,
}

impl AmqpMessageReceiver for MockReceiver {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failures.receiver_open {
            return Err(injected("open"));
        }
        state.receivers_opened += 1;
        state.receiver_state = ReceiverState::Opening;
        state.notify_receiver(ReceiverEvent::StateChanged {
            new_state: ReceiverState::Opening,
            previous_state: ReceiverState::Idle,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        lock(&self.state).receivers_closed += 1;
        Ok(())
    }

    fn link_name(&self) -> Result<String, TransportError> {
        if lock(&self.state).failures.receiver_link_name {
            return Err(injected("link_name"));
        }
        Ok(self.link_name.clone())
    }

    fn send_message_disposition(
        &mut self,
        link_name: &str,
        delivery_number: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failures.disposition {
            return Err(injected("send_message_disposition"));
        }
        state
            .dispositions
            .push((link_name.to_string(), delivery_number, outcome));
        Ok(())
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_receivers -= 1;
        if matches!(state.receiver_events, Some((id, _)) if id == self.id) {
            state.receiver_events = None;
            state.receiver_state = ReceiverState::Idle;
        }
    }
}
