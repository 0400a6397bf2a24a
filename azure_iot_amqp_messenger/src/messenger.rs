// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`TelemetryMessenger`], which sends telemetry events and receives cloud-to-device
//! messages over links on an AMQP session.

mod batching;
mod delivery;
mod disposition;
mod event_sender;
mod link_attach;
mod message_receiver;
mod state;

use std::time::Duration;

use tokio::time::Instant;

use crate::codec::MessageCodec;
use crate::config::{MessengerConfig, MessengerOption, SavedMessengerOptions};
use crate::error::{EventSendError, MessengerError};
use crate::interface::{AmqpSession, ReceiverEvent, ReceiverState, SenderEvent, SenderState};
use delivery::{InFlightTasks, OutboundQueue, SendRequest};
use event_sender::EventSender;
use message_receiver::MessageReceiver;
use state::StateTracker;

pub use delivery::SendCompleteCallback;
pub use disposition::{DispositionInfo, DispositionResult, OnMessageReceived};
pub use state::{MessengerState, StateChangedCallback};

/// Max time a link may take to open before the messenger errors
const MAX_LINK_OPENING_TIME: Duration = Duration::from_secs(300);

/// Whether the messenger has outbound work outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Nothing is queued or in flight
    Idle,
    /// Events are queued or in flight
    Busy,
}

/// Sends telemetry events to an IoT Hub and receives cloud-to-device messages from it.
///
/// The messenger does no work on its own. Once started on a session, [`do_work`](Self::do_work)
/// must be called periodically to open links, send queued events and process everything reported
/// by the link layer. All callbacks are invoked from within `do_work`, [`stop`](Self::stop) or when
/// the messenger is dropped.
pub struct TelemetryMessenger<S, C>
where
    S: AmqpSession,
    C: MessageCodec,
{
    /// Identity and behavior settings
    config: MessengerConfig,
    /// Converts device messages to and from AMQP
    codec: C,
    /// Provides the client version attached to each link
    product_info: Box<dyn Fn() -> String + Send>,
    /// Current lifecycle state
    state: StateTracker,
    /// Sender of telemetry events. Present while starting or started.
    event_sender: Option<EventSender<S>>,
    /// Receiver of cloud-to-device messages. Present while started and subscribed.
    message_receiver: Option<MessageReceiver<S>>,
    /// Session the links are created on. Present while not stopped.
    session: Option<S>,
    /// Subscriber for cloud-to-device messages
    on_message_received: Option<OnMessageReceived<C::Message>>,
    /// Events waiting to be batched
    outbound: OutboundQueue<C::Message>,
    /// Batches waiting for completion
    in_flight: InFlightTasks<C::Message>,
    /// Consecutive batching passes that failed
    send_error_count: usize,
}

impl<S, C> TelemetryMessenger<S, C>
where
    S: AmqpSession,
    C: MessageCodec,
{
    /// Creates a new [`TelemetryMessenger`] in the [`MessengerState::Stopped`] state.
    ///
    /// `product_info` is called whenever a link is created, and its result is attached to the link
    /// as the client version. `on_state_changed`, if provided, is called with
    /// `(previous_state, new_state)` on every state change.
    pub fn new(
        config: MessengerConfig,
        codec: C,
        product_info: impl Fn() -> String + Send + 'static,
        on_state_changed: Option<StateChangedCallback>,
    ) -> Self {
        log::debug!(
            "Creating telemetry messenger for device {}",
            config.device_id()
        );
        Self {
            config,
            codec,
            product_info: Box::new(product_info),
            state: StateTracker::new(on_state_changed),
            event_sender: None,
            message_receiver: None,
            session: None,
            on_message_received: None,
            outbound: OutboundQueue::default(),
            in_flight: InFlightTasks::default(),
            send_error_count: 0,
        }
    }

    /// Current state of the messenger
    pub fn state(&self) -> MessengerState {
        self.state.current()
    }

    /// Current configuration of the messenger, including options applied since creation
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Start the messenger on `session`. The event sender is opened by the next call to
    /// [`do_work`](Self::do_work).
    ///
    /// # Errors
    /// Returns [`MessengerError::InvalidState`] if the messenger is not stopped.
    pub fn start(&mut self, session: S) -> Result<(), MessengerError> {
        let state = self.state();
        if state != MessengerState::Stopped {
            log::error!("Cannot start messenger while {state:?}");
            return Err(MessengerError::InvalidState(state));
        }
        self.session = Some(session);
        self.send_error_count = 0;
        self.state.transition(MessengerState::Starting);
        Ok(())
    }

    /// Stop the messenger, tearing down its links.
    ///
    /// Events in flight that have not been reported yet are placed back at the front of the
    /// outbound queue, ahead of queued events, to be sent after the next start.
    ///
    /// # Errors
    /// Returns [`MessengerError::InvalidState`] if the messenger is already stopped.
    pub fn stop(&mut self) -> Result<(), MessengerError> {
        let state = self.state();
        if state == MessengerState::Stopped {
            log::error!("Cannot stop messenger, already stopped");
            return Err(MessengerError::InvalidState(state));
        }
        self.state.transition(MessengerState::Stopping);

        if self.event_sender.take().is_some() {
            log::info!("Event sender destroyed");
        }
        if self.message_receiver.take().is_some() {
            log::info!("Message receiver destroyed");
        }
        self.session = None;

        let unnotified = self.in_flight.drain_unnotified();
        if !unnotified.is_empty() {
            log::info!(
                "Returning {} event(s) in flight to the outbound queue",
                unnotified.len()
            );
        }
        self.outbound.requeue_front(unnotified);

        self.state.transition(MessengerState::Stopped);
        Ok(())
    }

    /// Destroy the messenger, stopping it if needed.
    ///
    /// Every event not yet reported is completed with
    /// [`EventSendError::MessengerDestroyed`].
    /// Equivalent to dropping the messenger.
    pub fn destroy(self) {
        drop(self);
    }

    /// Queue an event to be sent. `on_complete` is called exactly once with the event and the
    /// result of sending it.
    ///
    /// Events can be queued in any state. They are sent while the messenger is started.
    pub fn send_async(
        &mut self,
        message: C::Message,
        on_complete: impl FnOnce(C::Message, Result<(), EventSendError>) + Send + 'static,
    ) {
        self.outbound
            .push_back(SendRequest::new(message, Box::new(on_complete)));
    }

    /// Whether any events are queued or in flight
    pub fn send_status(&self) -> SendStatus {
        if self.outbound.is_empty() && self.in_flight.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Subscribe for cloud-to-device messages. The message receiver is opened by the next call to
    /// [`do_work`](Self::do_work) while started.
    ///
    /// # Errors
    /// Returns [`MessengerError::AlreadySubscribed`] if there is already a subscriber.
    pub fn subscribe_for_messages(
        &mut self,
        on_message_received: impl FnMut(C::Message, DispositionInfo) -> DispositionResult
            + Send
            + 'static,
    ) -> Result<(), MessengerError> {
        if self.on_message_received.is_some() {
            log::error!("Cannot subscribe for messages, already subscribed");
            return Err(MessengerError::AlreadySubscribed);
        }
        self.on_message_received = Some(Box::new(on_message_received));
        log::info!("Subscribed for messages");
        Ok(())
    }

    /// Remove the subscriber for cloud-to-device messages. The message receiver is closed by the
    /// next call to [`do_work`](Self::do_work); messages arriving until then are released.
    ///
    /// # Errors
    /// Returns [`MessengerError::NotSubscribed`] if there is no subscriber.
    pub fn unsubscribe_for_messages(&mut self) -> Result<(), MessengerError> {
        if self.on_message_received.take().is_none() {
            log::error!("Cannot unsubscribe for messages, not subscribed");
            return Err(MessengerError::NotSubscribed);
        }
        log::info!("Unsubscribed for messages");
        Ok(())
    }

    /// Whether a subscriber for cloud-to-device messages is registered
    pub fn is_subscribed(&self) -> bool {
        self.on_message_received.is_some()
    }

    /// Acknowledge a received message the subscriber left unsettled with [`DispositionResult::None`].
    ///
    /// # Errors
    /// - [`MessengerError::ReceiverNotActive`] if the message receiver is not present
    /// - [`MessengerError::UnsupportedDisposition`] if `result` is [`DispositionResult::None`]
    /// - [`MessengerError::Transport`] if the disposition could not be sent
    pub fn send_message_disposition(
        &mut self,
        info: &DispositionInfo,
        result: DispositionResult,
    ) -> Result<(), MessengerError> {
        disposition::send_deferred_disposition(self.message_receiver.as_mut(), info, result)
    }

    /// Apply a runtime option.
    ///
    /// # Errors
    /// - [`MessengerError::OptionNotSettable`] if setting the module id while not stopped
    /// - [`MessengerError::InvalidOptionValue`] if the module id is empty or contains a '/'
    pub fn set_option(&mut self, option: MessengerOption) -> Result<(), MessengerError> {
        let name = option.name();
        match option {
            MessengerOption::EventSendTimeoutSecs(secs) => {
                self.config.event_send_timeout = Duration::from_secs(secs);
            }
            MessengerOption::EventSendRetryLimit(limit) => {
                self.config.event_send_retry_limit = limit;
            }
            MessengerOption::ModuleId(module_id) => {
                let state = self.state();
                if state != MessengerState::Stopped {
                    log::error!("Cannot set {name} while {state:?}");
                    return Err(MessengerError::OptionNotSettable { name, state });
                }
                if module_id.is_empty() || module_id.contains('/') {
                    return Err(MessengerError::InvalidOptionValue {
                        name,
                        reason: format!("'{module_id}' is empty or contains '/'"),
                    });
                }
                self.config.module_id = Some(module_id);
            }
            MessengerOption::SavedOptions(saved) => {
                self.config.event_send_timeout = Duration::from_secs(saved.event_send_timeout_secs);
                self.config.event_send_retry_limit = saved.event_send_retry_limit;
            }
        }
        log::debug!("Applied option {name}");
        Ok(())
    }

    /// Snapshot of the runtime options, to be applied to another messenger with
    /// [`MessengerOption::SavedOptions`]
    pub fn retrieve_options(&self) -> SavedMessengerOptions {
        SavedMessengerOptions {
            event_send_timeout_secs: self.config.event_send_timeout.as_secs(),
            event_send_retry_limit: self.config.event_send_retry_limit,
        }
    }

    /// Perform pending work: process events reported by the link layer, open links, time out
    /// batches in flight and send queued events.
    ///
    /// Does nothing while stopped.
    pub fn do_work(&mut self) {
        if matches!(
            self.state(),
            MessengerState::Stopped | MessengerState::Stopping
        ) {
            return;
        }

        self.process_sender_events();
        self.process_receiver_events();
        self.process_state_changes();

        match self.state() {
            MessengerState::Starting => {
                if self.event_sender.is_none() {
                    self.create_event_sender();
                }
            }
            MessengerState::Started => {
                self.reconcile_message_receiver();
                self.process_event_send_timeouts();
                self.send_pending_events();
            }
            _ => {}
        }
    }

    fn process_sender_events(&mut self) {
        let Some(sender) = self.event_sender.as_mut() else {
            return;
        };
        while let Some(event) = sender.next_event() {
            match event {
                SenderEvent::StateChanged {
                    new_state,
                    previous_state,
                } => {
                    log::info!("Event sender state changed from {previous_state:?} to {new_state:?}");
                }
                SenderEvent::SendComplete {
                    token,
                    result,
                    outcome,
                } => {
                    log::debug!("Batch {token:?} completed with {result:?} ({outcome:?})");
                    if !self.in_flight.on_send_complete(token, result) {
                        log::debug!("Batch {token:?} is no longer tracked, ignoring completion");
                    }
                }
            }
        }
    }

    fn process_receiver_events(&mut self) {
        let Some(receiver) = self.message_receiver.as_mut() else {
            return;
        };
        while let Some(event) = receiver.next_event() {
            match event {
                ReceiverEvent::StateChanged {
                    new_state,
                    previous_state,
                } => {
                    log::info!(
                        "Message receiver state changed from {previous_state:?} to {new_state:?}"
                    );
                }
                ReceiverEvent::MessageReceived(received) => {
                    disposition::handle_received_message(
                        receiver,
                        &self.codec,
                        self.on_message_received.as_mut(),
                        received,
                    );
                }
            }
        }
    }

    /// Derive the messenger state from the states reported by its links
    fn process_state_changes(&mut self) {
        match self.state() {
            MessengerState::Starting => {
                let Some(sender) = &self.event_sender else {
                    return;
                };
                let opening = match sender.state() {
                    SenderState::Open => {
                        self.state.transition(MessengerState::Started);
                        return;
                    }
                    SenderState::Opening => true,
                    SenderState::Idle => !sender.has_changed_state(),
                    SenderState::Closing | SenderState::Error => false,
                };
                if !opening {
                    log::error!(
                        "Event sender reported unexpected state {:?} while messenger is starting",
                        sender.state()
                    );
                    self.state.transition(MessengerState::Error);
                } else if sender.time_in_state() >= MAX_LINK_OPENING_TIME {
                    log::error!("Event sender failed to open within {MAX_LINK_OPENING_TIME:?}");
                    self.state.transition(MessengerState::Error);
                }
            }
            MessengerState::Started => {
                let sender_state = self
                    .event_sender
                    .as_ref()
                    .map_or(SenderState::Idle, EventSender::state);
                if sender_state != SenderState::Open {
                    log::error!(
                        "Event sender reported unexpected state {sender_state:?} while messenger is started"
                    );
                    self.state.transition(MessengerState::Error);
                    return;
                }
                let Some(receiver) = &self.message_receiver else {
                    return;
                };
                let opening = match receiver.state() {
                    ReceiverState::Open | ReceiverState::Closing => return,
                    ReceiverState::Opening => true,
                    ReceiverState::Idle => !receiver.has_changed_state(),
                    ReceiverState::Error => false,
                };
                if !opening {
                    log::error!(
                        "Message receiver reported unexpected state {:?} while messenger is started",
                        receiver.state()
                    );
                    self.state.transition(MessengerState::Error);
                } else if receiver.time_in_state() >= MAX_LINK_OPENING_TIME {
                    log::error!("Message receiver failed to open within {MAX_LINK_OPENING_TIME:?}");
                    self.state.transition(MessengerState::Error);
                }
            }
            _ => {}
        }
    }

    fn create_event_sender(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let product_info = (self.product_info)();
        match EventSender::create(session, &self.config, &product_info) {
            Ok(sender) => self.event_sender = Some(sender),
            Err(e) => {
                log::error!("Failed creating event sender: {e}");
                self.state.transition(MessengerState::Error);
            }
        }
    }

    /// Open or close the message receiver to match the subscription
    fn reconcile_message_receiver(&mut self) {
        match (
            self.on_message_received.is_some(),
            self.message_receiver.is_some(),
        ) {
            (true, false) => {
                let Some(session) = &self.session else {
                    return;
                };
                let product_info = (self.product_info)();
                match MessageReceiver::create(session, &self.config, &product_info) {
                    Ok(receiver) => self.message_receiver = Some(receiver),
                    // Retried on the next call
                    Err(e) => log::warn!("Failed creating message receiver: {e}"),
                }
            }
            (false, true) => {
                self.message_receiver = None;
                log::info!("Message receiver destroyed");
            }
            _ => {}
        }
    }

    fn process_event_send_timeouts(&mut self) {
        let timeout = self.config.event_send_timeout;
        if timeout.is_zero() {
            return;
        }
        self.in_flight.process_timeouts(Instant::now(), timeout);
    }

    fn send_pending_events(&mut self) {
        let Some(sender) = self.event_sender.as_mut() else {
            return;
        };
        let result =
            batching::send_pending_events(&mut self.outbound, &mut self.in_flight, sender, &self.codec);
        let retry_limit = self.config.event_send_retry_limit;
        match result {
            Err(e) if retry_limit > 0 => {
                self.send_error_count += 1;
                log::warn!(
                    "Failed sending events ({} of {retry_limit} consecutive failures): {e}",
                    self.send_error_count
                );
                if self.send_error_count >= retry_limit {
                    log::error!("Reached max number of consecutive failures sending events");
                    self.state.transition(MessengerState::Error);
                }
            }
            _ => self.send_error_count = 0,
        }
    }
}

impl<S, C> Drop for TelemetryMessenger<S, C>
where
    S: AmqpSession,
    C: MessageCodec,
{
    fn drop(&mut self) {
        if self.state() != MessengerState::Stopped {
            if let Err(e) = self.stop() {
                log::warn!("Failed stopping messenger on drop: {e}");
            }
        }
        let residual: Vec<_> = self
            .in_flight
            .drain_unnotified()
            .into_iter()
            .chain(self.outbound.drain())
            .collect();
        if !residual.is_empty() {
            log::info!(
                "Messenger destroyed with {} event(s) not sent",
                residual.len()
            );
        }
        for request in residual {
            request.complete(Err(EventSendError::MessengerDestroyed));
        }
    }
}

impl<S, C> std::fmt::Debug for TelemetryMessenger<S, C>
where
    S: AmqpSession,
    C: MessageCodec,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryMessenger")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("subscribed", &self.is_subscribed())
            .field("queued", &self.outbound.len())
            .field("in_flight", &self.in_flight.len())
            .field("send_error_count", &self.send_error_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use test_case::test_case;

    use super::*;
    use crate::codec::RawBytesCodec;
    use crate::config::{MessengerConfigBuilder, OPTION_MODULE_ID};
    use crate::interface_mocks::MockSession;

    fn messenger() -> TelemetryMessenger<MockSession, RawBytesCodec> {
        let config = MessengerConfigBuilder::default()
            .device_id("dev1")
            .iothub_host_fqdn("h.example.com")
            .build()
            .unwrap();
        TelemetryMessenger::new(config, RawBytesCodec, || "test/1.0".to_string(), None)
    }

    #[test]
    fn new_messenger_is_stopped_and_idle() {
        let messenger = messenger();
        assert_eq!(messenger.state(), MessengerState::Stopped);
        assert_eq!(messenger.send_status(), SendStatus::Idle);
        assert!(!messenger.is_subscribed());
    }

    #[test]
    fn start_twice_fails() {
        let mut messenger = messenger();
        messenger.start(MockSession::new()).unwrap();
        assert!(matches!(
            messenger.start(MockSession::new()),
            Err(MessengerError::InvalidState(MessengerState::Starting))
        ));
    }

    #[test]
    fn stop_when_stopped_fails() {
        let mut messenger = messenger();
        assert!(matches!(
            messenger.stop(),
            Err(MessengerError::InvalidState(MessengerState::Stopped))
        ));
    }

    #[test]
    fn do_work_when_stopped_does_nothing() {
        let mut messenger = messenger();
        messenger.send_async(Bytes::from_static(b"event"), |_, _| {});
        messenger.do_work();
        assert_eq!(messenger.state(), MessengerState::Stopped);
        assert_eq!(messenger.send_status(), SendStatus::Busy);
    }

    #[test]
    fn subscription_toggles() {
        let mut messenger = messenger();
        assert!(matches!(
            messenger.unsubscribe_for_messages(),
            Err(MessengerError::NotSubscribed)
        ));
        messenger
            .subscribe_for_messages(|_, _| DispositionResult::Accepted)
            .unwrap();
        assert!(matches!(
            messenger.subscribe_for_messages(|_, _| DispositionResult::Accepted),
            Err(MessengerError::AlreadySubscribed)
        ));
        messenger.unsubscribe_for_messages().unwrap();
        assert!(!messenger.is_subscribed());
    }

    #[test_case(MessengerOption::EventSendTimeoutSecs(30), 30, 10; "timeout")]
    #[test_case(MessengerOption::EventSendRetryLimit(3), 600, 3; "retry limit")]
    #[test_case(
        MessengerOption::SavedOptions(SavedMessengerOptions {
            event_send_timeout_secs: 5,
            event_send_retry_limit: 0,
        }),
        5,
        0;
        "saved options"
    )]
    fn options_round_trip_through_retrieve(
        option: MessengerOption,
        expected_timeout_secs: u64,
        expected_retry_limit: usize,
    ) {
        let mut messenger = messenger();
        messenger.set_option(option).unwrap();
        assert_eq!(
            messenger.retrieve_options(),
            SavedMessengerOptions {
                event_send_timeout_secs: expected_timeout_secs,
                event_send_retry_limit: expected_retry_limit,
            }
        );
    }

    #[test]
    fn module_id_only_settable_while_stopped() {
        let mut messenger = messenger();
        messenger
            .set_option(MessengerOption::ModuleId("mod1".to_string()))
            .unwrap();
        assert_eq!(messenger.config().module_id(), Some("mod1"));

        assert!(matches!(
            messenger.set_option(MessengerOption::ModuleId(String::new())),
            Err(MessengerError::InvalidOptionValue { .. })
        ));

        messenger.start(MockSession::new()).unwrap();
        assert!(matches!(
            messenger.set_option(MessengerOption::ModuleId("mod2".to_string())),
            Err(MessengerError::OptionNotSettable {
                name: OPTION_MODULE_ID,
                state: MessengerState::Starting
            })
        ));
        assert_eq!(messenger.config().module_id(), Some("mod1"));
    }

    #[test]
    fn drop_reports_messenger_destroyed() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let mut messenger = messenger();
        for payload in [&b"one"[..], &b"two"[..]] {
            let reports = reports.clone();
            messenger.send_async(Bytes::from_static(payload), move |message, result| {
                reports.lock().unwrap().push((message, result));
            });
        }
        messenger.destroy();
        assert_eq!(
            *reports.lock().unwrap(),
            vec![
                (
                    Bytes::from_static(b"one"),
                    Err(EventSendError::MessengerDestroyed)
                ),
                (
                    Bytes::from_static(b"two"),
                    Err(EventSendError::MessengerDestroyed)
                ),
            ]
        );
    }
}
