//! The subscriber's connection lifecycle as a pure state machine.
//!
//! Every socket-level occurrence is an [`Input`]; [`Machine::handle`] maps
//! it to a state change plus a list of [`Effect`]s for the I/O driver to
//! perform. No I/O, no clocks, no randomness in here — jitter and actual
//! timers live in the driver — so every transition is testable without a
//! network or a runtime.

use std::time::Duration;

use agentdeck_protocol::{close, Event, EventPayload};

use crate::backoff::delay_for;

/// Tunables for one subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// First reconnect delay (default 1s).
    pub base_delay: Duration,
    /// Reconnect delay clamp (default 30s).
    pub max_delay: Duration,
    /// Consecutive failed connection attempts before giving up (default 10).
    pub max_attempts: u32,
    /// Interval between keepalive pings (default 25s).
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the socket dead
    /// (default 10s).
    pub pong_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the subscriber is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next connection attempt.
    Reconnecting,
    /// Clean close; not recovered from automatically.
    Closed,
    /// Terminal failure (auth rejection or attempts exhausted).
    Failed,
}

/// Why the subscriber stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The server rejected our credentials. Retrying cannot succeed.
    AuthRejected,
    /// The server closed the connection cleanly.
    Closed,
    /// Every reconnect attempt failed.
    AttemptsExhausted,
}

/// Something that happened at the socket or timer layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Start the subscriber.
    Open,
    /// The WebSocket handshake completed (auth passed — the server rejects
    /// bad credentials before the upgrade).
    Opened,
    /// A connection attempt failed for a transient reason (network error,
    /// rate limiting).
    ConnectFailed,
    /// A connection attempt was rejected for auth reasons (HTTP 401/403 on
    /// the handshake, or close code 1008).
    AuthRejected,
    /// A well-formed event arrived.
    Message(Event),
    /// A frame arrived that did not parse as an event.
    MalformedMessage,
    /// The keepalive interval elapsed.
    PingDue,
    /// No pong arrived within the pong timeout.
    PongTimedOut,
    /// The established socket closed, with the close code when one was
    /// received.
    SocketClosed { code: Option<u16> },
    /// The backoff delay elapsed.
    ReconnectDue,
    /// The user asked for an immediate reconnect.
    ManualReconnect,
    /// The user is shutting the subscriber down.
    Teardown,
}

/// An action for the I/O driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start a connection attempt.
    Connect,
    /// Send a keepalive ping message.
    SendPing,
    /// (Re)arm the keepalive interval timer.
    StartPingTimer,
    /// Arm the pong-timeout timer.
    ArmPongTimeout,
    /// Disarm the pong-timeout timer.
    ClearPongTimeout,
    /// Disarm every timer.
    CancelTimers,
    /// Close the socket with this code.
    CloseSocket { code: u16 },
    /// Arm the reconnect timer for this delay (the driver adds jitter).
    ScheduleReconnect(Duration),
    /// Hand an event to the consumer.
    Deliver(Event),
    /// The subscriber has stopped for good.
    NotifyTerminal(TerminalReason),
}

pub struct Machine {
    config: SubscriberConfig,
    state: State,
    /// Consecutive failed connection attempts. Reset on a successful open.
    attempt: u32,
    /// Most recent delivered event, for status displays.
    last_event: Option<Event>,
    done: bool,
}

impl Machine {
    pub fn new(config: SubscriberConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            attempt: 0,
            last_event: None,
            done: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The most recent event delivered to the consumer.
    pub fn last_event(&self) -> Option<&Event> {
        self.last_event.as_ref()
    }

    /// Whether the subscriber has fully stopped and the driver should exit.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Apply one input, returning the effects to perform, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match (self.state, input) {
            (State::Idle, Input::Open) => {
                self.state = State::Connecting;
                vec![Effect::Connect]
            }

            (State::Connecting, Input::Opened) => {
                self.state = State::Connected;
                self.attempt = 0;
                vec![Effect::StartPingTimer]
            }
            (State::Connecting, Input::ConnectFailed) => {
                self.attempt += 1;
                if self.attempt >= self.config.max_attempts {
                    self.fail(TerminalReason::AttemptsExhausted)
                } else {
                    self.state = State::Reconnecting;
                    let delay =
                        delay_for(self.attempt, self.config.base_delay, self.config.max_delay);
                    vec![Effect::ScheduleReconnect(delay)]
                }
            }
            (State::Connecting, Input::AuthRejected) => self.fail(TerminalReason::AuthRejected),

            (State::Connected, Input::Message(event)) => match event.payload {
                // Keepalive reply: the socket is alive, nothing to deliver.
                EventPayload::Pong { .. } => vec![Effect::ClearPongTimeout],
                _ => {
                    self.last_event = Some(event.clone());
                    vec![Effect::Deliver(event)]
                }
            },
            // Logged by the driver; the connection is not torn down over one
            // bad frame.
            (State::Connected, Input::MalformedMessage) => vec![],
            (State::Connected, Input::PingDue) => {
                vec![Effect::SendPing, Effect::ArmPongTimeout, Effect::StartPingTimer]
            }
            (State::Connected, Input::PongTimedOut) => {
                // Half-open socket: drop it and start over.
                self.state = State::Reconnecting;
                self.attempt = 1;
                let delay = delay_for(1, self.config.base_delay, self.config.max_delay);
                vec![
                    Effect::CancelTimers,
                    Effect::CloseSocket {
                        code: close::NORMAL,
                    },
                    Effect::ScheduleReconnect(delay),
                ]
            }
            (State::Connected, Input::SocketClosed { code }) => match code {
                Some(c) if close::is_clean(c) => {
                    self.state = State::Closed;
                    self.done = true;
                    vec![Effect::CancelTimers, Effect::NotifyTerminal(TerminalReason::Closed)]
                }
                Some(c) if close::is_auth_rejection(c) => {
                    let mut effects = vec![Effect::CancelTimers];
                    effects.extend(self.fail(TerminalReason::AuthRejected));
                    effects
                }
                // Server restart (1012), abnormal closure, or no close frame
                // at all: transient, reconnect.
                _ => {
                    self.state = State::Reconnecting;
                    self.attempt = 1;
                    let delay = delay_for(1, self.config.base_delay, self.config.max_delay);
                    vec![Effect::CancelTimers, Effect::ScheduleReconnect(delay)]
                }
            },

            (State::Reconnecting, Input::ReconnectDue) => {
                self.state = State::Connecting;
                vec![Effect::Connect]
            }

            // A user-initiated reconnect restarts the schedule from scratch,
            // including from terminal states.
            (
                State::Reconnecting | State::Closed | State::Failed,
                Input::ManualReconnect,
            ) => {
                self.state = State::Connecting;
                self.attempt = 0;
                self.done = false;
                vec![Effect::CancelTimers, Effect::Connect]
            }

            (state, Input::Teardown) => {
                self.done = true;
                let was_connected = state == State::Connected;
                self.state = State::Closed;
                let mut effects = vec![Effect::CancelTimers];
                if was_connected {
                    effects.push(Effect::CloseSocket {
                        code: close::NORMAL,
                    });
                }
                effects
            }

            // Anything else is a stale timer or a late socket event for a
            // connection we have already moved on from.
            _ => vec![],
        }
    }

    fn fail(&mut self, reason: TerminalReason) -> Vec<Effect> {
        self.state = State::Failed;
        self.done = true;
        vec![Effect::NotifyTerminal(reason)]
    }
}
