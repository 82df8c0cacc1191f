//! Connection state machine.
//!
//! Tracks the lifecycle of one logical connection to one peripheral. Every
//! transition is a pure function of the current machine and an [`Input`],
//! producing the next machine and the [`Action`]s the owner must carry out.
//! The machine itself performs no I/O.

use std::time::Duration;
use tracing::{debug, trace};

use crate::ble::peripheral::PeripheralAddress;
use crate::config::ManagerConfig;
use crate::error::Error;
use crate::utils::backoff_delay;

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Record created, nothing issued yet.
    #[default]
    Idle,
    /// Opening the GATT link.
    Connecting,
    /// Link up, waiting for the service table.
    DiscoveringServices,
    /// Services known; GATT operations accepted.
    Ready,
    /// Closing the link after an explicit disconnect.
    Disconnecting,
    /// Link lost; waiting for the next reconnection attempt.
    Reconnecting,
    /// Terminal.
    Disconnected,
}

impl ConnectionState {
    /// Check if GATT operations are accepted.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Disconnecting | Self::Reconnecting
        )
    }

    /// Check if the connection is on its way to `Ready` or already there.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::Connecting
                | Self::DiscoveringServices
                | Self::Ready
                | Self::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peripheral.
    pub address: PeripheralAddress,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The application asked to connect.
    Connect,
    /// The gateway reported the link up.
    LinkEstablished,
    /// The gateway reported the link down. Before the link was established
    /// this is a connect failure, afterwards an unexpected link loss.
    LinkDown {
        /// Platform status code.
        code: i32,
    },
    /// Service discovery produced a table.
    ServicesFound,
    /// Service discovery failed.
    DiscoveryFailed {
        /// Platform status code.
        code: i32,
    },
    /// The application asked to disconnect.
    Disconnect,
    /// The link has been closed.
    Closed,
    /// The reconnection backoff elapsed.
    ReconnectDue,
    /// The connect deadline elapsed before `Ready`.
    ConnectTimeout,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop any scan competing for the radio.
    StopScan,
    /// Open a GATT link.
    OpenLink,
    /// Start the connect deadline.
    ArmConnectTimer,
    /// Start service discovery.
    DiscoverServices,
    /// Close the GATT link.
    CloseLink,
    /// Fail every queued and in-flight request.
    FailPending(Error),
    /// End every notification stream.
    DropSubscriptions,
    /// Fire [`Input::ReconnectDue`] after `delay`.
    ScheduleReconnect {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff delay.
        delay: Duration,
    },
}

/// Reconnection policy applied on unexpected link loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Maximum attempts per loss.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

impl From<&ManagerConfig> for ReconnectPolicy {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            enabled: config.auto_reconnect,
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
        }
    }
}

/// The connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Reconnection attempt in progress; 0 outside a reconnection cycle.
    attempt: u32,
    failure: Option<Error>,
}

impl StateMachine {
    /// Create a machine in `Idle`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            attempt: 0,
            failure: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Why the machine reached `Disconnected`.
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Current reconnection attempt (0 when not reconnecting).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply an input, returning the actions to perform.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let (next, actions) = self.next(&input);
        if next.state != self.state {
            debug!("Connection state: {} -> {} on {:?}", self.state, next.state, input);
        } else {
            trace!("Input {:?} ignored in {}", input, self.state);
        }
        *self = next;
        actions
    }

    /// Compute the transition for an input without applying it.
    pub fn next(&self, input: &Input) -> (StateMachine, Vec<Action>) {
        use ConnectionState::*;

        let mut next = self.clone();
        let mut actions = Vec::new();

        match (self.state, input) {
            (Idle, Input::Connect) => {
                next.state = Connecting;
                actions.extend([Action::StopScan, Action::OpenLink, Action::ArmConnectTimer]);
            }

            (Connecting, Input::LinkEstablished) => {
                next.state = DiscoveringServices;
                actions.push(Action::DiscoverServices);
            }

            (Connecting, Input::LinkDown { code }) => {
                actions.push(Action::CloseLink);
                next.retry_or_fail(Error::ConnectError { code: *code }, &mut actions);
            }

            (Connecting, Input::ConnectTimeout) => {
                actions.push(Action::CloseLink);
                next.retry_or_fail(Error::Timeout, &mut actions);
            }

            (DiscoveringServices, Input::ServicesFound) => {
                next.state = Ready;
                next.attempt = 0;
            }

            (DiscoveringServices, Input::DiscoveryFailed { code }) => {
                next.state = Disconnected;
                next.failure = Some(Error::DiscoveryError { code: *code });
                actions.push(Action::CloseLink);
            }

            (DiscoveringServices, Input::ConnectTimeout) => {
                next.state = Disconnected;
                next.failure = Some(Error::Timeout);
                actions.push(Action::CloseLink);
            }

            (DiscoveringServices | Ready, Input::LinkDown { .. }) => {
                actions.extend([
                    Action::FailPending(Error::LinkLost),
                    Action::DropSubscriptions,
                    Action::CloseLink,
                ]);
                if self.state == DiscoveringServices && self.attempt > 0 {
                    // Still inside a reconnection cycle; it consumes the budget.
                    next.retry_or_fail(Error::LinkLost, &mut actions);
                } else if self.policy.enabled && self.policy.max_attempts > 0 {
                    next.state = Reconnecting;
                    next.attempt = 1;
                    actions.push(Action::ScheduleReconnect {
                        attempt: 1,
                        delay: self.policy.delay(1),
                    });
                } else {
                    next.state = Disconnected;
                    next.failure = Some(Error::LinkLost);
                }
            }

            (Reconnecting, Input::ReconnectDue) => {
                next.state = Connecting;
                actions.extend([Action::StopScan, Action::OpenLink, Action::ArmConnectTimer]);
            }

            (Connecting | DiscoveringServices | Ready, Input::Disconnect) => {
                next.state = Disconnecting;
                actions.extend([
                    Action::FailPending(Error::Cancelled),
                    Action::DropSubscriptions,
                    Action::CloseLink,
                ]);
            }

            (Idle | Reconnecting, Input::Disconnect) => {
                next.state = Disconnected;
                next.failure = Some(Error::Cancelled);
                actions.extend([Action::FailPending(Error::Cancelled), Action::DropSubscriptions]);
            }

            (Disconnecting, Input::Closed | Input::LinkDown { .. }) => {
                next.state = Disconnected;
                next.failure = Some(Error::Cancelled);
            }

            _ => {}
        }

        (next, actions)
    }

    /// After a failed (re)connect attempt: schedule the next attempt if the
    /// reconnection budget allows, otherwise terminate with `error`.
    fn retry_or_fail(&mut self, error: Error, actions: &mut Vec<Action>) {
        if self.attempt > 0 && self.attempt < self.policy.max_attempts {
            self.attempt += 1;
            self.state = ConnectionState::Reconnecting;
            actions.push(Action::ScheduleReconnect {
                attempt: self.attempt,
                delay: self.policy.delay(self.attempt),
            });
        } else {
            self.state = ConnectionState::Disconnected;
            self.failure = Some(error);
        }
    }
}
