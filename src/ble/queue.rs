//! GATT operation queue.
//!
//! Platform radio stacks accept only one outstanding GATT operation per link;
//! issuing a second one before the first completes makes it fail silently.
//! [`GattQueue`] holds the requests of one connection in submission order and
//! releases the head only when nothing is in flight. Each request carries a
//! deadline so a lost completion can never wedge the connection.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::characteristics::WriteType;
use crate::ble::gateway::RequestKind;
use crate::error::{Error, Result};

/// Receives the outcome of one GATT request.
pub type ResultReceiver = oneshot::Receiver<Result<Vec<u8>>>;

/// Sender side of a notification stream.
pub type NotificationSender = mpsc::UnboundedSender<Vec<u8>>;

/// One queued GATT request.
#[derive(Debug)]
pub struct GattRequest {
    /// Operation kind.
    pub kind: RequestKind,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Value to write (writes only).
    pub payload: Option<Vec<u8>>,
    /// Write delivery mode (writes only); `None` lets the connection pick
    /// from the characteristic's properties.
    pub write_type: Option<WriteType>,
    /// The request fails with `Timeout` if not completed by this instant.
    pub deadline: Instant,
    sink: oneshot::Sender<Result<Vec<u8>>>,
    listener: Option<NotificationSender>,
}

impl GattRequest {
    /// Create a request and the receiver for its outcome.
    pub fn new(kind: RequestKind, characteristic: Uuid, deadline: Instant) -> (Self, ResultReceiver) {
        let (sink, rx) = oneshot::channel();
        let request = Self {
            kind,
            characteristic,
            payload: None,
            write_type: None,
            deadline,
            sink,
            listener: None,
        };
        (request, rx)
    }

    /// Attach a write payload.
    pub fn with_payload(mut self, payload: Vec<u8>, write_type: Option<WriteType>) -> Self {
        self.payload = Some(payload);
        self.write_type = write_type;
        self
    }

    /// Attach the notification sender registered once a subscribe completes.
    pub fn with_listener(mut self, listener: NotificationSender) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Take the notification sender, if any.
    pub fn take_listener(&mut self) -> Option<NotificationSender> {
        self.listener.take()
    }

    /// Resolve the request. A dropped receiver is not an error.
    pub fn resolve(self, result: Result<Vec<u8>>) {
        let _ = self.sink.send(result);
    }

    /// Whether this request is the target of a completion.
    pub fn matches(&self, kind: RequestKind, characteristic: &Uuid) -> bool {
        self.kind == kind && self.characteristic == *characteristic
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch {
            kind: self.kind,
            characteristic: self.characteristic,
            payload: self.payload.clone(),
            write_type: self.write_type.unwrap_or(WriteType::WithResponse),
        }
    }
}

/// What to hand to the gateway for the request just put in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Operation kind.
    pub kind: RequestKind,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Value to write.
    pub payload: Option<Vec<u8>>,
    /// Write delivery mode.
    pub write_type: WriteType,
}

/// FIFO of GATT requests for one connection with at most one in flight.
#[derive(Debug, Default)]
pub struct GattQueue {
    pending: VecDeque<GattRequest>,
    in_flight: Option<GattRequest>,
}

impl GattQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request.
    pub fn enqueue(&mut self, request: GattRequest) {
        trace!(
            "Queued {} of {} ({} waiting)",
            request.kind,
            request.characteristic,
            self.pending.len()
        );
        self.pending.push_back(request);
    }

    /// Put the next request in flight if the link is idle.
    ///
    /// Requests whose deadline passed while waiting resolve with `Timeout`
    /// and are skipped.
    pub fn dispatch_next(&mut self, now: Instant) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }

        while let Some(request) = self.pending.pop_front() {
            if request.deadline <= now {
                debug!(
                    "{} of {} expired before dispatch",
                    request.kind, request.characteristic
                );
                request.resolve(Err(Error::Timeout));
                continue;
            }

            let dispatch = request.dispatch();
            self.in_flight = Some(request);
            return Some(dispatch);
        }

        None
    }

    /// Take the in-flight request if it matches a completion.
    ///
    /// Completions that do not match the in-flight request (late arrivals
    /// for a request that already timed out, or unsolicited results) return
    /// `None` and leave the queue untouched.
    pub fn complete(&mut self, kind: RequestKind, characteristic: &Uuid) -> Option<GattRequest> {
        match &self.in_flight {
            Some(request) if request.matches(kind, characteristic) => self.in_flight.take(),
            _ => None,
        }
    }

    /// Fail the in-flight request, e.g. when the gateway refused to start it.
    pub fn fail_in_flight(&mut self, error: Error) -> bool {
        match self.in_flight.take() {
            Some(request) => {
                request.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve every request whose deadline has passed with `Timeout`.
    ///
    /// Returns the number of expired requests.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;

        if self
            .in_flight
            .as_ref()
            .map(|r| r.deadline <= now)
            .unwrap_or(false)
        {
            if let Some(request) = self.in_flight.take() {
                debug!("{} of {} timed out", request.kind, request.characteristic);
                request.resolve(Err(Error::Timeout));
                expired += 1;
            }
        }

        let (timed_out, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|r| r.deadline <= now);
        self.pending = waiting.into();

        for request in timed_out {
            request.resolve(Err(Error::Timeout));
            expired += 1;
        }

        expired
    }

    /// The earliest deadline among all requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .iter()
            .chain(self.pending.iter())
            .map(|r| r.deadline)
            .min()
    }

    /// Resolve every request, in flight and queued, with `error`.
    pub fn fail_all(&mut self, error: Error) -> usize {
        let mut failed = 0;

        if let Some(request) = self.in_flight.take() {
            request.resolve(Err(error.clone()));
            failed += 1;
        }

        for request in self.pending.drain(..) {
            request.resolve(Err(error.clone()));
            failed += 1;
        }

        failed
    }

    /// The kind and target of the in-flight request.
    pub fn in_flight(&self) -> Option<(RequestKind, Uuid)> {
        self.in_flight.as_ref().map(|r| (r.kind, r.characteristic))
    }

    /// Number of requests, in flight and queued.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    /// Whether the queue holds no request.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
