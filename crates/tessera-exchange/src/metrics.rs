//! Exchange worker counters.
//!
//! [`ExchangeMetrics`] is updated by the worker thread with relaxed
//! atomics and read by anyone holding the handler or a client;
//! [`ExchangeMetricsSnapshot`] is a plain copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared between the worker and its handles.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
    requests_sent: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    replies_received: AtomicU64,
    requests_served: AtomicU64,
    requests_parked: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`ExchangeMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeMetricsSnapshot {
    /// Requests issued (first attempts only).
    pub requests_sent: u64,
    /// Resends after a timeout.
    pub retries: u64,
    /// Requests that exhausted their retry budget.
    pub timeouts: u64,
    /// Replies matched to an outstanding request.
    pub replies_received: u64,
    /// Replies sent to other ranks.
    pub requests_served: u64,
    /// Requests parked because the data was not produced yet.
    pub requests_parked: u64,
    /// Outgoing frames lost in transport.
    pub frames_dropped: u64,
    /// Frame bytes received.
    pub bytes_in: u64,
    /// Frame bytes sent.
    pub bytes_out: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl ExchangeMetrics {
            $(
                pub(crate) fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    add_sent => requests_sent,
    add_retry => retries,
    add_timeout => timeouts,
    add_reply => replies_received,
    add_served => requests_served,
    add_parked => requests_parked,
    add_dropped => frames_dropped,
    add_bytes_in => bytes_in,
    add_bytes_out => bytes_out,
}

impl ExchangeMetrics {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> ExchangeMetricsSnapshot {
        ExchangeMetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_parked: self.requests_parked.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}
