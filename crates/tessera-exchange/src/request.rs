//! Lifecycle of one outstanding remote request.

use std::fmt;
use std::time::{Duration, Instant};
use tessera_core::Tag;
use tessera_warehouse::{FetchCompleter, FetchRequest, FetchResult};

/// State of an outstanding request.
///
/// ```text
/// Pending ──▶ Sent ──▶ AwaitingReply ──▶ Fulfilled
///               ▲            │
///               └── retry ───┤
///                            └──────────▶ TimedOut
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Accepted by the worker, not yet handed to the transport.
    Pending,
    /// Handed to the transport.
    Sent,
    /// Waiting for the owner's reply.
    AwaitingReply,
    /// A reply arrived and was delivered to the waiter.
    Fulfilled,
    /// The retry budget ran out.
    TimedOut,
}

impl RequestState {
    /// `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Sent, AwaitingReply)
                | (AwaitingReply, Sent)
                | (AwaitingReply, Fulfilled)
                | (AwaitingReply, TimedOut)
        )
    }

    /// `true` for `Fulfilled` and `TimedOut`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Fulfilled | RequestState::TimedOut)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting-reply",
            Self::Fulfilled => "fulfilled",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for a request owned by the exchange worker.
#[derive(Debug)]
pub(crate) struct Outstanding {
    pub tag: Tag,
    pub request: FetchRequest,
    completer: Option<FetchCompleter>,
    state: RequestState,
    /// Sends so far, including the first.
    pub attempts: u32,
    pub timeout: Duration,
    pub deadline: Instant,
}

impl Outstanding {
    pub fn new(
        tag: Tag,
        request: FetchRequest,
        completer: FetchCompleter,
        timeout: Duration,
    ) -> Self {
        Self {
            tag,
            request,
            completer: Some(completer),
            state: RequestState::Pending,
            attempts: 0,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    fn transition(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal request transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Record a send attempt with the current timeout.
    pub fn mark_sent(&mut self, now: Instant) {
        self.transition(RequestState::Sent);
        self.attempts += 1;
        self.deadline = now + self.timeout;
        self.transition(RequestState::AwaitingReply);
    }

    /// Prepare a resend with a longer timeout.
    pub fn back_off(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Deliver the reply and finish.
    pub fn fulfil(&mut self, result: FetchResult) {
        self.transition(RequestState::Fulfilled);
        if let Some(c) = self.completer.take() {
            c.complete(result);
        }
    }

    /// Give up and finish.
    pub fn time_out(&mut self, result: FetchResult) {
        self.transition(RequestState::TimedOut);
        if let Some(c) = self.completer.take() {
            c.complete(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{GenerationId, MaterialIndex, PatchId, Rank, VarLabel};
    use tessera_warehouse::{pending_fetch, FetchTarget};

    fn outstanding() -> (Outstanding, tessera_warehouse::PendingFetch) {
        let (pending, completer) = pending_fetch();
        let req = FetchRequest {
            owner: Rank(1),
            label: VarLabel::cell("X"),
            patch: PatchId(0),
            material: MaterialIndex(0),
            generation: GenerationId(1),
            target: FetchTarget::Grid { window: None },
        };
        (
            Outstanding::new(Tag(1), req, completer, Duration::from_millis(10)),
            pending,
        )
    }

    #[test]
    fn legal_transitions() {
        use RequestState::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(AwaitingReply.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Fulfilled));
        assert!(!Fulfilled.can_transition_to(Sent));
        assert!(!TimedOut.can_transition_to(AwaitingReply));
        assert!(Fulfilled.is_terminal() && TimedOut.is_terminal());
    }

    #[test]
    fn send_then_fulfil_delivers() {
        let (mut o, pending) = outstanding();
        o.mark_sent(Instant::now());
        assert_eq!(o.state(), RequestState::AwaitingReply);
        assert_eq!(o.attempts, 1);
        o.fulfil(Ok(vec![5]));
        assert_eq!(o.state(), RequestState::Fulfilled);
        assert_eq!(pending.wait(), Ok(vec![5]));
    }

    #[test]
    fn resend_counts_attempts() {
        let (mut o, _pending) = outstanding();
        o.mark_sent(Instant::now());
        o.back_off(Duration::from_millis(20));
        o.mark_sent(Instant::now());
        assert_eq!(o.attempts, 2);
        assert_eq!(o.timeout, Duration::from_millis(20));
    }
}
