//! Remote fetch abstraction.
//!
//! The warehouse does not know how data moves between ranks. It hands a
//! [`FetchRequest`] to whatever [`RemoteFetch`] implementation is
//! attached and gets back a [`PendingFetch`]: an explicit future that
//! resolves to the serialized payload. The caller decides where to
//! suspend, either by blocking in [`PendingFetch::wait`] or by polling
//! it as a `std::future::Future`.

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tessera_core::{CommError, Extents, GenerationId, MaterialIndex, PatchId, Rank, VarLabel};

/// What a remote request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTarget {
    /// Grid data, optionally restricted to a window.
    Grid {
        /// Window in storage space; `None` for the whole patch variable.
        window: Option<Extents>,
    },
    /// The owner's sealed reduction partial.
    Reduction,
}

/// A request for data held by another rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Rank holding the data.
    pub owner: Rank,
    /// Variable.
    pub label: VarLabel,
    /// Patch (ignored by owners for reductions).
    pub patch: PatchId,
    /// Material.
    pub material: MaterialIndex,
    /// Generation on the owner.
    pub generation: GenerationId,
    /// Grid window or reduction.
    pub target: FetchTarget,
}

/// Result of a completed fetch: the encoded payload.
pub type FetchResult = Result<Vec<u8>, CommError>;

/// Transport used by the warehouse to reach other ranks.
pub trait RemoteFetch: Send + Sync {
    /// Start a request. Must not block.
    fn request(&self, request: FetchRequest) -> PendingFetch;
}

#[derive(Debug, Default)]
struct FetchState {
    result: Option<FetchResult>,
    waker: Option<Waker>,
}

#[derive(Debug, Default)]
struct FetchShared {
    state: Mutex<FetchState>,
    ready: Condvar,
}

impl FetchShared {
    fn complete(&self, result: FetchResult) {
        let waker = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
    }
}

/// Create a linked pending fetch and its completer.
pub fn pending_fetch() -> (PendingFetch, FetchCompleter) {
    let shared = Arc::new(FetchShared::default());
    (
        PendingFetch {
            shared: Arc::clone(&shared),
        },
        FetchCompleter {
            shared: Some(shared),
        },
    )
}

/// The receiving half of a remote request.
#[derive(Debug)]
pub struct PendingFetch {
    shared: Arc<FetchShared>,
}

impl PendingFetch {
    /// A fetch that is already resolved.
    pub fn ready(result: FetchResult) -> Self {
        let (pending, completer) = pending_fetch();
        completer.complete(result);
        pending
    }

    /// `true` once a result is available.
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }

    /// Take the result if it has arrived.
    pub fn try_take(&mut self) -> Option<FetchResult> {
        self.shared.state.lock().result.take()
    }

    /// Block the calling thread until the result arrives.
    pub fn wait(self) -> FetchResult {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            self.shared.ready.wait(&mut state);
        }
    }
}

impl Future for PendingFetch {
    type Output = FetchResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FetchResult> {
        let mut state = self.shared.state.lock();
        match state.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// The sending half of a remote request, held by the transport.
///
/// Dropping a completer without completing it resolves the fetch with
/// [`CommError::Disconnected`], so a waiter can never hang on a request
/// the transport has forgotten.
#[derive(Debug)]
pub struct FetchCompleter {
    shared: Option<Arc<FetchShared>>,
}

impl FetchCompleter {
    /// Resolve the fetch.
    pub fn complete(mut self, result: FetchResult) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl Drop for FetchCompleter {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(CommError::Disconnected));
        }
    }
}
