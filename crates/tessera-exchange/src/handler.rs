//! The background exchange worker and its owning handle.
//!
//! One worker thread runs per rank. It owns the rank's transport
//! [`Endpoint`] exclusively and multiplexes three kinds of work:
//!
//! ```text
//!   warehouse / scheduler threads           other ranks
//!            │ ExchangeClient::request           │ request / reply frames
//!            ▼                                   ▼
//!     [cmd channel]                         [endpoint inbox]
//!            └──────────────┬────────────────────┘
//!                           ▼
//!                   ExchangeWorker loop
//!                   ├── issue outgoing requests (Pending → Sent → AwaitingReply)
//!                   ├── serve incoming requests (or park them until produced)
//!                   ├── match replies to outstanding requests (→ Fulfilled)
//!                   └── on deadline: resend with backoff, or give up (→ TimedOut)
//! ```
//!
//! The worker only ever reads the warehouse through
//! [`DataWarehouse::serve`], which takes per-key slot locks; it never
//! blocks local `get`/`put` traffic.

use crate::client::ExchangeClient;
use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::metrics::{ExchangeMetrics, ExchangeMetricsSnapshot};
use crate::request::Outstanding;
use crate::transport::{Delivery, Endpoint};
use crate::wire::{self, Frame, ReplyFrame, RequestFrame, RequestKind};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tessera_core::{CommError, Rank, RemoteFailure, Tag, VariableCatalog};
use tessera_warehouse::{
    DataWarehouse, FetchCompleter, FetchRequest, FetchTarget, ServeOutcome, ServeRequest,
};
use tracing::{debug, error, info, trace, warn};

/// Work handed to the worker by clients.
#[derive(Debug)]
pub(crate) enum Command {
    Fetch {
        request: FetchRequest,
        completer: FetchCompleter,
    },
}

// ── ShutdownState ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Summary returned by [`MpiExchangeHandler::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests still outstanding when the quit sentinel arrived; the
    /// worker resolved all of them before exiting.
    pub drained: usize,
    /// Incoming requests that were still parked and got rejected.
    pub abandoned_parked: usize,
    /// Whether the worker thread was joined cleanly.
    pub joined: bool,
    /// Wall-clock time spent shutting down, in milliseconds.
    pub total_ms: u64,
}

#[derive(Debug, Default)]
struct WorkerReport {
    drained: usize,
    abandoned_parked: usize,
}

// ── MpiExchangeHandler ───────────────────────────────────────────

/// Owning handle of one rank's exchange worker.
///
/// Dropping the handle shuts the worker down.
pub struct MpiExchangeHandler {
    rank: Rank,
    world_size: usize,
    cmd_tx: Sender<Command>,
    quit_tx: Sender<Vec<u8>>,
    worker: Option<JoinHandle<WorkerReport>>,
    metrics: Arc<ExchangeMetrics>,
    state: ShutdownState,
}

impl MpiExchangeHandler {
    /// Start the worker for `endpoint`'s rank.
    ///
    /// The worker serves `warehouse` to other ranks, resolving label
    /// names through `catalog`. A client for this handler is attached to
    /// the warehouse so that its remote reads go through the worker.
    pub fn spawn(
        endpoint: Endpoint,
        warehouse: Arc<DataWarehouse>,
        catalog: Arc<VariableCatalog>,
        config: ExchangeConfig,
    ) -> Result<Self, ExchangeError> {
        config.validate()?;
        let rank = endpoint.rank();
        if warehouse.rank() != rank {
            return Err(ExchangeError::RankMismatch {
                endpoint: rank,
                warehouse: warehouse.rank(),
            });
        }
        let world_size = endpoint.world_size();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let quit_tx = endpoint.loopback();
        let metrics = Arc::new(ExchangeMetrics::default());

        let worker = ExchangeWorker {
            rank,
            world_size,
            endpoint,
            cmd_rx,
            warehouse: Arc::clone(&warehouse),
            catalog,
            config,
            metrics: Arc::clone(&metrics),
            outstanding: BTreeMap::new(),
            parked: Vec::new(),
            next_tag: 1,
            draining: false,
        };
        let handle = thread::Builder::new()
            .name(format!("tessera-exchange-{rank}"))
            .spawn(move || worker.run())
            .map_err(|e| ExchangeError::Spawn {
                reason: e.to_string(),
            })?;

        let handler = Self {
            rank,
            world_size,
            cmd_tx,
            quit_tx,
            worker: Some(handle),
            metrics,
            state: ShutdownState::Running,
        };
        warehouse.attach_remote(Arc::new(handler.client()));
        info!(rank = %rank, world_size, "exchange worker started");
        Ok(handler)
    }

    /// Rank served by this handler.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// A client that submits requests to this worker.
    pub fn client(&self) -> ExchangeClient {
        ExchangeClient::new(
            self.rank,
            self.world_size,
            self.cmd_tx.clone(),
            Arc::clone(&self.metrics),
        )
    }

    /// Current counter values.
    pub fn metrics(&self) -> ExchangeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the worker.
    ///
    /// Sends the quit sentinel, then waits for the worker to resolve
    /// every outstanding request (reply or timeout) and exit. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.state == ShutdownState::Stopped {
            return ShutdownReport {
                joined: true,
                ..ShutdownReport::default()
            };
        }
        let start = Instant::now();

        // Running → Draining
        self.state = ShutdownState::Draining;
        match wire::encode(&Frame::Request(RequestFrame::quit(self.rank))) {
            Ok(bytes) => {
                // The worker may already be gone; joining below covers it.
                let _ = self.quit_tx.send(bytes);
            }
            Err(e) => error!(rank = %self.rank, error = %e, "failed to encode quit sentinel"),
        }

        // Draining → Stopped
        let (report, joined) = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(report)) => (report, true),
            Some(Err(_)) => (WorkerReport::default(), false),
            None => (WorkerReport::default(), true),
        };
        self.state = ShutdownState::Stopped;

        let total_ms = start.elapsed().as_millis() as u64;
        info!(
            rank = %self.rank,
            drained = report.drained,
            abandoned = report.abandoned_parked,
            total_ms,
            "exchange worker stopped"
        );
        ShutdownReport {
            drained: report.drained,
            abandoned_parked: report.abandoned_parked,
            joined,
            total_ms,
        }
    }
}

impl Drop for MpiExchangeHandler {
    fn drop(&mut self) {
        if self.state != ShutdownState::Stopped {
            self.shutdown();
        }
    }
}

// ── ExchangeWorker ───────────────────────────────────────────────

/// An incoming request waiting for its data to be produced.
struct Parked {
    frame: RequestFrame,
    request: ServeRequest,
    since: Instant,
    warned: bool,
}

enum Event {
    Command(Command),
    CommandsClosed,
    Frame(Vec<u8>),
    InboxClosed,
    Idle,
}

struct ExchangeWorker {
    rank: Rank,
    world_size: usize,
    endpoint: Endpoint,
    cmd_rx: Receiver<Command>,
    warehouse: Arc<DataWarehouse>,
    catalog: Arc<VariableCatalog>,
    config: ExchangeConfig,
    metrics: Arc<ExchangeMetrics>,
    outstanding: BTreeMap<Tag, Outstanding>,
    parked: Vec<Parked>,
    next_tag: u64,
    draining: bool,
}

impl ExchangeWorker {
    fn run(mut self) -> WorkerReport {
        let poll = self.config.poll_interval();
        let cmd_rx = self.cmd_rx.clone();
        let inbox = self.endpoint.inbox().clone();
        let mut commands_open = true;
        let mut drained = 0;

        loop {
            let event = if commands_open {
                crossbeam_channel::select! {
                    recv(cmd_rx) -> cmd => cmd.map_or(Event::CommandsClosed, Event::Command),
                    recv(inbox) -> frame => frame.map_or(Event::InboxClosed, Event::Frame),
                    default(poll) => Event::Idle,
                }
            } else {
                match inbox.recv_timeout(poll) {
                    Ok(frame) => Event::Frame(frame),
                    Err(RecvTimeoutError::Timeout) => Event::Idle,
                    Err(RecvTimeoutError::Disconnected) => Event::InboxClosed,
                }
            };

            match event {
                Event::Command(cmd) => self.on_command(cmd),
                Event::CommandsClosed => commands_open = false,
                Event::Frame(bytes) => {
                    let was_draining = self.draining;
                    self.on_frame(bytes);
                    if self.draining && !was_draining {
                        drained = self.outstanding.len();
                    }
                }
                Event::InboxClosed => break,
                Event::Idle => {}
            }

            let now = Instant::now();
            self.check_deadlines(now);
            self.recheck_parked(now);

            if self.draining && self.outstanding.is_empty() {
                break;
            }
        }
        self.finish(drained)
    }

    fn finish(mut self, drained: usize) -> WorkerReport {
        let parked = std::mem::take(&mut self.parked);
        let abandoned_parked = parked.len();
        for p in parked {
            self.reply(
                &p.frame,
                Err(RemoteFailure::Rejected {
                    reason: format!("rank {} shutting down", self.rank),
                }),
            );
        }
        for (_, mut o) in std::mem::take(&mut self.outstanding) {
            o.time_out(Err(CommError::ShuttingDown));
        }
        WorkerReport {
            drained,
            abandoned_parked,
        }
    }

    // ── Outgoing requests ──────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Fetch { request, completer } => {
                if self.draining {
                    completer.complete(Err(CommError::ShuttingDown));
                    return;
                }
                if request.owner.index() >= self.world_size {
                    completer.complete(Err(CommError::Unreachable {
                        rank: request.owner,
                    }));
                    return;
                }
                let tag = Tag(self.next_tag);
                self.next_tag += 1;
                debug!(
                    rank = %self.rank,
                    owner = %request.owner,
                    tag = %tag,
                    label = %request.label,
                    patch = %request.patch,
                    generation = %request.generation,
                    "remote request issued"
                );
                let timeout = self.config.request_timeout();
                let mut o = Outstanding::new(tag, request, completer, timeout);
                self.metrics.add_sent(1);
                if self.send_request(&mut o, Instant::now()) {
                    self.outstanding.insert(tag, o);
                }
            }
        }
    }

    /// Encode and transmit `o`. Returns `false` if the request could not
    /// be encoded and has already been failed.
    fn send_request(&self, o: &mut Outstanding, now: Instant) -> bool {
        let (kind, window) = match o.request.target {
            FetchTarget::Grid { window } => (RequestKind::Grid, window),
            FetchTarget::Reduction => (RequestKind::Reduction, None),
        };
        let frame = Frame::Request(RequestFrame {
            from: self.rank,
            to: o.request.owner,
            tag: o.tag,
            kind,
            label: o.request.label.name().to_string(),
            patch: o.request.patch,
            material: o.request.material,
            generation: o.request.generation,
            window,
        });
        let bytes = wire::encode(&frame);
        o.mark_sent(now);
        match bytes {
            Ok(bytes) => {
                self.transmit(o.request.owner, bytes);
                true
            }
            Err(e) => {
                o.time_out(Err(CommError::Codec {
                    reason: e.to_string(),
                }));
                false
            }
        }
    }

    fn check_deadlines(&mut self, now: Instant) {
        let expired: Vec<Tag> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in expired {
            let Some(mut o) = self.outstanding.remove(&tag) else {
                continue;
            };
            if o.attempts > self.config.max_retries {
                error!(
                    rank = %self.rank,
                    owner = %o.request.owner,
                    tag = %tag,
                    label = %o.request.label,
                    patch = %o.request.patch,
                    attempts = o.attempts,
                    "remote request timed out"
                );
                self.metrics.add_timeout(1);
                let err = CommError::Timeout {
                    label: o.request.label.name().to_string(),
                    patch: o.request.patch,
                    owner: o.request.owner,
                    attempts: o.attempts,
                };
                o.time_out(Err(err));
                continue;
            }

            let next = self.config.next_timeout(o.timeout);
            warn!(
                rank = %self.rank,
                owner = %o.request.owner,
                tag = %tag,
                label = %o.request.label,
                attempt = o.attempts + 1,
                timeout_ms = next.as_millis() as u64,
                "no reply, resending request"
            );
            o.back_off(next);
            self.metrics.add_retry(1);
            if self.send_request(&mut o, now) {
                self.outstanding.insert(tag, o);
            }
        }
    }

    fn transmit(&self, to: Rank, bytes: Vec<u8>) {
        let len = bytes.len() as u64;
        match self.endpoint.send(to, bytes) {
            Some(Delivery::Delivered) => {
                trace!(from = %self.rank, to = %to, bytes = len, "frame sent");
                self.metrics.add_bytes_out(len);
            }
            Some(Delivery::Dropped) | Some(Delivery::Closed) | None => {
                trace!(from = %self.rank, to = %to, bytes = len, "frame lost");
                self.metrics.add_dropped(1);
            }
        }
    }

    // ── Incoming frames ────────────────────────────────────────────

    fn on_frame(&mut self, bytes: Vec<u8>) {
        self.metrics.add_bytes_in(bytes.len() as u64);
        let frame = match wire::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(rank = %self.rank, error = %e, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::Request(req) if req.kind == RequestKind::Quit => {
                if req.from == self.rank && !self.draining {
                    info!(
                        rank = %self.rank,
                        outstanding = self.outstanding.len(),
                        "quit received, draining"
                    );
                    self.draining = true;
                }
            }
            Frame::Request(req) => self.on_request(req),
            Frame::Reply(reply) => self.on_reply(reply),
        }
    }

    fn on_request(&mut self, frame: RequestFrame) {
        trace!(
            rank = %self.rank,
            from = %frame.from,
            tag = %frame.tag,
            label = %frame.label,
            "request received"
        );
        let label = match self.catalog.lookup(&frame.label) {
            Ok(label) => label,
            Err(e) => {
                self.reply(
                    &frame,
                    Err(RemoteFailure::Rejected {
                        reason: e.to_string(),
                    }),
                );
                return;
            }
        };
        let target = match frame.kind {
            RequestKind::Grid => FetchTarget::Grid {
                window: frame.window,
            },
            RequestKind::Reduction => FetchTarget::Reduction,
            RequestKind::Quit => return,
        };
        let request = ServeRequest {
            label,
            patch: frame.patch,
            material: frame.material,
            generation: frame.generation,
            target,
        };
        match self.warehouse.serve(&request) {
            ServeOutcome::Ready(bytes) => self.reply(&frame, Ok(bytes)),
            ServeOutcome::Failed(failure) => self.reply(&frame, Err(failure)),
            ServeOutcome::NotYet => self.park(frame, request),
        }
    }

    fn park(&mut self, frame: RequestFrame, request: ServeRequest) {
        // A resend of a request that is already parked.
        if self
            .parked
            .iter()
            .any(|p| p.frame.from == frame.from && p.frame.tag == frame.tag)
        {
            return;
        }
        debug!(
            rank = %self.rank,
            from = %frame.from,
            tag = %frame.tag,
            label = %frame.label,
            patch = %frame.patch,
            "request parked until produced"
        );
        self.metrics.add_parked(1);
        self.parked.push(Parked {
            frame,
            request,
            since: Instant::now(),
            warned: false,
        });
    }

    /// Total time a requester waits before giving up.
    fn park_budget(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut t = self.config.request_timeout();
        for _ in 0..=self.config.max_retries {
            total += t;
            t = self.config.next_timeout(t);
        }
        total
    }

    fn recheck_parked(&mut self, now: Instant) {
        if self.parked.is_empty() {
            return;
        }
        let budget = self.park_budget();
        for mut p in std::mem::take(&mut self.parked) {
            match self.warehouse.serve(&p.request) {
                ServeOutcome::Ready(bytes) => self.reply(&p.frame, Ok(bytes)),
                ServeOutcome::Failed(failure) => self.reply(&p.frame, Err(failure)),
                ServeOutcome::NotYet => {
                    if !p.warned && now.duration_since(p.since) > budget {
                        warn!(
                            rank = %self.rank,
                            from = %p.frame.from,
                            label = %p.frame.label,
                            patch = %p.frame.patch,
                            waited_ms = now.duration_since(p.since).as_millis() as u64,
                            "parked request exceeded the requester's retry budget"
                        );
                        p.warned = true;
                    }
                    self.parked.push(p);
                }
            }
        }
    }

    fn reply(&self, frame: &RequestFrame, payload: Result<Vec<u8>, RemoteFailure>) {
        let ok = payload.is_ok();
        let reply = Frame::Reply(ReplyFrame::new(self.rank, frame.from, frame.tag, payload));
        match wire::encode(&reply) {
            Ok(bytes) => {
                debug!(
                    rank = %self.rank,
                    to = %frame.from,
                    tag = %frame.tag,
                    label = %frame.label,
                    ok,
                    "request served"
                );
                self.metrics.add_served(1);
                self.transmit(frame.from, bytes);
            }
            Err(e) => error!(rank = %self.rank, error = %e, "failed to encode reply"),
        }
    }

    fn on_reply(&mut self, reply: ReplyFrame) {
        let Some(mut o) = self.outstanding.remove(&reply.tag) else {
            trace!(
                rank = %self.rank,
                from = %reply.from,
                tag = %reply.tag,
                "late or duplicate reply dropped"
            );
            return;
        };
        if reply.from != o.request.owner {
            warn!(
                rank = %self.rank,
                tag = %reply.tag,
                expected = %o.request.owner,
                got = %reply.from,
                "reply from unexpected rank ignored"
            );
            self.outstanding.insert(reply.tag, o);
            return;
        }
        self.metrics.add_reply(1);
        let result = reply.payload.map_err(|failure| CommError::Remote {
            owner: reply.from,
            failure,
        });
        debug!(
            rank = %self.rank,
            owner = %reply.from,
            tag = %reply.tag,
            bytes = reply.len,
            attempts = o.attempts,
            ok = result.is_ok(),
            "request fulfilled"
        );
        o.fulfil(result);
    }
}
