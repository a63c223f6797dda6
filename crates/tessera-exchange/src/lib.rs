//! Cross-rank variable exchange for Tessera.
//!
//! Each rank runs one [`MpiExchangeHandler`]. Its background worker
//! issues requests on behalf of the local warehouse, serves the local
//! warehouse to other ranks, and retries lost or slow requests with
//! exponential backoff:
//!
//! ```text
//! rank A                                         rank B
//! DataWarehouse::get ─▶ ExchangeClient ─▶ worker ──Request──▶ worker ─▶ DataWarehouse::serve
//!        ▲                                   │                  │          (or park until put)
//!        └──────── PendingFetch ◀────────────┴─────Reply◀───────┘
//! ```
//!
//! Ranks are connected through a [`LocalCluster`] of in-process
//! endpoints; frames are opaque byte buffers, so lossy or isolated links
//! can be simulated for testing.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod request;
pub mod transport;
pub mod wire;

pub use client::ExchangeClient;
pub use config::ExchangeConfig;
pub use error::ExchangeError;
pub use handler::{MpiExchangeHandler, ShutdownReport};
pub use metrics::{ExchangeMetrics, ExchangeMetricsSnapshot};
pub use request::RequestState;
pub use transport::{Delivery, Endpoint, FaultHandle, LocalCluster};
pub use wire::{Frame, ReplyFrame, RequestFrame, RequestKind};
