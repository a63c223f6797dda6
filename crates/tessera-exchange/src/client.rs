//! Cloneable handle for submitting remote requests.

use crate::error::ExchangeError;
use crate::handler::Command;
use crate::metrics::{ExchangeMetrics, ExchangeMetricsSnapshot};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tessera_core::{GenerationId, MaterialIndex, PatchId, Rank, VarLabel};
use tessera_warehouse::codec;
use tessera_warehouse::{pending_fetch, FetchRequest, FetchTarget, PendingFetch, RemoteFetch};
use tracing::debug;

/// Submits requests to one rank's exchange worker.
///
/// Cheap to clone. [`RemoteFetch::request`] never blocks: it hands the
/// request to the worker and returns the completion handle.
#[derive(Clone, Debug)]
pub struct ExchangeClient {
    rank: Rank,
    world_size: usize,
    cmd_tx: Sender<Command>,
    metrics: Arc<ExchangeMetrics>,
}

impl ExchangeClient {
    pub(crate) fn new(
        rank: Rank,
        world_size: usize,
        cmd_tx: Sender<Command>,
        metrics: Arc<ExchangeMetrics>,
    ) -> Self {
        Self {
            rank,
            world_size,
            cmd_tx,
            metrics,
        }
    }

    /// Rank this client issues requests from.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the run.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Counters of the worker behind this client.
    pub fn metrics(&self) -> ExchangeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Combine `local` with every other rank's sealed partial of `label`.
    ///
    /// Partials are folded in ascending rank order, so every rank computes
    /// a bit-identical global value. Blocks until all partials arrive or a
    /// request runs out of retries.
    pub fn all_reduce(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
        generation: GenerationId,
        local: f64,
    ) -> Result<f64, ExchangeError> {
        let op = label
            .reduction_op()
            .ok_or_else(|| ExchangeError::NotAReduction {
                label: label.name().to_string(),
            })?;

        let pending: Vec<(Rank, PendingFetch)> = (0..self.world_size as u32)
            .map(Rank)
            .filter(|r| *r != self.rank)
            .map(|owner| {
                let fetch = self.request(FetchRequest {
                    owner,
                    label: label.clone(),
                    patch: PatchId(0),
                    material,
                    generation,
                    target: FetchTarget::Reduction,
                });
                (owner, fetch)
            })
            .collect();

        let mut partials = Vec::with_capacity(self.world_size);
        partials.push((self.rank, local));
        for (owner, fetch) in pending {
            let bytes = fetch.wait()?;
            partials.push((owner, codec::decode_reduction(&bytes)?.value));
        }
        partials.sort_by_key(|(rank, _)| *rank);

        let global = op.fold(partials.iter().map(|(_, v)| *v));
        debug!(
            rank = %self.rank,
            label = %label,
            op = %op,
            global,
            "reduction combined"
        );
        Ok(global)
    }
}

impl RemoteFetch for ExchangeClient {
    fn request(&self, request: FetchRequest) -> PendingFetch {
        let (pending, completer) = pending_fetch();
        // A stopped worker drops the completer, which resolves the fetch
        // as disconnected.
        let _ = self.cmd_tx.send(Command::Fetch { request, completer });
        pending
    }
}
