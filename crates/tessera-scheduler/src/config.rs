//! Scheduler configuration, validation, and error types.

use serde::{Deserialize, Serialize};
use tessera_core::Rank;
use tessera_exchange::{ExchangeConfig, ExchangeError};
use tessera_warehouse::{WarehouseConfig, WarehouseError};

/// Largest ghost width a configuration may allow.
pub const MAX_GHOST_LIMIT: u32 = 16;

// ── SchedulerKind ────────────────────────────────────────────────

/// Which scheduler [`SchedulerFactory`](crate::SchedulerFactory) builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Everything on one rank; no exchange worker.
    #[default]
    Single,
    /// `world_size` ranks connected through an exchange worker each.
    Distributed {
        /// Number of ranks in the run.
        world_size: usize,
    },
}

impl SchedulerKind {
    /// Number of ranks this kind runs on.
    pub fn world_size(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Distributed { world_size } => *world_size,
        }
    }
}

// ── SchedulerConfig ──────────────────────────────────────────────

/// Everything needed to build a scheduler for one rank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Single or distributed.
    pub kind: SchedulerKind,
    /// Widest ghost halo a task may request. Default: 2.
    pub max_ghost_cells: u32,
    /// Warehouse settings.
    pub warehouse: WarehouseConfig,
    /// Exchange worker settings (distributed runs only).
    pub exchange: ExchangeConfig,
    /// Smoothing window of the cost forecaster, in timesteps. Default: 8.
    pub forecast_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Single,
            max_ghost_cells: 2,
            warehouse: WarehouseConfig::default(),
            exchange: ExchangeConfig::default(),
            forecast_window: 8,
        }
    }
}

impl SchedulerConfig {
    /// Check structural invariants, including the nested configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind.world_size() == 0 {
            return Err(ConfigError::InvalidWorldSize { world_size: 0 });
        }
        if self.max_ghost_cells > MAX_GHOST_LIMIT {
            return Err(ConfigError::GhostLimit {
                configured: self.max_ghost_cells,
                limit: MAX_GHOST_LIMIT,
            });
        }
        if self.forecast_window == 0 {
            return Err(ConfigError::InvalidForecastWindow { window: 0 });
        }
        self.warehouse.validate()?;
        if matches!(self.kind, SchedulerKind::Distributed { .. }) {
            self.exchange.validate()?;
        }
        Ok(())
    }
}

// ── ConfigError ──────────────────────────────────────────────────

/// Errors detected while validating configuration or wiring a scheduler.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A distributed run needs at least one rank.
    #[error("world size must be at least 1, got {world_size}")]
    InvalidWorldSize {
        /// The configured size.
        world_size: usize,
    },
    /// `max_ghost_cells` exceeds the supported limit.
    #[error("max_ghost_cells {configured} exceeds the limit of {limit}")]
    GhostLimit {
        /// The configured width.
        configured: u32,
        /// The limit.
        limit: u32,
    },
    /// The forecast window is zero.
    #[error("forecast window must be at least 1, got {window}")]
    InvalidForecastWindow {
        /// The configured window.
        window: usize,
    },
    /// The rank is outside the configured world.
    #[error("rank {rank} is outside a world of {world_size}")]
    RankOutOfRange {
        /// The rank.
        rank: Rank,
        /// Configured world size.
        world_size: usize,
    },
    /// The load balancer disagrees with the configured world size.
    #[error("load balancer spans {balancer} ranks, configuration says {configured}")]
    BalancerMismatch {
        /// Ranks the balancer assigns to.
        balancer: usize,
        /// Configured world size.
        configured: usize,
    },
    /// A distributed scheduler was requested without a transport endpoint.
    #[error("distributed scheduler for rank {rank} needs a transport endpoint")]
    EndpointRequired {
        /// The rank being built.
        rank: Rank,
    },
    /// The transport endpoint belongs to a different rank or world.
    #[error("endpoint is rank {endpoint_rank} of {endpoint_world}, expected rank {rank} of {world_size}")]
    EndpointMismatch {
        /// Rank of the endpoint.
        endpoint_rank: Rank,
        /// World size of the endpoint's cluster.
        endpoint_world: usize,
        /// Rank being built.
        rank: Rank,
        /// Configured world size.
        world_size: usize,
    },
    /// The warehouse rejected its configuration.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    /// The exchange layer rejected its configuration or failed to start.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
