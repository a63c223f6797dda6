//! Builds a ready-to-run [`Scheduler`] from a [`SchedulerConfig`].

use crate::balance::LoadBalancer;
use crate::config::{ConfigError, SchedulerConfig, SchedulerKind};
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tessera_core::{Grid, Rank, VariableCatalog};
use tessera_exchange::{Endpoint, MpiExchangeHandler};
use tessera_warehouse::DataWarehouse;
use tracing::{info, warn};

/// Selects and wires the scheduler implementation for a configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerFactory;

impl SchedulerFactory {
    /// Build the scheduler for `rank`.
    ///
    /// For [`SchedulerKind::Single`] this is a warehouse plus scheduler.
    /// For [`SchedulerKind::Distributed`] it also starts the exchange
    /// worker on `endpoint`, which must belong to `rank` in a cluster of
    /// the configured size.
    pub fn create(
        config: SchedulerConfig,
        rank: Rank,
        grid: Arc<Grid>,
        catalog: Arc<VariableCatalog>,
        balancer: Arc<dyn LoadBalancer>,
        endpoint: Option<Endpoint>,
    ) -> Result<Scheduler, ConfigError> {
        config.validate()?;
        let world_size = config.kind.world_size();
        if rank.index() >= world_size {
            return Err(ConfigError::RankOutOfRange { rank, world_size });
        }
        if balancer.world_size() != world_size {
            return Err(ConfigError::BalancerMismatch {
                balancer: balancer.world_size(),
                configured: world_size,
            });
        }

        let warehouse = Arc::new(DataWarehouse::new(
            rank,
            grid,
            config.warehouse.clone(),
        )?);

        match config.kind {
            SchedulerKind::Single => {
                if endpoint.is_some() {
                    warn!(rank = %rank, "single-rank scheduler ignores its transport endpoint");
                }
                let scheduler = Scheduler::new(warehouse, catalog, balancer, config)?;
                info!(rank = %rank, kind = "single", "scheduler created");
                Ok(scheduler)
            }
            SchedulerKind::Distributed { world_size } => {
                let endpoint = endpoint.ok_or(ConfigError::EndpointRequired { rank })?;
                if endpoint.rank() != rank || endpoint.world_size() != world_size {
                    return Err(ConfigError::EndpointMismatch {
                        endpoint_rank: endpoint.rank(),
                        endpoint_world: endpoint.world_size(),
                        rank,
                        world_size,
                    });
                }
                let handler = MpiExchangeHandler::spawn(
                    endpoint,
                    Arc::clone(&warehouse),
                    Arc::clone(&catalog),
                    config.exchange.clone(),
                )?;
                let mut scheduler = Scheduler::new(warehouse, catalog, balancer, config)?;
                scheduler.attach_exchange(handler);
                info!(rank = %rank, kind = "distributed", world_size, "scheduler created");
                Ok(scheduler)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{RoundRobin, SingleRank};
    use tessera_core::Extents;
    use tessera_exchange::LocalCluster;

    fn grid() -> Arc<Grid> {
        Arc::new(Grid::uniform(Extents::new([0, 0, 0], [4, 2, 2]), [2, 1, 1]).unwrap())
    }

    fn distributed(world_size: usize) -> SchedulerConfig {
        SchedulerConfig {
            kind: SchedulerKind::Distributed { world_size },
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn single_needs_no_endpoint() {
        let s = SchedulerFactory::create(
            SchedulerConfig::default(),
            Rank(0),
            grid(),
            Arc::new(VariableCatalog::new()),
            Arc::new(SingleRank),
            None,
        )
        .unwrap();
        assert!(s.exchange_client().is_none());
    }

    #[test]
    fn distributed_requires_matching_endpoint() {
        let err = SchedulerFactory::create(
            distributed(2),
            Rank(1),
            grid(),
            Arc::new(VariableCatalog::new()),
            Arc::new(RoundRobin::new(2).unwrap()),
            None,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::EndpointRequired { rank: Rank(1) });

        let mut cluster = LocalCluster::new(2, 64);
        let endpoint = cluster.take_endpoint(Rank(0));
        let err = SchedulerFactory::create(
            distributed(2),
            Rank(1),
            grid(),
            Arc::new(VariableCatalog::new()),
            Arc::new(RoundRobin::new(2).unwrap()),
            endpoint,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EndpointMismatch { endpoint_rank: Rank(0), .. }));
    }

    #[test]
    fn distributed_attaches_exchange() {
        let mut cluster = LocalCluster::new(2, 64);
        let mut s = SchedulerFactory::create(
            distributed(2),
            Rank(1),
            grid(),
            Arc::new(VariableCatalog::new()),
            Arc::new(RoundRobin::new(2).unwrap()),
            cluster.take_endpoint(Rank(1)),
        )
        .unwrap();
        assert_eq!(s.exchange_client().map(|c| c.rank()), Some(Rank(1)));
        let report = s.shutdown().unwrap();
        assert!(report.joined);
    }

    #[test]
    fn rank_outside_world_rejected() {
        let err = SchedulerFactory::create(
            distributed(2),
            Rank(2),
            grid(),
            Arc::new(VariableCatalog::new()),
            Arc::new(RoundRobin::new(2).unwrap()),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::RankOutOfRange {
                rank: Rank(2),
                world_size: 2
            }
        );
    }
}
