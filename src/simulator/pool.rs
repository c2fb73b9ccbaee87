//! Pool of sandbox instances with FIFO handout and guaranteed release.
//!
//! One instance is owned by exactly one audit at a time. Acquisition waits in
//! arrival order (the underlying tokio semaphore is FIFO-fair); release is
//! tied to handle drop, so an instance returns to the pool on every exit
//! path, including cancellation.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::anvil::AnvilSimulator;
use super::{Simulator, SimulatorError};
use crate::config::SimulatorConfig;

/// Spacing between the probe bases of pooled instances, so their upward port
/// probes cannot collide.
const PORT_STRIDE: u16 = 100;

/// Owns up to N simulator instances keyed by distinct starting ports.
pub struct SimulatorPool {
    instances: Vec<Arc<dyn Simulator>>,
    available: Mutex<VecDeque<usize>>,
    permits: Arc<Semaphore>,
}

impl SimulatorPool {
    /// Build a pool over pre-constructed instances (used by tests to inject
    /// scripted simulators).
    #[must_use]
    pub fn from_instances(instances: Vec<Arc<dyn Simulator>>) -> Arc<Self> {
        let count = instances.len();
        Arc::new(Self {
            instances,
            available: Mutex::new((0..count).collect()),
            permits: Arc::new(Semaphore::new(count)),
        })
    }

    /// Build the production pool: `pool_size` anvil instances, each probing
    /// from its own port range.
    #[must_use]
    pub fn anvil(config: &SimulatorConfig) -> Arc<Self> {
        let size = config.pool_size.max(1);
        let instances = (0..size)
            .map(|i| {
                let mut instance_config = config.clone();
                instance_config.base_port =
                    config.base_port.saturating_add(i as u16 * PORT_STRIDE);
                Arc::new(AnvilSimulator::new(instance_config)) as Arc<dyn Simulator>
            })
            .collect();
        Self::from_instances(instances)
    }

    /// Number of instances in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.instances.len()
    }

    /// Acquire an instance, waiting FIFO behind earlier requesters.
    pub async fn acquire(self: Arc<Self>) -> Result<PooledSimulator, SimulatorError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SimulatorError::NotRunning)?;
        let index = self
            .available
            .lock()
            .pop_front()
            .expect("semaphore permit guarantees an available instance");
        Ok(PooledSimulator {
            pool: self,
            index,
            _permit: permit,
        })
    }

    /// Tear down every instance. Outstanding handles keep working against
    /// stopped children and will fail their next call.
    pub async fn shutdown(&self) {
        for instance in &self.instances {
            instance.shutdown().await;
        }
        self.permits.close();
    }

    fn release(&self, index: usize) {
        self.available.lock().push_back(index);
    }
}

/// Scoped handle to one pooled instance; releases on drop.
pub struct PooledSimulator {
    pool: Arc<SimulatorPool>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSimulator {
    type Target = dyn Simulator;

    fn deref(&self) -> &Self::Target {
        self.pool.instances[self.index].as_ref()
    }
}

impl Drop for PooledSimulator {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::models::{SimulationRequest, SimulationResult};
    use crate::simulator::{BalanceInfo, CodeInfo};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MarkerSimulator {
        started: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Simulator for MarkerSimulator {
        async fn ensure_started(&self) -> Result<u64, SimulatorError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(1)
        }

        async fn simulate(
            &self,
            _request: &SimulationRequest,
        ) -> Result<SimulationResult, SimulatorError> {
            Err(SimulatorError::NotRunning)
        }

        async fn get_balance(
            &self,
            _address: &str,
            _token: Option<&str>,
        ) -> Result<BalanceInfo, SimulatorError> {
            Err(SimulatorError::NotRunning)
        }

        async fn get_code(&self, _address: &str) -> Result<CodeInfo, SimulatorError> {
            Err(SimulatorError::NotRunning)
        }

        async fn shutdown(&self) {
            self.started.store(false, Ordering::SeqCst);
        }

        async fn is_running(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }
    }

    fn marker_pool(count: usize) -> Arc<SimulatorPool> {
        SimulatorPool::from_instances(
            (0..count)
                .map(|_| {
                    Arc::new(MarkerSimulator {
                        started: AtomicBool::new(false),
                    }) as Arc<dyn Simulator>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn handle_returns_instance_on_drop() {
        let pool = marker_pool(1);
        {
            let handle = Arc::clone(&pool).acquire().await.unwrap();
            handle.ensure_started().await.unwrap();
        }
        // Dropping the handle must make the single instance available again.
        let again = Arc::clone(&pool).acquire().await.unwrap();
        assert!(again.is_running().await);
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let pool = marker_pool(1);
        let first = Arc::clone(&pool).acquire().await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|_| ()) });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_all_instances() {
        let pool = marker_pool(2);
        for _ in 0..2 {
            let handle = Arc::clone(&pool).acquire().await.unwrap();
            handle.ensure_started().await.unwrap();
        }
        pool.shutdown().await;
        assert!(Arc::clone(&pool).acquire().await.is_err());
    }
}
