//! Simulated host whose device mutations take time
//!
//! [`SimHost`] completes every call without yielding, so a batch never has
//! more than one operation pending. [`PacedHost`] delays each unbind, bind
//! and VF count write, counts how many are in flight at once and keeps a
//! timeline of when each one began and ended.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vfd_common::{PciHost, VfdResult};

use crate::sim_host::SimHost;

/// Start or end of one device mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Began(String),
    Ended(String),
}

impl MutationEvent {
    pub fn device(&self) -> &str {
        match self {
            MutationEvent::Began(d) | MutationEvent::Ended(d) => d,
        }
    }
}

/// [`SimHost`] wrapper adding a fixed delay to every device mutation.
pub struct PacedHost {
    inner: SimHost,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    events: Mutex<Vec<MutationEvent>>,
}

impl PacedHost {
    pub fn new(inner: SimHost, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped host, for state and log queries.
    pub fn sim(&self) -> &SimHost {
        &self.inner
    }

    /// Highest number of mutations observed in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<MutationEvent> {
        self.events.lock().clone()
    }

    async fn paced<T, F>(&self, device: &str, op: F) -> VfdResult<T>
    where
        F: Future<Output = VfdResult<T>>,
    {
        self.events.lock().push(MutationEvent::Began(device.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let result = op.await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(MutationEvent::Ended(device.to_string()));
        result
    }
}

#[async_trait]
impl PciHost for PacedHost {
    async fn device_exists(&self, id: &str) -> VfdResult<bool> {
        self.inner.device_exists(id).await
    }

    async fn vendor_id(&self, id: &str) -> VfdResult<String> {
        self.inner.vendor_id(id).await
    }

    async fn class_code(&self, id: &str) -> VfdResult<String> {
        self.inner.class_code(id).await
    }

    async fn iommu_group(&self, id: &str) -> VfdResult<Option<String>> {
        self.inner.iommu_group(id).await
    }

    async fn group_members(&self, group: &str) -> VfdResult<Vec<String>> {
        self.inner.group_members(group).await
    }

    async fn virtual_functions(&self, pf: &str) -> VfdResult<Vec<String>> {
        self.inner.virtual_functions(pf).await
    }

    async fn driver_report(&self, id: &str) -> VfdResult<String> {
        self.inner.driver_report(id).await
    }

    async fn is_module_loaded(&self, module: &str) -> VfdResult<bool> {
        self.inner.is_module_loaded(module).await
    }

    async fn load_module(&self, module: &str) -> VfdResult<()> {
        self.inner.load_module(module).await
    }

    async fn unload_module(&self, module: &str) -> VfdResult<()> {
        self.inner.unload_module(module).await
    }

    async fn unbind(&self, id: &str) -> VfdResult<String> {
        self.paced(id, self.inner.unbind(id)).await
    }

    async fn bind(&self, id: &str, driver: &str) -> VfdResult<()> {
        self.paced(id, self.inner.bind(id, driver)).await
    }

    async fn set_num_vfs(&self, pf: &str, count: u32) -> VfdResult<()> {
        self.paced(pf, self.inner.set_num_vfs(pf, count)).await
    }
}
