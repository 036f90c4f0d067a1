//! Resource monitor
//!
//! Samples the local host on a timer, appends the sample under
//! [`LOCAL_SAMPLE_KEY`] and broadcasts it as `RESOURCE_UPDATE` to every
//! connected peer. Samples reported by peers are only recorded.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Disks, System};
use tracing::debug;

use crate::connection::ConnectionSupervisor;
use crate::error::MeshResult;
use crate::events::{EventBus, NetworkEvent};
use crate::protocol::MeshMessage;
use crate::storage::{Records, LOCAL_SAMPLE_KEY};
use crate::types::{now_millis, PeerId, ResourceSample};

/// Source of local resource samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> MeshResult<ResourceSample>;
}

/// Host metrics via `sysinfo`
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first sample is meaningful
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> MeshResult<ResourceSample> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let storage_used: u64 = disks
            .list()
            .iter()
            .map(|d| d.total_space().saturating_sub(d.available_space()))
            .sum();

        Ok(ResourceSample {
            cpu: system.global_cpu_usage(),
            load_average: System::load_average().one,
            memory_used: system.used_memory(),
            memory_free: system.free_memory(),
            memory_total: system.total_memory(),
            storage_used,
            uptime_secs: System::uptime(),
            updated: now_millis(),
        })
    }
}

/// Fixed sample, restamped on every call
pub struct StaticProbe {
    sample: ResourceSample,
}

impl StaticProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self { sample }
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> MeshResult<ResourceSample> {
        Ok(ResourceSample {
            updated: now_millis(),
            ..self.sample.clone()
        })
    }
}

/// Samples, persists and reports resources
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    records: Records,
    supervisor: ConnectionSupervisor,
    events: EventBus,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        records: Records,
        supervisor: ConnectionSupervisor,
        events: EventBus,
    ) -> Self {
        Self {
            probe,
            records,
            supervisor,
            events,
        }
    }

    /// Take a local sample, persist it and broadcast it to connected peers
    pub async fn sample_and_report(&self) -> MeshResult<ResourceSample> {
        let sample = self.probe.sample()?;
        self.records.append_sample(LOCAL_SAMPLE_KEY, &sample)?;

        let envelope = MeshMessage::ResourceUpdate(sample.clone()).to_envelope()?;
        let report = self.supervisor.broadcast(&envelope).await;
        debug!(
            cpu = sample.cpu,
            memory_used = sample.memory_used,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Reported resources"
        );

        self.events
            .emit(NetworkEvent::ResourceReported { peer_id: None });
        Ok(sample)
    }

    /// Record a sample a peer sent us
    pub fn record_remote(&self, peer_id: &PeerId, sample: &ResourceSample) -> MeshResult<()> {
        self.records.append_sample(peer_id.as_str(), sample)?;
        debug!(peer_id = %peer_id.short(), cpu = sample.cpu, "Recorded peer resources");
        self.events.emit(NetworkEvent::ResourceReported {
            peer_id: Some(peer_id.clone()),
        });
        Ok(())
    }

    /// Local samples, oldest first
    pub fn local_history(&self) -> MeshResult<Vec<ResourceSample>> {
        self.records.list_samples(LOCAL_SAMPLE_KEY)
    }

    /// Samples reported by a peer, oldest first
    pub fn peer_history(&self, peer_id: &PeerId) -> MeshResult<Vec<ResourceSample>> {
        self.records.list_samples(peer_id.as_str())
    }
}
