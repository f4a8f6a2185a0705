//! Shared test utilities for keel-shard tests.

use std::sync::Arc;

use keel_meta::SuperblockStore;
use keel_repl::{
    CommitListener, DeviceConfig, InMemoryChunkSelector, MemReplDevice, ReplDevice,
};
use keel_types::PgId;

use crate::manager::ShardManager;

pub const TEST_PG: PgId = 7;
pub const TEST_BLOCK_SIZE: u64 = 512;

/// One replica of a test cluster: its device, manager, and collaborators.
pub struct Replica {
    pub device: Arc<MemReplDevice>,
    pub manager: Arc<ShardManager>,
    pub selector: Arc<InMemoryChunkSelector>,
    pub store: Arc<SuperblockStore>,
}

/// A group of replicas sharing one replicated log, with every manager
/// attached as its device's commit listener and the given PGs registered.
pub struct TestCluster {
    pub replicas: Vec<Replica>,
}

impl TestCluster {
    pub fn leader(&self) -> &Replica {
        &self.replicas[0]
    }
}

/// Build a cluster of `replicas` replicas with the given PGs registered.
pub fn cluster(replicas: usize, pgs: &[PgId]) -> TestCluster {
    let devices = MemReplDevice::group(DeviceConfig {
        block_size: TEST_BLOCK_SIZE,
        replicas,
    });

    let replicas = devices
        .into_iter()
        .map(|device| attach_manager(device, Arc::new(SuperblockStore::in_memory()), pgs))
        .collect();

    TestCluster { replicas }
}

/// Attach a fresh manager to a device, registering the given PGs.
///
/// Used both for initial cluster construction and to model a replica
/// restarting: the device (the log) survives, the manager and its in-memory
/// state do not.
pub fn attach_manager(
    device: Arc<MemReplDevice>,
    store: Arc<SuperblockStore>,
    pgs: &[PgId],
) -> Replica {
    let selector = Arc::new(InMemoryChunkSelector::new());
    let manager = ShardManager::new(store.clone(), selector.clone());
    for &pg in pgs {
        manager.register_pg(pg, Some(device.clone() as Arc<dyn ReplDevice>));
    }
    device.attach(manager.clone() as Arc<dyn CommitListener>);
    Replica {
        device,
        manager,
        selector,
        store,
    }
}
