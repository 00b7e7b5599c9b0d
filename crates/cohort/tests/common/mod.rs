//! Shared fixtures for group scenarios
#![allow(dead_code)]
#![allow(clippy::expect_used)]

use cohort::{Communicator, MemoryIdentityRegistry, ProcessId};
use cohort_transport::MemoryBus;
use cohort_types::GroupConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Upper bound for any single scenario step
pub const STEP: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber once; `RUST_LOG` overrides the level
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Config whose token stays unborn for the duration of a test
pub fn quiet_config(group_size: usize) -> GroupConfig {
    let mut config = GroupConfig::with_group_size(group_size);
    config.token.bootstrap_delay = Duration::from_secs(3600);
    config
}

/// Config with a live token ring
pub fn ring_config(group_size: usize, bootstrap: Duration, idle_hop: Duration) -> GroupConfig {
    let mut config = GroupConfig::with_group_size(group_size);
    config.token.bootstrap_delay = bootstrap;
    config.token.idle_hop_delay = idle_hop;
    config
}

/// A whole group on one in-memory bus
pub struct Group {
    pub bus: Arc<MemoryBus>,
    pub members: Vec<Communicator>,
}

impl Group {
    /// Join `config.group_size` members in turn; member `i` gets id `i`
    pub async fn join(config: &GroupConfig) -> Self {
        init_tracing();
        let registry = MemoryIdentityRegistry::new(config.group_size).expect("registry");
        let bus = Arc::new(MemoryBus::new());
        let mut members = Vec::with_capacity(config.group_size);
        for i in 0..config.group_size {
            let member = Communicator::join(config, &registry, bus.clone())
                .await
                .expect("join");
            assert_eq!(member.id(), ProcessId(i as u32));
            members.push(member);
        }
        Self { bus, members }
    }

    pub fn member(&self, id: u32) -> Communicator {
        self.members[id as usize].clone()
    }
}

/// Await `fut`, failing the test if it takes longer than [`STEP`]
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP, fut)
        .await
        .expect("scenario step timed out")
}

/// Poll `condition` until it holds, failing after [`STEP`]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}

/// Give in-flight messages time to land
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
