//! Subsystem instance.
//!
//! A [`Subsystem`] bundles everything the process core shares across
//! processes: configuration, the external collaborators, the pid registry
//! and the pid counter. Processes hold a reference to the subsystem they
//! were created by.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use futures_util::task::{LocalSpawn, LocalSpawnExt};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::generation::Generation;
use crate::platform::{Handle, Loader, Microkernel, Procfs, ServiceEndpoint};
use crate::process::{Pid, PidRegistry, Process, ProcessGroup, TerminalSession};

/// External collaborators of one subsystem instance.
#[derive(Clone)]
pub struct Platform {
    pub kernel: Arc<dyn Microkernel>,
    pub loader: Arc<dyn Loader>,
    pub endpoint: Arc<dyn ServiceEndpoint>,
    pub procfs: Arc<dyn Procfs>,
    /// Executor the per-generation serve loops run on.
    pub spawner: Arc<dyn LocalSpawn>,
    /// Server-side mbus lane handed to every new universe.
    pub mbus_lane: Handle,
}

pub struct Subsystem {
    config: ServerConfig,
    platform: Platform,
    registry: Arc<PidRegistry>,
    next_pid: AtomicI32,
}

impl Subsystem {
    pub fn new(config: ServerConfig, platform: Platform) -> Arc<Self> {
        let next_pid = AtomicI32::new(config.first_pid);
        Arc::new(Self {
            config,
            platform,
            registry: PidRegistry::new(),
            next_pid,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<dyn Microkernel> {
        &self.platform.kernel
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.platform.loader
    }

    pub fn procfs(&self) -> &Arc<dyn Procfs> {
        &self.platform.procfs
    }

    pub fn mbus_lane(&self) -> Handle {
        self.platform.mbus_lane
    }

    pub fn registry(&self) -> &Arc<PidRegistry> {
        &self.registry
    }

    /// Hand out the next unused pid.
    pub fn allocate_pid(&self) -> Pid {
        loop {
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            if !self.registry.contains(pid) {
                return pid;
            }
        }
    }

    pub fn find_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.registry.find_process(pid)
    }

    pub fn find_process_group(&self, pid: Pid) -> Option<Arc<ProcessGroup>> {
        self.registry.find_process_group(pid)
    }

    pub fn find_session(&self, pid: Pid) -> Option<Arc<TerminalSession>> {
        self.registry.find_session(pid)
    }

    /// Start the serve loop of `generation`.
    pub(crate) fn spawn_serve(&self, process: Arc<Process>, generation: Arc<Generation>) {
        let endpoint = self.platform.endpoint.clone();
        let pid = process.pid();
        let serve = async move { endpoint.serve(process, generation).await };
        if let Err(e) = self.platform.spawner.spawn_local(serve) {
            log::error!("[POSIX PROC] Failed to spawn serve loop of process {}: {:?}", pid, e);
        }
    }

    /// Start the init process.
    pub async fn launch_init(self: &Arc<Self>, path: &str) -> Result<Arc<Process>> {
        Process::init(self, path).await
    }
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subsystem")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
