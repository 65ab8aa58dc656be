//! Host-side port allocation and adb forwarding for device RPC.
//!
//! One [`PortAllocator`] is shared by every controller in the process, so two
//! live forwarders never hold the same host port. Each controller owns a
//! [`PortForwarder`] that pairs a host port with its device port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use crate::app::adb::proxy::CommandProxy;
use crate::app::error::AppError;

pub const DEFAULT_PORT_RANGE_START: u16 = 20000;
pub const DEFAULT_PORT_RANGE_END: u16 = 30000;

type PortProbe = Box<dyn Fn(u16) -> bool + Send + Sync>;

fn loopback_port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

pub struct PortAllocator {
    base_port: u16,
    max_port: u16,
    used: Mutex<HashSet<u16>>,
    probe: PortProbe,
}

impl PortAllocator {
    /// Allocator over `[base_port, max_port)` that probes the OS by binding.
    pub fn new(base_port: u16, max_port: u16) -> Self {
        Self::with_probe(base_port, max_port, loopback_port_is_free)
    }

    pub fn with_probe(
        base_port: u16,
        max_port: u16,
        probe: impl Fn(u16) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            base_port,
            max_port: max_port.max(base_port),
            used: Mutex::new(HashSet::new()),
            probe: Box::new(probe),
        }
    }

    /// The process-wide allocator. The first caller fixes the range.
    pub fn global(base_port: u16, max_port: u16) -> Arc<PortAllocator> {
        static GLOBAL: OnceLock<Arc<PortAllocator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(PortAllocator::new(base_port, max_port))))
    }

    /// Next port in range that is neither held nor taken by another process.
    pub fn allocate(&self) -> Option<u16> {
        let mut used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        for port in self.base_port..self.max_port {
            if used.contains(&port) {
                continue;
            }
            if (self.probe)(port) {
                used.insert(port);
                return Some(port);
            }
        }
        None
    }

    pub fn release(&self, port: u16) {
        let mut used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        used.remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        let used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        used.contains(&port)
    }

    pub fn allocated_ports(&self) -> Vec<u16> {
        let used = self.used.lock().unwrap_or_else(|err| err.into_inner());
        let mut ports: Vec<u16> = used.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn allocated_count(&self) -> usize {
        self.used.lock().unwrap_or_else(|err| err.into_inner()).len()
    }

    pub fn available_count(&self) -> usize {
        usize::from(self.max_port - self.base_port).saturating_sub(self.allocated_count())
    }

    /// Whether the OS would let us bind `port` right now.
    pub fn is_free(&self, port: u16) -> bool {
        (self.probe)(port)
    }
}

/// One device's host port and the adb forward bound to it.
pub struct PortForwarder {
    allocator: Arc<PortAllocator>,
    device_port: u16,
    host_port: Option<u16>,
    forwarded: bool,
}

impl PortForwarder {
    pub fn new(allocator: Arc<PortAllocator>, device_port: u16) -> Self {
        Self {
            allocator,
            device_port,
            host_port: None,
            forwarded: false,
        }
    }

    pub fn host_port(&self) -> Option<u16> {
        self.host_port
    }

    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Takes a fresh host port, returning any previously held one first.
    pub fn allocate(&mut self, trace_id: &str) -> Result<u16, AppError> {
        if let Some(old) = self.host_port.take() {
            self.allocator.release(old);
        }
        let port = self.allocator.allocate().ok_or_else(|| {
            AppError::resource_exhausted(
                format!(
                    "No free host port left ({} held by this process)",
                    self.allocator.allocated_count()
                ),
                trace_id,
            )
        })?;
        self.host_port = Some(port);
        Ok(port)
    }

    pub fn bind(
        &mut self,
        proxy: &dyn CommandProxy,
        host_port: u16,
        trace_id: &str,
    ) -> Result<(), AppError> {
        proxy.forward(host_port, self.device_port)?;
        self.host_port = Some(host_port);
        self.forwarded = true;
        debug!(
            trace_id = %trace_id,
            serial = %proxy.serial(),
            host_port,
            device_port = self.device_port,
            "port forwarded"
        );
        Ok(())
    }

    /// Removes the adb forward. A second call is a no-op.
    pub fn unbind(&mut self, proxy: &dyn CommandProxy, trace_id: &str) -> Result<(), AppError> {
        if !self.forwarded {
            return Ok(());
        }
        self.forwarded = false;
        let Some(port) = self.host_port else {
            return Ok(());
        };
        proxy.remove_forward(port).map_err(|err| {
            warn!(trace_id = %trace_id, serial = %proxy.serial(), port, error = %err, "failed to remove forward");
            err
        })
    }

    /// Unbinds and gives the port back to the shared table.
    pub fn release(&mut self, proxy: &dyn CommandProxy, trace_id: &str) -> Result<(), AppError> {
        let unbound = self.unbind(proxy, trace_id);
        if let Some(port) = self.host_port.take() {
            self.allocator.release(port);
        }
        unbound
    }

    /// Makes sure a forward is live and returns its host port. A live forward
    /// is reused; a held port is rebound if the OS still reports it free;
    /// otherwise a new port is allocated.
    pub fn ensure_forwarded(
        &mut self,
        proxy: &dyn CommandProxy,
        trace_id: &str,
    ) -> Result<u16, AppError> {
        if let (true, Some(port)) = (self.forwarded, self.host_port) {
            return Ok(port);
        }
        let port = match self.host_port {
            Some(port) if self.allocator.is_free(port) => port,
            _ => self.allocate(trace_id)?,
        };
        self.bind(proxy, port, trace_id)?;
        info!(trace_id = %trace_id, serial = %proxy.serial(), host_port = port, "forward ready");
        Ok(port)
    }
}
