//! Periodic engine maintenance.
//!
//! One background thread asks the engine to evict idle pooled resources
//! on a fixed interval. Stopping raises the shared stop signal, which
//! wakes the thread immediately instead of letting it sleep out the tick.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use heron_common::shutdown::StopSignal;

use crate::engine::Engine;

pub struct MaintenanceJob {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceJob {
    /// Starts the maintenance thread. Fails only if the thread cannot be
    /// spawned; the caller decides whether to run degraded without it.
    pub fn start(engine: Arc<Engine>) -> std::io::Result<Self> {
        let stop = StopSignal::new();
        let signal = stop.clone();
        let interval = Duration::from_millis(engine.config().maintenance_interval_ms);

        let handle = std::thread::Builder::new()
            .name("heron-maintenance".into())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "maintenance started");
                while !signal.wait_timeout(interval) {
                    if engine.release_inactive() {
                        tracing::debug!("idle pooled resources released");
                    }
                }
                tracing::debug!("maintenance stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.raise();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceJob {
    fn drop(&mut self) {
        self.stop();
    }
}
