//! Liveness/readiness flags for the selected backend and its watches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Watches the Kubernetes observer must establish before reporting ready.
const REQUIRED_WATCHES: [&str; 3] = ["pods", "deployments", "services"];

#[derive(Clone, Default)]
pub struct Health {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    backend_reachable: AtomicBool,
    established: Mutex<HashSet<&'static str>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_backend(&self, reachable: bool) {
        self.inner
            .backend_reachable
            .store(reachable, Ordering::Relaxed);
    }

    pub fn set_watch_established(&self, watch: &'static str) {
        self.inner.established.lock().unwrap().insert(watch);
    }

    pub fn set_watch_lost(&self, watch: &'static str) {
        self.inner.established.lock().unwrap().remove(watch);
    }

    pub fn backend_reachable(&self) -> bool {
        self.inner.backend_reachable.load(Ordering::Relaxed)
    }

    /// Docker mode is ready once the engine answers pings; Kubernetes mode is
    /// degraded until all three watches are established.
    pub fn ready(&self, kubernetes: bool) -> bool {
        if !self.backend_reachable() {
            return false;
        }
        if !kubernetes {
            return true;
        }
        let established = self.inner.established.lock().unwrap();
        REQUIRED_WATCHES.iter().all(|watch| established.contains(watch))
    }
}
