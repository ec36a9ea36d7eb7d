//! Static registry of the worker pool.
//!
//! Workers are configuration, not persisted state: a location, a base URL,
//! and a priority. Health is probed at dispatch time, never stored.

use crate::types::WorkerLocation;

/// One worker machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub location: WorkerLocation,
    pub base_url: String,

    /// Lower is tried first.
    pub priority: u8,
}

impl WorkerEndpoint {
    pub fn new(location: WorkerLocation, base_url: impl Into<String>, priority: u8) -> Self {
        WorkerEndpoint {
            location,
            base_url: base_url.into(),
            priority,
        }
    }
}

/// The ordered set of known workers.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    workers: Vec<WorkerEndpoint>,
}

impl WorkerRegistry {
    /// Builds a registry; workers are ordered by ascending priority.
    pub fn new(mut workers: Vec<WorkerEndpoint>) -> Self {
        workers.sort_by_key(|w| w.priority);
        WorkerRegistry { workers }
    }

    /// The primary worker (lowest priority number), if any is configured.
    pub fn primary(&self) -> Option<&WorkerEndpoint> {
        self.workers.first()
    }

    /// The single fallback worker, if one is configured. There are no
    /// further fallback tiers.
    pub fn fallback(&self) -> Option<&WorkerEndpoint> {
        self.workers.get(1)
    }

    /// Looks up a worker by location.
    pub fn get(&self, location: WorkerLocation) -> Option<&WorkerEndpoint> {
        self.workers.iter().find(|w| w.location == location)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_priority_not_insertion() {
        let registry = WorkerRegistry::new(vec![
            WorkerEndpoint::new(WorkerLocation::Vm, "http://vm.internal:8080", 2),
            WorkerEndpoint::new(WorkerLocation::Host, "http://host.internal:8080", 1),
        ]);

        assert_eq!(registry.primary().unwrap().location, WorkerLocation::Host);
        assert_eq!(registry.fallback().unwrap().location, WorkerLocation::Vm);
    }

    #[test]
    fn single_worker_has_no_fallback() {
        let registry = WorkerRegistry::new(vec![WorkerEndpoint::new(
            WorkerLocation::Host,
            "http://host.internal:8080",
            1,
        )]);

        assert!(registry.primary().is_some());
        assert!(registry.fallback().is_none());
    }

    #[test]
    fn lookup_by_location() {
        let registry = WorkerRegistry::new(vec![
            WorkerEndpoint::new(WorkerLocation::Host, "http://host.internal:8080", 1),
            WorkerEndpoint::new(WorkerLocation::Vm, "http://vm.internal:8080", 2),
        ]);

        assert_eq!(
            registry.get(WorkerLocation::Vm).unwrap().base_url,
            "http://vm.internal:8080"
        );
    }
}
