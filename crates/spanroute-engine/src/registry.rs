//! Registry of probes awaiting a reply.

use spanroute_core::Span;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

/// An outstanding probe. Inserted before its packet leaves the socket and
/// removed exactly once: by the matching reply, the timeout sweep, or the
/// shutdown drain.
///
/// The probe owns its span handle and its limiter permit, so whichever path
/// takes the probe out of the registry also ends the span and, by dropping
/// the permit, frees the in-flight slot.
pub struct InflightProbe {
    pub start: Instant,
    pub ttl: u8,
    pub span: Box<dyn Span>,
    pub permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for InflightProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightProbe")
            .field("start", &self.start)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Concurrent map from correlation key to [`InflightProbe`].
///
/// UDP probe ids are 16-bit and widened into the shared 32-bit key space.
#[derive(Default)]
pub struct InflightRegistry {
    inner: Mutex<HashMap<u32, InflightProbe>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a probe under `key`. An occupied key hands the probe back so
    /// the caller can pick a fresh key.
    pub fn insert(&self, key: u32, probe: InflightProbe) -> Result<(), InflightProbe> {
        let mut inner = self.inner.lock().expect("inflight registry poisoned");
        match inner.entry(key) {
            Entry::Occupied(_) => Err(probe),
            Entry::Vacant(slot) => {
                slot.insert(probe);
                Ok(())
            }
        }
    }

    /// Atomically removes and returns the probe under `key`. At most one
    /// caller wins; the others see `None`.
    pub fn take(&self, key: u32) -> Option<InflightProbe> {
        self.inner
            .lock()
            .expect("inflight registry poisoned")
            .remove(&key)
    }

    /// Removes and returns every probe older than `timeout`. Entries taken
    /// concurrently by a reply cannot also be returned here.
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<InflightProbe> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("inflight registry poisoned");
        let expired: Vec<u32> = inner
            .iter()
            .filter(|(_, probe)| now.duration_since(probe.start) > timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| inner.remove(&key))
            .collect()
    }

    /// Removes and returns everything; used on shutdown so spans and permits
    /// are not leaked.
    pub fn drain(&self) -> Vec<InflightProbe> {
        let mut inner = self.inner.lock().expect("inflight registry poisoned");
        inner.drain().map(|(_, probe)| probe).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("inflight registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanroute_core::{NoopTracer, SpanKind, TraceContext, Tracer};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn probe(sem: &Arc<Semaphore>, ttl: u8, age: Duration) -> InflightProbe {
        let permit = sem.clone().try_acquire_owned().unwrap();
        let (span, _) = NoopTracer.start_span(&TraceContext::new(), "probe", SpanKind::Client, &[]);
        InflightProbe {
            start: Instant::now() - age,
            ttl,
            span,
            permit,
        }
    }

    #[test]
    fn test_insert_rejects_occupied_key() {
        let sem = Arc::new(Semaphore::new(4));
        let registry = InflightRegistry::new();

        assert!(registry.insert(7, probe(&sem, 1, Duration::ZERO)).is_ok());
        let rejected = registry.insert(7, probe(&sem, 2, Duration::ZERO));
        assert_eq!(rejected.unwrap_err().ttl, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_is_exactly_once() {
        let sem = Arc::new(Semaphore::new(4));
        let registry = InflightRegistry::new();
        registry.insert(7, probe(&sem, 3, Duration::ZERO)).unwrap();

        assert_eq!(registry.take(7).unwrap().ttl, 3);
        assert!(registry.take(7).is_none());
    }

    #[test]
    fn test_take_releases_permit() {
        let sem = Arc::new(Semaphore::new(1));
        let registry = InflightRegistry::new();
        registry.insert(1, probe(&sem, 1, Duration::ZERO)).unwrap();
        assert_eq!(sem.available_permits(), 0);

        drop(registry.take(1));
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_sweep_expired_only_removes_old_probes() {
        let sem = Arc::new(Semaphore::new(4));
        let registry = InflightRegistry::new();
        registry
            .insert(1, probe(&sem, 1, Duration::from_secs(10)))
            .unwrap();
        registry.insert(2, probe(&sem, 2, Duration::ZERO)).unwrap();

        let expired = registry.sweep_expired(Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ttl, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_empties_registry() {
        let sem = Arc::new(Semaphore::new(4));
        let registry = InflightRegistry::new();
        registry.insert(1, probe(&sem, 1, Duration::ZERO)).unwrap();
        registry.insert(2, probe(&sem, 2, Duration::ZERO)).unwrap();

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
