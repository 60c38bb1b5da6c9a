//! Registry of live sessions and the capacity gate in front of it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::bridge::{Session, SessionId, SessionInfo};
use crate::admission::{AdmissionError, RateLimiter};

/// Tracks every live session and enforces the concurrent session cap.
///
/// A slot is reserved when a request is admitted and released when the
/// session unregisters, or when the [`AdmissionPermit`] is dropped unused.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Live sessions plus outstanding permits.
    reserved: AtomicUsize,
    max_sessions: usize,
    limiter: Arc<RateLimiter>,
}

/// A reserved session slot.
///
/// Consumed when the session registers; dropping it unused frees the slot.
#[must_use = "dropping a permit releases its slot"]
pub struct AdmissionPermit {
    registry: Arc<SessionRegistry>,
    identity: String,
    armed: bool,
}

impl AdmissionPermit {
    /// The client the permit was issued to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release_slot();
        }
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(max_sessions: usize, limiter: Arc<RateLimiter>) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions,
            limiter,
        }
    }

    /// Admits a new session for `identity` or says why not.
    ///
    /// Capacity is checked first, so a request turned away for capacity never
    /// spends a token. A rate-limited request gives its slot back.
    pub fn try_admit(self: &Arc<Self>, identity: &str) -> Result<AdmissionPermit, AdmissionError> {
        let max = self.max_sessions;
        if self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            tracing::warn!(client = %identity, max, "Session limit reached");
            return Err(AdmissionError::AtCapacity { max });
        }

        if !self.limiter.allow(identity) {
            self.release_slot();
            tracing::warn!(client = %identity, "Rate limit exceeded");
            return Err(AdmissionError::RateLimited {
                identity: identity.to_string(),
            });
        }

        Ok(AdmissionPermit {
            registry: Arc::clone(self),
            identity: identity.to_string(),
            armed: true,
        })
    }

    /// Adds a started session, consuming its permit.
    pub(crate) fn register(&self, mut permit: AdmissionPermit, session: Arc<Session>) {
        permit.armed = false;
        let id = session.id().to_string();
        self.sessions.insert(id.clone(), session);
        tracing::debug!(session_id = %id, active = self.sessions.len(), "Registered session");
    }

    /// Removes a session and frees its slot. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        if self.sessions.remove(id).is_some() {
            self.release_slot();
            tracing::debug!(session_id = %id, active = self.sessions.len(), "Unregistered session");
            true
        } else {
            false
        }
    }

    /// Looks up a live session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of reserved slots, live sessions included.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Configured session cap.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Snapshot of every live session.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    /// Cancels every live session. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        // Collect first so sessions unregistering themselves never wait on a shard lock
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &sessions {
            session.cancel();
        }
        sessions.len()
    }

    /// The rate limiter consulted on admission.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn release_slot(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_sessions: usize, rate: f64, burst: u32) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            max_sessions,
            Arc::new(RateLimiter::new(rate, burst)),
        ))
    }

    #[test]
    fn test_admit_reserves_slot() {
        let registry = registry(10, 10.0, 20);

        let permit = registry.try_admit("10.0.0.1").unwrap();
        assert_eq!(permit.identity(), "10.0.0.1");
        assert_eq!(registry.reserved(), 1);
        assert_eq!(registry.count(), 0);

        drop(permit);
        assert_eq!(registry.reserved(), 0);
    }

    #[test]
    fn test_twenty_five_attempts_one_identity() {
        let registry = registry(100, 10.0, 20);

        let mut permits = Vec::new();
        let mut rejected = 0;
        for _ in 0..25 {
            match registry.try_admit("client") {
                Ok(permit) => permits.push(permit),
                Err(AdmissionError::RateLimited { identity }) => {
                    assert_eq!(identity, "client");
                    rejected += 1;
                }
                Err(e) => panic!("unexpected rejection: {e}"),
            }
        }

        assert_eq!(permits.len(), 20);
        assert_eq!(rejected, 5);
        assert_eq!(registry.reserved(), 20);
    }

    #[test]
    fn test_capacity_rejection_does_not_spend_tokens() {
        let registry = registry(1, 0.001, 2);

        let _held = registry.try_admit("a").unwrap();
        assert_eq!(
            registry.try_admit("a").err(),
            Some(AdmissionError::AtCapacity { max: 1 })
        );
        drop(_held);

        // One token left from the burst of two
        let permit = registry.try_admit("a").unwrap();
        drop(permit);
        assert!(matches!(
            registry.try_admit("a"),
            Err(AdmissionError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_rate_rejection_releases_slot() {
        let registry = registry(5, 0.001, 1);

        let _permit = registry.try_admit("a").unwrap();
        assert!(registry.try_admit("a").is_err());
        assert_eq!(registry.reserved(), 1);

        let _other = registry.try_admit("b").unwrap();
        assert_eq!(registry.reserved(), 2);
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = registry(5, 10.0, 20);
        assert!(!registry.unregister("missing"));
        assert_eq!(registry.reserved(), 0);
        assert!(registry.list().is_empty());
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_concurrent_admission_respects_cap() {
        let registry = registry(10, 1000.0, 1000);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..10)
                        .filter_map(|_| registry.try_admit(&format!("client-{i}")).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let permits: Vec<AdmissionPermit> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(permits.len(), 10);
        assert_eq!(registry.reserved(), 10);

        drop(permits);
        assert_eq!(registry.reserved(), 0);
    }
}
