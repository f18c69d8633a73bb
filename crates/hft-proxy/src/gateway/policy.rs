//! Per-rule admission control.
//!
//! Every rule gets its own [`AdmissionControl`] so one busy rule cannot
//! starve the others. The accept loop asks for an [`Admission`] before
//! spawning a session; the admission travels with the session task and frees
//! its slot on drop.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Runtime session limiter for one rule.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    /// `None` = unbounded.
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
}

impl AdmissionControl {
    /// Create a limiter allowing `limit` concurrent sessions, or any number
    /// when `limit` is `None`.
    pub fn new(limit: Option<usize>) -> Self {
        let limit = limit.map(|l| l.min(Semaphore::MAX_PERMITS));
        Self {
            limit,
            permits: limit.map(|l| Arc::new(Semaphore::new(l))),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Try to admit one more session without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` when the rule is at its session limit.
    pub fn admit(&self) -> Result<Admission, String> {
        let Some(permits) = &self.permits else {
            return Ok(Admission { _permit: None });
        };
        match permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Admission {
                _permit: Some(permit),
            }),
            Err(TryAcquireError::NoPermits) => Err(format!(
                "session limit reached ({}/{})",
                self.in_use(),
                self.limit.unwrap_or_default()
            )),
            Err(TryAcquireError::Closed) => Err("admission closed".to_string()),
        }
    }

    /// Sessions currently admitted. Always 0 for an unbounded limiter.
    pub fn in_use(&self) -> usize {
        match (&self.permits, self.limit) {
            (Some(permits), Some(limit)) => limit - permits.available_permits(),
            _ => 0,
        }
    }
}

/// Slot held by a running session.
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_always_admits() {
        let control = AdmissionControl::unbounded();
        let held: Vec<_> = (0..1000).map(|_| control.admit().unwrap()).collect();
        assert_eq!(held.len(), 1000);
        assert_eq!(control.in_use(), 0);
    }

    #[test]
    fn limit_is_enforced() {
        let control = AdmissionControl::new(Some(2));
        let _a = control.admit().unwrap();
        let _b = control.admit().unwrap();
        let err = control.admit().unwrap_err();
        assert!(err.contains("2/2"), "unexpected message: {err}");
    }

    #[test]
    fn admission_releases_on_drop() {
        let control = AdmissionControl::new(Some(1));
        {
            let _a = control.admit().unwrap();
            assert_eq!(control.in_use(), 1);
            assert!(control.admit().is_err());
        }
        assert_eq!(control.in_use(), 0);
        assert!(control.admit().is_ok());
    }
}
