//! Exclusive-use locks.
//!
//! A file with the exclusive mode bit may be open through only one handle at
//! a time. The lock is a lease: every use by the holder renews it, and once
//! it lapses another handle may take it over. A holder that finds its own
//! lease lapsed loses the lock and is told so.

use crate::types::FidId;

/// Lease length in seconds.
pub const DEFAULT_LEASE_SECS: u32 = 5 * 60;

/// Lock state attached to an entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExclLock {
    /// Handle holding the lock.
    pub holder: FidId,
    /// Time after which the lease has lapsed.
    pub expires: u32,
}

/// Result of trying to take or renew a lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExclOutcome {
    /// The caller holds the lock.
    Granted,
    /// Another handle holds a live lease.
    Held,
    /// The caller's own lease had lapsed; the lock was dropped.
    Broken,
}

/// Take, renew or take over the lock for `fid`.
pub fn acquire(lock: &mut Option<ExclLock>, fid: FidId, now: u32, lease: u32) -> ExclOutcome {
    match *lock {
        Some(x) if x.expires < now && x.holder == fid => {
            *lock = None;
            return ExclOutcome::Broken;
        }
        Some(x) if x.expires >= now && x.holder != fid => return ExclOutcome::Held,
        _ => {}
    }
    *lock = Some(ExclLock {
        holder: fid,
        expires: now.saturating_add(lease),
    });
    ExclOutcome::Granted
}

/// Drop the lock if `fid` holds it.
pub fn release(lock: &mut Option<ExclLock>, fid: FidId) {
    if lock.is_some_and(|x| x.holder == fid) {
        *lock = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_renew() {
        let mut lock = None;
        assert_eq!(acquire(&mut lock, 1, 100, 300), ExclOutcome::Granted);
        assert_eq!(lock.unwrap().expires, 400);
        assert_eq!(acquire(&mut lock, 1, 200, 300), ExclOutcome::Granted);
        assert_eq!(lock.unwrap().expires, 500);
    }

    #[test]
    fn test_other_holder_blocked_until_expiry() {
        let mut lock = None;
        acquire(&mut lock, 1, 100, 300);
        assert_eq!(acquire(&mut lock, 2, 400, 300), ExclOutcome::Held);
        assert_eq!(acquire(&mut lock, 2, 401, 300), ExclOutcome::Granted);
        assert_eq!(lock.unwrap().holder, 2);
    }

    #[test]
    fn test_own_expired_lease_is_broken() {
        let mut lock = None;
        acquire(&mut lock, 1, 100, 300);
        assert_eq!(acquire(&mut lock, 1, 401, 300), ExclOutcome::Broken);
        assert!(lock.is_none());
        // and may be taken again
        assert_eq!(acquire(&mut lock, 1, 402, 300), ExclOutcome::Granted);
    }

    #[test]
    fn test_release_only_by_holder() {
        let mut lock = None;
        acquire(&mut lock, 1, 0, 300);
        release(&mut lock, 2);
        assert!(lock.is_some());
        release(&mut lock, 1);
        assert!(lock.is_none());
    }
}
