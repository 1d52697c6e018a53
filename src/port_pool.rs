//! Allocates internal ports for instances from a fixed inclusive range.

use std::collections::BTreeSet;
use std::net::TcpListener;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no free ports remaining in the configured range")]
    Exhausted,
}

struct PoolState {
    free: BTreeSet<u16>,
}

/// Shared allocator of internal ports. Safe to call from any task.
pub struct PortPool {
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Builds a pool covering `[from, to]` inclusive.
    pub fn new(from: u16, to: u16) -> Self {
        let free = (from..=to).collect();
        Self {
            state: Mutex::new(PoolState { free }),
        }
    }

    /// Reserves a port, preferring the lowest free one (deterministic for tests).
    pub fn reserve(&self) -> Result<u16, PoolError> {
        let mut state = self.state.lock();
        loop {
            let candidate = *state.free.iter().next().ok_or(PoolError::Exhausted)?;
            state.free.remove(&candidate);
            if is_port_available(candidate) {
                return Ok(candidate);
            }
            // Someone outside our own bookkeeping is squatting on this port; drop it
            // permanently from the pool rather than spin forever on it.
        }
    }

    /// Returns a port to the free set.
    ///
    /// Releasing a port that this pool did not hand out (still present in the
    /// free set) is a programming error.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock();
        if state.free.contains(&port) {
            tracing::error!(port, "released a port that was already free");
            debug_assert!(false, "double release of port {port}");
            return;
        }
        state.free.insert(port);
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().free.is_empty()
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_round_trips() {
        let pool = PortPool::new(20000, 20002);
        assert_eq!(pool.free_count(), 3);
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 1);
        pool.release(a);
        assert_eq!(pool.free_count(), 2);
        pool.release(b);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = PortPool::new(30000, 30000);
        let a = pool.reserve().unwrap();
        assert!(matches!(pool.reserve(), Err(PoolError::Exhausted)));
        pool.release(a);
        assert!(pool.reserve().is_ok());
    }

    #[test]
    fn prefers_lowest_numbered_port() {
        let pool = PortPool::new(40000, 40005);
        let a = pool.reserve().unwrap();
        assert_eq!(a, 40000);
        let b = pool.reserve().unwrap();
        assert_eq!(b, 40001);
    }
}
