use std::sync::atomic::{AtomicBool, Ordering};

/// Single-flight gate over a shared flag. Callers that fail to acquire skip
/// their critical section; nobody waits.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    flag: AtomicBool,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a sentry iff this call flipped the flag from clear to set.
    pub fn try_acquire(&self) -> Option<Sentry<'_>> {
        if self.flag.swap(true, Ordering::AcqRel) {
            return None;
        }

        Some(Sentry { flag: &self.flag })
    }

    pub fn is_held(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Ownership of a [`ReentrancyGuard`]. The flag clears when this drops.
#[derive(Debug)]
pub struct Sentry<'a> {
    flag: &'a AtomicBool,
}

impl Drop for Sentry<'_> {
    fn drop(&mut self) {
        let was_set = self.flag.swap(false, Ordering::AcqRel);

        debug_assert!(was_set, "sentry released a flag it did not hold");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let guard = ReentrancyGuard::new();

        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.try_acquire().is_none());
        assert!(guard.is_held());

        drop(first);

        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_failed_acquire_does_not_release() {
        let guard = ReentrancyGuard::new();

        let _owner = guard.try_acquire().unwrap();

        // A losing handle going out of scope must leave the owner's flag alone.
        {
            let loser = guard.try_acquire();
            assert!(loser.is_none());
        }

        assert!(guard.is_held());
    }

    #[test]
    fn test_at_most_one_concurrent_owner() {
        let guard = Arc::new(ReentrancyGuard::new());
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                let inside = inside.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for _ in 0..1_000 {
                        if let Some(_sentry) = guard.try_acquire() {
                            let concurrent = inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(concurrent, 0);
                            winners.fetch_add(1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(winners.load(Ordering::SeqCst) > 0);
        assert!(!guard.is_held());
    }
}
