//! Process-wide "log once" guard.
//!
//! Keys are remembered for the lifetime of the process.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static FIRED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Returns `true` the first time `key` is seen in this process, `false` afterwards.
pub fn log_once(key: &str) -> bool {
    let fired = FIRED.get_or_init(|| Mutex::new(HashSet::new()));
    // A panic while holding the lock cannot leave the set half-updated.
    let mut fired = match fired.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    fired.insert(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_key() {
        assert!(log_once("log_once_test_a"));
        assert!(!log_once("log_once_test_a"));
        assert!(!log_once("log_once_test_a"));
        assert!(log_once("log_once_test_b"));
    }

    #[test]
    fn test_concurrent_callers_fire_once() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| log_once("log_once_test_threads")))
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&first| first)
            .count();
        assert_eq!(fired, 1);
    }
}
