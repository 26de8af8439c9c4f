//! Mutex helpers.

use std::sync::{Mutex, MutexGuard};

/// Lock `mutex`. On poison: log and keep going with the inner state.
pub(crate) fn lock_or_recover<'a, T>(
    mutex: &'a Mutex<T>,
    what: &'static str,
) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "Mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn poisoned_lock_keeps_inner_state() {
        let mutex = Arc::new(Mutex::new(vec![1]));
        {
            let mutex = Arc::clone(&mutex);
            let _ = std::thread::spawn(move || {
                let _guard = mutex.lock().unwrap();
                panic!("poison");
            })
            .join();
        }
        assert!(mutex.is_poisoned());

        lock_or_recover(&mutex, "test").push(2);
        assert_eq!(*lock_or_recover(&mutex, "test"), vec![1, 2]);
    }
}
