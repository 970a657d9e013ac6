//! Test support utilities shared across unit and integration tests.

mod relay;

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;

use tokio::sync::{Mutex, MutexGuard};

pub use relay::{BindRecord, HelloRecord, MockRelay, RELAY_DOMAIN};

/// Serialises tests that mutate process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Restores environment variables when dropped.
#[derive(Debug)]
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs.iter().map(|(key, value)| (*key, Some(*value)))).await
    }

    /// Removes variables for the guard's lifetime.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        Self::apply(keys.iter().map(|key| (*key, None))).await
    }

    async fn apply<'a>(changes: impl Iterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let changes: Vec<_> = changes.collect();
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                changes.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variables"
        );
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::new();
        for (key, value) in changes {
            previous.push((key.to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe {
                match value {
                    Some(inner) => env::set_var(key, inner),
                    None => env::remove_var(key),
                }
            }
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
