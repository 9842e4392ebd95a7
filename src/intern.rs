//! Process-wide string interning.
//!
//! Bruteforce runs touch the same labels and answer strings millions of
//! times; interning collapses them to shared allocations.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static POOL: Lazy<Mutex<HashSet<Arc<str>>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Returns the canonical shared representation of `value`.
///
/// Repeated values across the process resolve to the same allocation. The
/// empty string is returned without touching the pool.
pub fn intern(value: &str) -> Arc<str> {
    if value.is_empty() {
        return Arc::from("");
    }

    let mut pool = POOL.lock().expect("intern pool poisoned");
    if let Some(existing) = pool.get(value) {
        return Arc::clone(existing);
    }
    let entry: Arc<str> = Arc::from(value);
    pool.insert(Arc::clone(&entry));
    entry
}
