use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

static LAST_ID: AtomicU64 = AtomicU64::new(0);
const MAX_PLAUSIBLE_ID: u64 = i64::MAX as u64;

/// A fresh container id: wall-clock nanoseconds in hex, bumped so that ids
/// handed out by one process are strictly increasing even when the clock
/// stalls or steps back.
pub fn generate_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last.saturating_add(1));
        match LAST_ID.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return format!("{candidate:016x}"),
            Err(actual) => last = actual,
        }
    }
}

/// Make sure ids generated from now on sort after `id`. Called for every
/// container recovered from disk.
pub fn observe(id: &str) {
    let Ok(value) = u64::from_str_radix(id, 16) else {
        return;
    };
    // The clock will not reach this until 2262; anything above was not ours.
    if value > MAX_PLAUSIBLE_ID {
        warn!("ignoring implausible container id {id}");
        return;
    }
    LAST_ID.fetch_max(value, Ordering::SeqCst);
}

/// Ids are lowercase hex; anything else never came from `generate_id`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn observed_ids_are_never_reissued() {
        observe("7fffffffffffffff");
        let next = generate_id();
        assert!(next.as_str() > "7fffffffffffffff", "{next}");
    }

    #[test]
    fn implausible_observed_id_cannot_exhaust_the_space() {
        observe("ffffffffffffffff");
        let a = generate_id();
        let b = generate_id();
        assert!(a < b, "{a} {b}");
        assert!(!a.starts_with('f'), "{a}");
    }

    #[test]
    fn ids_strictly_increase() {
        let a = generate_id();
        let b = generate_id();
        let c = generate_id();
        assert!(a < b && b < c, "{a} {b} {c}");
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| (0..200).map(|_| generate_id()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn generated_ids_validate() {
        assert!(is_valid_id(&generate_id()));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("ABC"));
    }
}
