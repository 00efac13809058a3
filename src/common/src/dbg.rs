//! The debug-line ring: a bounded, lock-free diagnostic side channel.
//! Modelled on `dbg.c`'s `g_dbg` table — keys are compile-time constant
//! strings, compared by *pointer* identity rather than content, so two
//! textually-identical `&'static str` literals at different call sites are
//! deliberately distinct keys, matching the original.

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

const MAX_NUM_LINES: usize = 256;
const MAX_INSTANCES_PER_LINE: usize = 2;

struct Occurrence {
    time: AtomicPtr<SystemTime>,
    errno: AtomicPtr<i32>,
    detail: AtomicPtr<String>,
}

impl Occurrence {
    const fn new() -> Self {
        Self {
            time: AtomicPtr::new(std::ptr::null_mut()),
            errno: AtomicPtr::new(std::ptr::null_mut()),
            detail: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn store(&self, time: SystemTime, errno: Option<i32>, detail: String) {
        let prev_time = self
            .time
            .swap(Box::into_raw(Box::new(time)), Ordering::AcqRel);
        let prev_errno = self.errno.swap(
            errno.map(|e| Box::into_raw(Box::new(e))).unwrap_or(std::ptr::null_mut()),
            Ordering::AcqRel,
        );
        let prev_detail = self
            .detail
            .swap(Box::into_raw(Box::new(detail)), Ordering::AcqRel);

        // swap-then-free: whichever thread's swap returned the previous
        // pointer is the one responsible for dropping it, so the same
        // pointer is never freed twice.
        if !prev_time.is_null() {
            drop(unsafe { Box::from_raw(prev_time) });
        }
        if !prev_errno.is_null() {
            drop(unsafe { Box::from_raw(prev_errno) });
        }
        if !prev_detail.is_null() {
            drop(unsafe { Box::from_raw(prev_detail) });
        }
    }

    /// Best-effort read of this slot; `None` if it has never been written.
    fn snapshot(&self) -> Option<OccurrenceRecord> {
        let time_ptr = self.time.load(Ordering::Acquire);
        if time_ptr.is_null() {
            return None;
        }
        // SAFETY: non-null only after `store` boxed a value here; the
        // pointee is never mutated in place, only swapped and freed, so a
        // racing free can only ever replace this pointer, not invalidate
        // the value this particular read observed.
        let time = unsafe { *time_ptr };

        let errno_ptr = self.errno.load(Ordering::Acquire);
        let errno = if errno_ptr.is_null() {
            None
        } else {
            Some(unsafe { *errno_ptr })
        };

        let detail_ptr = self.detail.load(Ordering::Acquire);
        let detail = if detail_ptr.is_null() {
            String::new()
        } else {
            unsafe { (*detail_ptr).clone() }
        };

        Some(OccurrenceRecord { time, errno, detail })
    }
}

struct Line {
    key: AtomicPtr<u8>,
    // `key`'s data pointer alone can't be turned back into a `&str`: the
    // length has to be carried alongside it. Written once, alongside the
    // CAS that claims `key`, and never changed afterwards, so a plain
    // relaxed load/store pair is enough — no torn reads, since every writer
    // that can observe a given `key` pointer writes the same length.
    key_len: AtomicUsize,
    count: AtomicU64,
    instances: [Occurrence; MAX_INSTANCES_PER_LINE],
}

impl Line {
    const fn new() -> Self {
        Self {
            key: AtomicPtr::new(std::ptr::null_mut()),
            key_len: AtomicUsize::new(0),
            count: AtomicU64::new(0),
            instances: [Occurrence::new(), Occurrence::new()],
        }
    }
}

fn key_ptr(key: &'static str) -> *mut u8 {
    key.as_ptr() as *mut u8
}

pub struct LineTable {
    lines: Vec<Line>,
}

impl LineTable {
    pub fn new() -> Self {
        Self {
            lines: (0..MAX_NUM_LINES).map(|_| Line::new()).collect(),
        }
    }

    /// Record one occurrence of `key`, coalescing repeated occurrences of
    /// the same pointer-identical key into the same line. Silently drops
    /// the occurrence if the table's `MAX_NUM_LINES` slots are all claimed
    /// by distinct keys already — the source has no growth path either,
    /// and the caller set is small and static.
    pub fn record(&self, key: &'static str, errno: Option<i32>, detail: String) {
        let wanted = key_ptr(key);

        for line in &self.lines {
            let owns_slot = match line.key.load(Ordering::Acquire) {
                current if current == wanted => true,
                current if current.is_null() => {
                    // Claim it; if we lose the race, the winner's key might
                    // still be `wanted` (two threads logging the same key
                    // for the first time), so check the result either way
                    // instead of treating `Err` as "someone else's line".
                    match line.key.compare_exchange(
                        std::ptr::null_mut(),
                        wanted,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => true,
                        Err(actual) => actual == wanted,
                    }
                }
                _ => false,
            };

            if owns_slot {
                // Idempotent: every thread that can observe this `key`
                // pointer writes the same `key.len()`, so a relaxed store
                // from a losing racer is harmless.
                line.key_len.store(key.len(), Ordering::Relaxed);
                let idx =
                    (line.count.fetch_add(1, Ordering::AcqRel) as usize) % MAX_INSTANCES_PER_LINE;
                line.instances[idx].store(SystemTime::now(), errno, detail);
                return;
            }
        }
        // table full; drop the occurrence
    }

    /// Number of lines currently claimed by a distinct key. Used by tests;
    /// not a hot-path operation.
    pub fn claimed_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !l.key.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Read back every claimed line and its recorded occurrences. A
    /// non-atomic, best-effort read: a concurrent `record` can be mid-write
    /// on one of the fields below, so this is for tests and an optional
    /// diagnostic dump, never for anything load-bearing, mirroring
    /// `dbgDumpAll`'s accessor role in the original.
    pub fn snapshot(&self) -> Vec<LineRecord> {
        let mut out = Vec::new();

        for line in &self.lines {
            let key_ptr = line.key.load(Ordering::Acquire);
            if key_ptr.is_null() {
                continue;
            }
            let len = line.key_len.load(Ordering::Acquire);

            // SAFETY: `key_ptr`/`len` came from a `&'static str` passed to
            // `record`, which stores its data pointer and byte length
            // together and never frees or mutates the string it points at.
            let key: &'static str = unsafe {
                std::str::from_utf8_unchecked(std::slice::from_raw_parts(key_ptr, len))
            };

            let count = line.count.load(Ordering::Acquire);
            let occurrences = line
                .instances
                .iter()
                .filter_map(Occurrence::snapshot)
                .collect();

            out.push(LineRecord {
                key,
                count,
                occurrences,
            });
        }

        out
    }
}

/// One recorded occurrence of a line, read back by [`LineTable::snapshot`].
#[derive(Debug, Clone)]
pub struct OccurrenceRecord {
    pub time: SystemTime,
    pub errno: Option<i32>,
    pub detail: String,
}

/// A claimed line and the occurrences recorded against it, read back by
/// [`LineTable::snapshot`].
#[derive(Debug, Clone)]
pub struct LineRecord {
    pub key: &'static str,
    pub count: u64,
    pub occurrences: Vec<OccurrenceRecord>,
}

impl Default for LineTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LineTable {
    fn drop(&mut self) {
        for line in &self.lines {
            for inst in &line.instances {
                let t = inst.time.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !t.is_null() {
                    drop(unsafe { Box::from_raw(t) });
                }
                let e = inst.errno.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !e.is_null() {
                    drop(unsafe { Box::from_raw(e) });
                }
                let d = inst.detail.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !d.is_null() {
                    drop(unsafe { Box::from_raw(d) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_same_key_pointer() {
        static KEY: &str = "injector: attach failed";
        let table = LineTable::new();

        table.record(KEY, Some(1), "first".into());
        table.record(KEY, Some(2), "second".into());

        assert_eq!(table.claimed_lines(), 1);
        let line = table
            .lines
            .iter()
            .find(|l| l.key.load(Ordering::Acquire) == key_ptr(KEY))
            .unwrap();
        assert_eq!(line.count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn snapshot_reads_back_key_count_and_latest_occurrences() {
        static KEY: &str = "bashmem: failed to arm malloc hook";
        let table = LineTable::new();

        table.record(KEY, Some(13), "first".into());
        table.record(KEY, None, "second".into());

        let records = table.snapshot();
        let record = records.iter().find(|r| r.key == KEY).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.occurrences.len(), 2);
        assert!(record.occurrences.iter().any(|o| o.detail == "first" && o.errno == Some(13)));
        assert!(record.occurrences.iter().any(|o| o.detail == "second" && o.errno.is_none()));
    }

    #[test]
    fn snapshot_omits_unclaimed_lines() {
        let table = LineTable::new();
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn distinct_pointers_get_distinct_lines_even_if_equal_content() {
        let a: &'static str = Box::leak("same text".to_string().into_boxed_str());
        let b: &'static str = Box::leak("same text".to_string().into_boxed_str());

        let table = LineTable::new();
        table.record(a, None, "a".into());
        table.record(b, None, "b".into());

        assert_eq!(table.claimed_lines(), 2);
    }
}
