//! Human-readable job identifiers.
//!
//! Identifiers look like `monkey-24-03-17-4-qzk`: the issue date, a per-day
//! sequence number and three random lowercase letters.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;

use crate::clock::Clock;

const PREFIX: &str = "monkey";
const SUFFIX_ALPHABET: [char; 26] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z',
];
const SUFFIX_LEN: usize = 3;

#[derive(Debug, Default)]
struct Sequence {
    day: Option<NaiveDate>,
    next: u32,
}

/// Issues job identifiers; safe to share between concurrent submitters.
#[derive(Debug)]
pub struct JobUidGenerator {
    clock: Arc<dyn Clock>,
    sequence: Mutex<Sequence>,
}

impl JobUidGenerator {
    /// Creates a generator whose sequence starts at 1 on the first call.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sequence: Mutex::new(Sequence::default()),
        }
    }

    /// Returns the next identifier, restarting the sequence on a new day.
    pub fn next_uid(&self) -> String {
        let today = self.clock.now().date_naive();
        let seq = {
            let mut guard = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.day != Some(today) {
                guard.day = Some(today);
                guard.next = 1;
            }
            let issued = guard.next;
            guard.next = guard.next.saturating_add(1);
            issued
        };
        let suffix = nanoid::nanoid!(SUFFIX_LEN, &SUFFIX_ALPHABET);
        format!("{PREFIX}-{}-{seq}-{suffix}", today.format("%y-%m-%d"))
    }
}

/// Returns `true` when `value` has the shape produced by [`JobUidGenerator`].
#[must_use]
pub fn is_job_uid(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let [prefix, yy, mm, dd, seq, suffix] = parts.as_slice() else {
        return false;
    };
    let two_digits = |part: &str| part.len() == 2 && part.chars().all(|c| c.is_ascii_digit());
    *prefix == PREFIX
        && two_digits(yy)
        && two_digits(mm)
        && two_digits(dd)
        && !seq.is_empty()
        && seq.chars().all(|c| c.is_ascii_digit())
        && suffix.len() == SUFFIX_LEN
        && suffix.chars().all(|c| c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn clock() -> FakeClock {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 17, 23, 59, 0)
            .single()
            .unwrap_or_else(|| panic!("valid date"));
        FakeClock::at(start)
    }

    #[test]
    fn sequence_increments_and_resets_daily() {
        let clock = clock();
        let generator = JobUidGenerator::new(Arc::new(clock.clone()));

        let first = generator.next_uid();
        let second = generator.next_uid();
        assert!(first.starts_with("monkey-24-03-17-1-"), "{first}");
        assert!(second.starts_with("monkey-24-03-17-2-"), "{second}");

        clock.advance_secs(120);
        let next_day = generator.next_uid();
        assert!(next_day.starts_with("monkey-24-03-18-1-"), "{next_day}");
    }

    #[test]
    fn issued_uids_are_well_formed_and_unique() {
        let generator = JobUidGenerator::new(Arc::new(clock()));
        let issued: BTreeSet<String> = (0..50).map(|_| generator.next_uid()).collect();
        assert_eq!(issued.len(), 50);
        assert!(issued.iter().all(|uid| is_job_uid(uid)));
    }

    #[test]
    fn rejects_malformed_uids() {
        assert!(!is_job_uid("monkey-24-03-17-1-ABC"));
        assert!(!is_job_uid("monkey-24-3-17-1-abc"));
        assert!(!is_job_uid("job-24-03-17-1-abc"));
        assert!(!is_job_uid("monkey-24-03-17-abc"));
    }
}
