//! Hybrid Logical Clock.
//!
//! Combines wall-clock milliseconds with a logical counter and a stable node
//! id into timestamps that are totally ordered and consistent with
//! happened-before for observed events. The sortable string form
//! (`base36(millis).pad(11) + '-' + base36(counter).pad(5) + '-' + nodeId`)
//! doubles as the op-log key and the delta-sync cursor: with the fixed-width
//! padding, lexicographic string order equals timestamp order.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

const MILLIS_WIDTH: usize = 11;
const COUNTER_WIDTH: usize = 5;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A hybrid logical timestamp. Comparison is lexicographic over
/// `(millis, counter, node_id)`, which the field order makes derivable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: u64,
    pub counter: u32,
    pub node_id: String,
}

impl Timestamp {
    /// Parses the sortable string form. The node id may itself contain `-`
    /// and is reassembled from everything past the second separator.
    pub fn parse(s: &str) -> SyncResult<Self> {
        let mut parts = s.splitn(3, '-');
        let (millis, counter, node_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(c), Some(n)) if !n.is_empty() => (m, c, n),
            _ => return Err(SyncError::InvalidTimestamp(s.to_string())),
        };
        let millis = u64::from_str_radix(millis, 36)
            .map_err(|_| SyncError::InvalidTimestamp(s.to_string()))?;
        let counter = u32::from_str_radix(counter, 36)
            .map_err(|_| SyncError::InvalidTimestamp(s.to_string()))?;
        Ok(Self {
            millis,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            base36(self.millis, MILLIS_WIDTH),
            base36(self.counter as u64, COUNTER_WIDTH),
            self.node_id
        )
    }
}

fn base36(mut v: u64, width: usize) -> String {
    let mut buf = [b'0'; 16];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = BASE36[(v % 36) as usize];
        v /= 36;
        if v == 0 {
            break;
        }
    }
    let digits = &buf[i..];
    let mut out = String::with_capacity(width.max(digits.len()));
    for _ in digits.len()..width {
        out.push('0');
    }
    out.push_str(std::str::from_utf8(digits).expect("base36 digits are ascii"));
    out
}

/// Source of wall-clock milliseconds, injectable for deterministic tests.
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Production clock source reading the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Hybrid logical clock for one node.
///
/// `now()` output strictly increases; after `receive(r)` the local clock is
/// strictly greater than `r`. Wall-clock regressions are absorbed by the
/// counter path, so there are no failure modes.
pub struct Hlc {
    millis: u64,
    counter: u32,
    node_id: String,
    clock: Box<dyn ClockSource>,
}

impl Hlc {
    pub fn new(node_id: String) -> Self {
        Self::with_clock(node_id, Box::new(SystemClock))
    }

    pub fn with_clock(node_id: String, clock: Box<dyn ClockSource>) -> Self {
        Self {
            millis: 0,
            counter: 0,
            node_id,
            clock,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Timestamp for a local event.
    pub fn now(&mut self) -> Timestamp {
        let wall = self.clock.now_millis();
        if wall > self.millis {
            self.millis = wall;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        self.stamp()
    }

    /// Merges a remote timestamp and returns the advanced local clock.
    /// Must be called for every operation received from another node.
    pub fn receive(&mut self, remote: &Timestamp) -> Timestamp {
        let wall = self.clock.now_millis();
        let merged = self.millis.max(remote.millis).max(wall);

        if merged == self.millis && merged == remote.millis {
            self.counter = self.counter.max(remote.counter) + 1;
        } else if merged == self.millis {
            self.counter += 1;
        } else if merged == remote.millis {
            self.counter = remote.counter + 1;
        } else {
            self.counter = 0;
        }
        self.millis = merged;
        self.stamp()
    }

    fn stamp(&self) -> Timestamp {
        Timestamp {
            millis: self.millis,
            counter: self.counter,
            node_id: self.node_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Deterministic clock source; time advances only when told to.
    struct FixedClock {
        time: Arc<AtomicU64>,
    }

    impl FixedClock {
        fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let time = Arc::new(AtomicU64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now_millis(&self) -> u64 {
            self.time.load(Ordering::Relaxed)
        }
    }

    fn fixed_hlc(node: &str, at: u64) -> (Hlc, Arc<AtomicU64>) {
        let (clock, time) = FixedClock::new(at);
        (Hlc::with_clock(node.to_string(), Box::new(clock)), time)
    }

    #[test]
    fn now_is_strictly_monotone() {
        let (mut hlc, time) = fixed_hlc("a", 1_000);
        let mut prev = hlc.now();
        for i in 0..100 {
            if i == 50 {
                time.store(1_001, Ordering::Relaxed);
            }
            let next = hlc.now();
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn now_resets_counter_when_wall_clock_advances() {
        let (mut hlc, time) = fixed_hlc("a", 1_000);
        assert_eq!(hlc.now().counter, 0);
        assert_eq!(hlc.now().counter, 1);
        time.store(1_005, Ordering::Relaxed);
        let ts = hlc.now();
        assert_eq!(ts.millis, 1_005);
        assert_eq!(ts.counter, 0);
    }

    #[test]
    fn now_absorbs_wall_clock_regression() {
        let (mut hlc, time) = fixed_hlc("a", 2_000);
        let before = hlc.now();
        time.store(1_000, Ordering::Relaxed);
        let after = hlc.now();
        assert_eq!(after.millis, 2_000);
        assert!(before < after);
    }

    #[test]
    fn receive_is_strictly_greater_than_remote() {
        let (mut hlc, _) = fixed_hlc("a", 1_000);
        // remote ahead of wall clock
        let remote = Timestamp {
            millis: 5_000,
            counter: 7,
            node_id: "b".to_string(),
        };
        let local = hlc.receive(&remote);
        assert!(remote < local);
        assert_eq!(local.millis, 5_000);
        assert_eq!(local.counter, 8);
    }

    #[test]
    fn receive_merge_arms() {
        // same millis on both sides: max counter + 1
        let (mut hlc, _) = fixed_hlc("a", 1_000);
        hlc.now(); // local at (1000, 0)
        let remote = Timestamp {
            millis: 1_000,
            counter: 5,
            node_id: "b".to_string(),
        };
        assert_eq!(hlc.receive(&remote).counter, 6);

        // local ahead: counter increments
        let (mut hlc, time) = fixed_hlc("a", 3_000);
        hlc.now();
        time.store(1_000, Ordering::Relaxed);
        let remote = Timestamp {
            millis: 2_000,
            counter: 9,
            node_id: "b".to_string(),
        };
        let ts = hlc.receive(&remote);
        assert_eq!((ts.millis, ts.counter), (3_000, 1));

        // wall clock ahead of both: counter resets
        let (mut hlc, _) = fixed_hlc("a", 9_000);
        let remote = Timestamp {
            millis: 2_000,
            counter: 9,
            node_id: "b".to_string(),
        };
        let ts = hlc.receive(&remote);
        assert_eq!((ts.millis, ts.counter), (9_000, 0));
        assert!(remote < ts);
    }

    #[test]
    fn string_form_round_trips() {
        let ts = Timestamp {
            millis: 1_700_000_000_123,
            counter: 42,
            node_id: "node-with-dashes-1".to_string(),
        };
        let s = ts.to_string();
        assert_eq!(Timestamp::parse(&s).unwrap(), ts);
    }

    #[test]
    fn string_order_matches_timestamp_order() {
        let mut stamps = vec![
            Timestamp { millis: 999, counter: 100, node_id: "z".into() },
            Timestamp { millis: 1_000, counter: 0, node_id: "a".into() },
            Timestamp { millis: 1_000, counter: 0, node_id: "b".into() },
            Timestamp { millis: 1_000, counter: 35, node_id: "a".into() },
            Timestamp { millis: 1_000, counter: 36, node_id: "a".into() },
            Timestamp { millis: 36u64.pow(7), counter: 1, node_id: "a".into() },
        ];
        stamps.sort();
        let strings: Vec<String> = stamps.iter().map(|t| t.to_string()).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Timestamp::parse("").is_err());
        assert!(Timestamp::parse("abc").is_err());
        assert!(Timestamp::parse("00000000001-00000").is_err());
        assert!(Timestamp::parse("not base36!-00000-n").is_err());
    }

    #[test]
    fn padding_is_fixed_width() {
        let ts = Timestamp {
            millis: 1,
            counter: 1,
            node_id: "n".to_string(),
        };
        let s = ts.to_string();
        assert_eq!(&s[..11], "00000000001");
        assert_eq!(&s[12..17], "00001");
    }
}
