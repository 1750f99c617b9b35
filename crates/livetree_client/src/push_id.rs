//! Chronologically ordered unique keys for `push`.
//!
//! A key is 8 characters of timestamp followed by 12 random characters, all
//! from a 64-character alphabet whose ASCII order matches its digit order.
//! Keys generated in the same millisecond reuse the random part incremented
//! by one, so they still sort in call order.

use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Length of a generated key.
pub const PUSH_ID_LEN: usize = 20;

/// Stateful key generator.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_time: Option<u64>,
    last_random: [u8; 12],
}

impl PushIdGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates the next key for time `now_ms`.
    ///
    /// A clock that moves backwards keeps using the last timestamp, so keys
    /// never sort before ones already issued.
    pub fn next_id(&mut self, now_ms: u64) -> String {
        let now = self.last_time.map_or(now_ms, |last| now_ms.max(last));
        if self.last_time == Some(now) {
            self.increment_random();
        } else {
            let mut rng = rand::thread_rng();
            for digit in &mut self.last_random {
                *digit = rng.gen_range(0..64);
            }
        }
        self.last_time = Some(now);

        let mut id = String::with_capacity(PUSH_ID_LEN);
        let mut time_chars = [0u8; 8];
        let mut t = now;
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(t % 64) as usize];
            t /= 64;
        }
        id.extend(time_chars.iter().map(|&c| char::from(c)));
        id.extend(
            self.last_random
                .iter()
                .map(|&d| char::from(PUSH_CHARS[usize::from(d)])),
        );
        id
    }

    fn increment_random(&mut self) {
        for digit in self.last_random.iter_mut().rev() {
            if *digit == 63 {
                *digit = 0;
            } else {
                *digit += 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn same_millisecond_keys_are_distinct_and_ordered() {
        let mut generator = PushIdGenerator::new();
        let keys: Vec<String> = (0..1000).map(|_| generator.next_id(1_700_000_000_000)).collect();

        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.iter().all(|k| k.len() == PUSH_ID_LEN));
    }

    #[test]
    fn keys_at_time_zero_keep_call_order() {
        let mut generator = PushIdGenerator::new();
        let keys: Vec<String> = (0..50).map(|_| generator.next_id(0)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.iter().all(|k| k.starts_with("--------")));
    }

    #[test]
    fn later_time_sorts_later() {
        let mut generator = PushIdGenerator::new();
        let a = generator.next_id(1_000);
        let b = generator.next_id(2_000);
        assert!(a < b);
        assert!(a[..8] < b[..8]);
    }

    #[test]
    fn clock_going_backwards_keeps_order() {
        let mut generator = PushIdGenerator::new();
        let a = generator.next_id(5_000);
        let b = generator.next_id(4_000);
        assert!(a < b);
        assert_eq!(a[..8], b[..8]);
    }

    #[test]
    fn keys_are_valid_path_keys() {
        let mut generator = PushIdGenerator::new();
        let key = generator.next_id(123_456_789);
        assert!(livetree_core::validate_key(&key).is_ok());
    }
}
