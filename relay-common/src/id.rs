//! Snowflake-style 64-bit connection-id generator (§3, §4.2).
//!
//! Bit layout, MSB→LSB: `[1-bit version | 47-bit ms-since-epoch | 16-bit sequence]`.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::IdError;

const SEQUENCE_BITS: u64 = 16;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const TIME_SHIFT: u32 = SEQUENCE_BITS as u32;
const VERSION_SHIFT: u32 = 63;
/// 2020-05-20 08:00:00 +0800, in milliseconds since the Unix epoch.
const EPOCH_MS: u64 = 1_589_923_200_000;

#[derive(Debug, Default)]
struct GeneratorState {
    last_stamp: u64,
    sequence: u64,
}

/// Generates strictly increasing 64-bit connection ids.
///
/// A single instance is meant to be shared (behind an `Arc`) by every accept thread in a
/// gateway process; the internal mutex's critical section is tiny, so contention is not a
/// concern even at high accept rates.
#[derive(Debug, Default)]
pub struct ConnIdGenerator {
    state: Mutex<GeneratorState>,
}

impl ConnIdGenerator {
    /// Creates a fresh generator with no prior state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the next id in the sequence.
    ///
    /// Returns [`IdError::ClockRegression`] if the system clock is observed to have moved
    /// backwards since the last id was minted; no id is produced in that case.
    pub fn next_id(&self) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.next_id_locked(&mut state, now_ms)
    }

    fn next_id_locked(
        &self,
        state: &mut GeneratorState,
        clock: impl Fn() -> u64,
    ) -> Result<u64, IdError> {
        let mut stamp = clock();

        if stamp < state.last_stamp {
            return Err(IdError::ClockRegression);
        }

        if stamp == state.last_stamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence space exhausted within this millisecond; busy-wait for the clock
                // to advance. The worst case is sub-millisecond, so no sleep is introduced.
                while stamp <= state.last_stamp {
                    stamp = clock();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_stamp = stamp;

        let ticks = stamp - EPOCH_MS;
        let id = (ticks << TIME_SHIFT) | state.sequence;
        Ok(id | (0u64 << VERSION_SHIFT))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn ids_strictly_increase_within_a_millisecond() {
        let gen = ConnIdGenerator::new();
        let mut prev = gen.next_id().unwrap();
        for _ in 0..1000 {
            let next = gen.next_id().unwrap();
            assert!(next > prev, "{next} should be greater than {prev}");
            prev = next;
        }
    }

    #[test]
    fn detects_clock_regression() {
        let gen = ConnIdGenerator::new();
        let clock = Cell::new(1_700_000_000_000u64);
        {
            let mut state = gen.state.lock().unwrap();
            gen.next_id_locked(&mut state, || clock.get()).unwrap();
        }
        clock.set(clock.get() - 1);
        let mut state = gen.state.lock().unwrap();
        let err = gen.next_id_locked(&mut state, || clock.get()).unwrap_err();
        assert_eq!(err, IdError::ClockRegression);
    }

    #[test]
    fn sequence_wraps_into_next_millisecond() {
        let gen = ConnIdGenerator::new();
        let tick = Cell::new(1_700_000_000_000u64);
        let mut state = gen.state.lock().unwrap();
        // Exhaust the sequence space for the current millisecond.
        for _ in 0..=MAX_SEQUENCE {
            gen.next_id_locked(&mut state, || tick.get()).unwrap();
        }
        // The next call would spin forever on a clock stuck at the same millisecond, so
        // advance it first to exercise the wrap path deterministically.
        let mut advanced = false;
        let id = gen
            .next_id_locked(&mut state, || {
                if advanced {
                    tick.get()
                } else {
                    advanced = true;
                    tick.set(tick.get() + 1);
                    tick.get()
                }
            })
            .unwrap();
        assert_eq!(id & MAX_SEQUENCE, 0);
    }
}
