//! Built-in pattern source for simulated sessions.

use contracts::{Burst, PatternSource, MAX_AMPLITUDE};

/// Carrier frequency of simulated bursts
const SWEEP_FREQUENCY_HZ: u16 = 250;

/// Amplitude steps cycled through, one per macrocycle
const AMPLITUDE_STEPS: [u8; 4] = [40, 60, 80, MAX_AMPLITUDE];

/// One burst per finger, staggered evenly across the cycle
///
/// The finger order rotates every cycle so consecutive macrocycles never
/// look identical on the wire.
#[derive(Debug, Clone)]
pub struct SweepPattern {
    fingers: u8,
    duration_ms: u16,
    stagger_ms: u32,
    cycle: u32,
}

impl SweepPattern {
    pub fn new(fingers: u8, duration_ms: u16, cycle_period_ms: u64) -> Self {
        let slots = u64::from(fingers.max(1));
        let stagger_ms = u32::try_from(cycle_period_ms / slots).unwrap_or(u32::MAX);
        Self {
            fingers,
            // a burst never outlives its slot
            duration_ms: duration_ms.min(u16::try_from(stagger_ms).unwrap_or(u16::MAX)),
            stagger_ms,
            cycle: 0,
        }
    }
}

impl PatternSource for SweepPattern {
    fn next_cycle(&mut self) -> Vec<Burst> {
        let amplitude = AMPLITUDE_STEPS[self.cycle as usize % AMPLITUDE_STEPS.len()];
        let rotation = if self.fingers == 0 {
            0
        } else {
            (self.cycle % u32::from(self.fingers)) as u8
        };
        self.cycle = self.cycle.wrapping_add(1);

        (0..self.fingers)
            .map(|slot| Burst {
                finger: (slot + rotation) % self.fingers,
                amplitude,
                frequency_hz: SWEEP_FREQUENCY_HZ,
                duration_ms: self.duration_ms,
                delta_ms: u32::from(slot) * self.stagger_ms,
            })
            .collect()
    }
}
