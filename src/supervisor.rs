//! The permanent supervisory loop.
//!
//! Entered only after boot services are gone; from here the kernel owns the
//! machine and diagnostics are serial-only. Each iteration would run
//! scheduled work if any existed, then paces itself with a calibrated
//! busy-wait and periodically proves liveness with a heartbeat line.

use crate::stage::Subsystems;
use crate::wait;

/// Iterations between heartbeat lines.
pub const HEARTBEAT_PERIOD: u64 = 32;

/// Spin count per iteration. Stands in for a timer tick until interrupt
/// driven scheduling exists.
const PACE_SPINS: u32 = 50_000_000;

pub struct Supervisor {
    available: Subsystems,
    ticks: u64,
    beats: u64,
}

impl Supervisor {
    pub fn new(available: Subsystems) -> Self {
        Self { available, ticks: 0, beats: 0 }
    }

    pub fn available(&self) -> Subsystems {
        self.available
    }

    /// One loop iteration's worth of bookkeeping. Returns true when this
    /// iteration emitted a heartbeat.
    pub fn tick(&mut self) -> bool {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % HEARTBEAT_PERIOD != 0 {
            return false;
        }
        self.beats = self.beats.wrapping_add(1);
        log::info!("heartbeat #{} (tick {})", self.beats, self.ticks);
        true
    }

    /// Run forever. There is no exit condition and no return path.
    pub fn run(mut self) -> ! {
        log::info!("supervisor: steady state, subsystems {:?}", self.available);
        loop {
            // Scheduled work would run here; nothing is scheduled yet.
            self.tick();
            wait::cycles(PACE_SPINS);
        }
    }
}
