//! Ordered subsystem bring-up.
//!
//! Boot is a fixed list of stages, each a tagged record: a name, the
//! subsystem it stands up, a fallible entry point, and what a failure means.
//! One loop drives the list; policy is data, not control flow.

use crate::efi::Status;
use crate::subsys;

bitflags::bitflags! {
    /// Subsystems that completed bring-up. Downstream code queries this
    /// instead of assuming a subsystem survived boot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Subsystems: u8 {
        const MEMORY = 1 << 0;
        const DRIVERS = 1 << 1;
        const FILESYSTEM = 1 << 2;
        const GRAPHICS = 1 << 3;
    }
}

/// What a failed stage does to the rest of boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Boot cannot continue; the stage's fail code goes back to firmware.
    Fatal,
    /// Log and keep going; the subsystem is simply absent afterwards.
    Recoverable,
}

/// One unit of bring-up. Runs exactly once.
pub struct InitStage<F = fn() -> Result<(), ()>> {
    pub name: &'static str,
    pub subsystem: Subsystems,
    pub policy: FailurePolicy,
    pub fail_code: Status,
    pub entry: F,
}

/// Result of driving the full stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Success { available: Subsystems },
    FatalStage { name: &'static str, code: Status },
}

/// The kernel's stage list. Later stages may assume a stable address space
/// because the memory stage always runs first; the sequencer re-establishes
/// that ordering even if this table is ever reshuffled.
pub fn boot_stages() -> [InitStage; 4] {
    [
        InitStage {
            name: "memory",
            subsystem: Subsystems::MEMORY,
            policy: FailurePolicy::Fatal,
            fail_code: Status::OUT_OF_RESOURCES,
            entry: subsys::memory,
        },
        InitStage {
            name: "drivers",
            subsystem: Subsystems::DRIVERS,
            policy: FailurePolicy::Recoverable,
            fail_code: Status::DEVICE_ERROR,
            entry: subsys::drivers,
        },
        InitStage {
            name: "filesystem",
            subsystem: Subsystems::FILESYSTEM,
            policy: FailurePolicy::Recoverable,
            fail_code: Status::NOT_FOUND,
            entry: subsys::filesystem,
        },
        InitStage {
            name: "graphics",
            subsystem: Subsystems::GRAPHICS,
            policy: FailurePolicy::Recoverable,
            fail_code: Status::DEVICE_ERROR,
            entry: subsys::graphics,
        },
    ]
}

/// Move the memory stage to the front, keeping the relative order of the
/// others. Everything after it relies on a stable address space.
fn promote_memory_first<F>(stages: &mut [InitStage<F>]) {
    if let Some(i) = stages.iter().position(|s| s.subsystem == Subsystems::MEMORY) {
        stages[..=i].rotate_right(1);
    }
}

/// Run every stage in order. Fatal failures stop the walk immediately and
/// name the stage; recoverable failures are logged and skipped over.
pub fn run_stages<F: FnMut() -> Result<(), ()>>(stages: &mut [InitStage<F>]) -> BootOutcome {
    promote_memory_first(stages);
    let mut available = Subsystems::empty();
    for stage in stages.iter_mut() {
        log::info!("bring-up: {}", stage.name);
        match (stage.entry)() {
            Ok(()) => {
                available |= stage.subsystem;
            }
            Err(()) => match stage.policy {
                FailurePolicy::Fatal => {
                    log::error!("bring-up: {} failed ({}), stopping", stage.name, stage.fail_code);
                    return BootOutcome::FatalStage { name: stage.name, code: stage.fail_code };
                }
                FailurePolicy::Recoverable => {
                    log::warn!(
                        "bring-up: {} failed ({}), continuing without it",
                        stage.name,
                        stage.fail_code
                    );
                }
            },
        }
    }
    BootOutcome::Success { available }
}
