//! Subsystem bring-up entry points.
//!
//! Each collaborator exposes exactly one no-argument fallible entry; no
//! finer error detail crosses this boundary. All four are stubs today:
//! the orchestration around them is real, the work inside is not.

/// Memory management. Must complete before any other stage so later code
/// can rely on a stable address space; actual reservation is deferred to
/// the physical allocator when one exists.
pub fn memory() -> Result<(), ()> {
    log::info!("memory: hook only, no reservations made");
    Ok(())
}

/// Device driver bring-up.
pub fn drivers() -> Result<(), ()> {
    log::info!("drivers: hook only");
    Ok(())
}

/// Filesystem mount.
pub fn filesystem() -> Result<(), ()> {
    log::info!("filesystem: hook only");
    Ok(())
}

/// Graphics mode selection.
pub fn graphics() -> Result<(), ()> {
    log::info!("graphics: hook only");
    Ok(())
}
