//! kernel-efi: the LeafOS kernel image.
//!
//! Firmware jumps here with an image handle and the system table. The flow
//! is strictly ordered: capture the handoff, get the diagnostic channel up,
//! bring up subsystems, end boot services, then hand the core to the
//! supervisor for good. Fatal failures return a firmware status code so
//! boot tooling can see what died.

#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
mod entry {
    use leafos_kernel::diag::{self, EfiConsole};
    use leafos_kernel::exitboot::{self, EfiFirmware};
    use leafos_kernel::handoff::{self, HandoffContext};
    use leafos_kernel::stage::{self, BootOutcome};
    use leafos_kernel::supervisor::Supervisor;
    use leafos_kernel::{efi, fault, kassert, serial};

    #[no_mangle]
    pub extern "efiapi" fn efi_main(
        image_handle: efi::Handle,
        system_table: *mut efi::SystemTable,
    ) -> efi::Status {
        serial::init();

        let handoff = match unsafe { HandoffContext::from_firmware(image_handle, system_table) } {
            Ok(context) => context,
            Err(status) => {
                // No console to speak of; the serial side always works.
                diag::emit("entry: rejected firmware system table\n");
                return status;
            }
        };

        diag::install(handoff.console_out().map(EfiConsole::new));
        banner(&handoff);

        let mut stages = stage::boot_stages();
        // Everything past the first stage assumes a stable address space.
        kassert!(stages[0].subsystem == stage::Subsystems::MEMORY);
        let available = match stage::run_stages(&mut stages) {
            BootOutcome::Success { available } => available,
            BootOutcome::FatalStage { name, code } => {
                log::error!("boot stopped in stage '{}', returning {}", name, code);
                return code;
            }
        };

        if let Some(time) = handoff.boot_time() {
            match handoff::unix_seconds(&time) {
                Some(secs) => log::info!("wall clock at boot: {}s since epoch", secs),
                None => log::warn!("firmware reported an implausible wall clock"),
            }
        }

        let mut firmware = EfiFirmware::new(&handoff);
        let snapshot = match exitboot::terminate(&mut firmware) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::error!("boot services still up: {}", err);
                return err.status();
            }
        };

        // Boot services are gone; the console died with them. Serial only
        // from here on.
        diag::detach_console();
        let _runtime = handoff.into_runtime();

        kassert!(snapshot.descriptor_size() >= core::mem::size_of::<efi::MemoryDescriptor>());
        log::info!(
            "boot services terminated: {} map descriptors, {} conventional pages",
            snapshot.descriptor_count(),
            snapshot.conventional_pages()
        );

        Supervisor::new(available).run()
    }

    fn banner(handoff: &HandoffContext) {
        let mut vendor_buf = [0u8; 48];
        let vendor = handoff.firmware_vendor(&mut vendor_buf);
        diag::emit("\nLeafOS kernel-efi starting\n");
        log::info!("firmware: {} (rev {:#010x})", vendor, handoff.firmware_revision());
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        diag::with_channel(|channel| {
            use core::fmt::Write;
            let _ = write!(channel, "\nkernel panic: {}\n", info);
        });
        fault::halt_forever();
    }
}

// Host builds exist only so the library and its tests can be compiled and
// run off-target; there is no firmware to hand off from.
#[cfg(not(target_os = "uefi"))]
fn main() {
    eprintln!("kernel-efi only runs as a UEFI image; build for x86_64-unknown-uefi");
}
