//! Boot-services termination.
//!
//! The one-time negotiation that ends the firmware's transient services:
//! probe the memory-map size, take a snapshot of exactly that size, and
//! trade its map key for ownership of the machine. The key is a freshness
//! token: firmware invalidates it whenever its internal layout moves
//! (including as a side effect of allocating the snapshot buffer), so the
//! whole exchange retries from the probe, a bounded number of times.
//!
//! The negotiation runs against the narrow [`Firmware`] trait rather than
//! the raw tables directly, so every leg of it can be exercised without
//! firmware underneath.

use core::fmt;
use core::ptr::NonNull;

use crate::efi::{self, Status};
use crate::handoff::HandoffContext;

/// Renegotiations allowed before the protocol gives up.
pub const MAX_ATTEMPTS: u32 = 4;

/// The boot-services calls the termination protocol consumes.
pub trait Firmware {
    /// GetMemoryMap. `buffer: None` is the size probe; on return `size`
    /// holds the byte count the firmware requires.
    fn memory_map(
        &mut self,
        size: &mut usize,
        buffer: Option<&mut [u8]>,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status;

    /// AllocatePool, loader-data type.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Status>;

    /// FreePool. Only legal while boot services are still up.
    fn release(&mut self, buffer: NonNull<u8>);

    /// ExitBootServices with the given map key.
    fn exit_boot_services(&mut self, map_key: usize) -> Status;
}

/// [`Firmware`] over the real boot-services table.
pub struct EfiFirmware {
    boot: NonNull<efi::BootServices>,
    image: efi::Handle,
}

impl EfiFirmware {
    pub fn new(context: &HandoffContext) -> Self {
        Self { boot: context.boot_services(), image: context.image_handle() }
    }

    fn table(&self) -> &efi::BootServices {
        unsafe { self.boot.as_ref() }
    }
}

impl Firmware for EfiFirmware {
    fn memory_map(
        &mut self,
        size: &mut usize,
        buffer: Option<&mut [u8]>,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status {
        let ptr = match buffer {
            Some(buf) => buf.as_mut_ptr() as *mut efi::MemoryDescriptor,
            None => core::ptr::null_mut(),
        };
        unsafe {
            (self.table().get_memory_map)(size, ptr, map_key, descriptor_size, descriptor_version)
        }
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Status> {
        let mut out: *mut u8 = core::ptr::null_mut();
        let status = unsafe {
            (self.table().allocate_pool)(efi::memory_type::LOADER_DATA, size, &mut out)
        };
        if status != Status::SUCCESS {
            return Err(status);
        }
        NonNull::new(out).ok_or(Status::OUT_OF_RESOURCES)
    }

    fn release(&mut self, buffer: NonNull<u8>) {
        let _ = unsafe { (self.table().free_pool)(buffer.as_ptr()) };
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Status {
        unsafe { (self.table().exit_boot_services)(self.image, map_key) }
    }
}

/// The memory map captured by the terminating exchange. The buffer lives in
/// loader-data pool memory, which survives the handoff.
#[derive(Debug)]
pub struct MemoryMapSnapshot {
    buffer: NonNull<u8>,
    size: usize,
    map_key: usize,
    descriptor_size: usize,
    descriptor_version: u32,
}

impl MemoryMapSnapshot {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn map_key(&self) -> usize {
        self.map_key
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn descriptor_version(&self) -> u32 {
        self.descriptor_version
    }

    pub fn descriptor_count(&self) -> usize {
        if self.descriptor_size == 0 {
            return 0;
        }
        self.size / self.descriptor_size
    }

    /// Walk the descriptors at the firmware's stride.
    pub fn descriptors(&self) -> Descriptors<'_> {
        Descriptors { snapshot: self, offset: 0 }
    }

    /// Pages of general-purpose memory the map reports.
    pub fn conventional_pages(&self) -> u64 {
        self.descriptors()
            .filter(|d| d.ty == efi::memory_type::CONVENTIONAL)
            .map(|d| d.number_of_pages)
            .sum()
    }
}

pub struct Descriptors<'a> {
    snapshot: &'a MemoryMapSnapshot,
    offset: usize,
}

impl Iterator for Descriptors<'_> {
    type Item = efi::MemoryDescriptor;

    fn next(&mut self) -> Option<efi::MemoryDescriptor> {
        let stride = self.snapshot.descriptor_size;
        if stride < core::mem::size_of::<efi::MemoryDescriptor>()
            || self.offset + stride > self.snapshot.size
        {
            return None;
        }
        let at = unsafe { self.snapshot.buffer.as_ptr().add(self.offset) };
        self.offset += stride;
        // The firmware stride may exceed our descriptor and need not align it.
        Some(unsafe { core::ptr::read_unaligned(at as *const efi::MemoryDescriptor) })
    }
}

/// Why the negotiation failed. Carries the status the image should hand
/// back to firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationError {
    /// The size probe or populate call answered something other than the
    /// protocol allows.
    ProtocolViolation(Status),
    /// The snapshot buffer could not be allocated.
    AllocationFailed(Status),
    /// ExitBootServices failed for a reason other than a stale key.
    ExitRefused(Status),
    /// Every renegotiation ended with a stale key.
    AttemptsExhausted,
}

impl TerminationError {
    pub fn status(self) -> Status {
        match self {
            TerminationError::ProtocolViolation(_) => Status::LOAD_ERROR,
            TerminationError::AllocationFailed(status) => status,
            TerminationError::ExitRefused(status) => status,
            TerminationError::AttemptsExhausted => Status::ABORTED,
        }
    }
}

impl fmt::Display for TerminationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationError::ProtocolViolation(status) => {
                write!(f, "memory map query violated the protocol: {}", status)
            }
            TerminationError::AllocationFailed(status) => {
                write!(f, "snapshot buffer allocation failed: {}", status)
            }
            TerminationError::ExitRefused(status) => {
                write!(f, "firmware refused to exit boot services: {}", status)
            }
            TerminationError::AttemptsExhausted => {
                write!(f, "map key kept going stale, giving up")
            }
        }
    }
}

/// Ask for the required map size with an empty buffer. The only legal
/// answer is `BUFFER_TOO_SMALL` with a nonzero size.
fn probe_size<F: Firmware>(firmware: &mut F) -> Result<usize, TerminationError> {
    let mut size = 0usize;
    let (mut key, mut stride, mut version) = (0usize, 0usize, 0u32);
    let status = firmware.memory_map(&mut size, None, &mut key, &mut stride, &mut version);
    if status != Status::BUFFER_TOO_SMALL || size == 0 {
        return Err(TerminationError::ProtocolViolation(status));
    }
    Ok(size)
}

/// Run the full termination exchange. On success boot services are gone and
/// the returned snapshot is the final memory map.
///
/// Nothing is logged after the exit call succeeds: the console half of the
/// diagnostic channel dies with boot services, and the caller has not
/// detached it yet.
pub fn terminate<F: Firmware>(firmware: &mut F) -> Result<MemoryMapSnapshot, TerminationError> {
    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            log::warn!("memory map went stale, renegotiating ({}/{})", attempt, MAX_ATTEMPTS);
        }

        let needed = probe_size(firmware)?;
        let buffer = firmware.allocate(needed).map_err(TerminationError::AllocationFailed)?;

        let mut size = needed;
        let (mut key, mut stride, mut version) = (0usize, 0usize, 0u32);
        let slice = unsafe { core::slice::from_raw_parts_mut(buffer.as_ptr(), needed) };
        let status = firmware.memory_map(&mut size, Some(slice), &mut key, &mut stride, &mut version);
        if status == Status::BUFFER_TOO_SMALL {
            // The map outgrew the probe (often because of our own
            // allocation). Same treatment as a stale key.
            firmware.release(buffer);
            continue;
        }
        if status != Status::SUCCESS {
            firmware.release(buffer);
            return Err(TerminationError::ProtocolViolation(status));
        }

        let status = firmware.exit_boot_services(key);
        if status == Status::SUCCESS {
            return Ok(MemoryMapSnapshot {
                buffer,
                size,
                map_key: key,
                descriptor_size: stride,
                descriptor_version: version,
            });
        }
        firmware.release(buffer);
        if status != Status::INVALID_PARAMETER {
            return Err(TerminationError::ExitRefused(status));
        }
        // Stale key: renegotiate from the probe.
    }
    Err(TerminationError::AttemptsExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: usize = core::mem::size_of::<efi::MemoryDescriptor>();

    fn descriptor(ty: u32, pages: u64) -> efi::MemoryDescriptor {
        efi::MemoryDescriptor {
            ty,
            _padding: 0,
            physical_start: 0x10_0000,
            virtual_start: 0,
            number_of_pages: pages,
            attribute: efi::MemoryAttribute::WRITE_BACK.bits(),
        }
    }

    fn map_bytes(descriptors: &[efi::MemoryDescriptor], stride: usize) -> Vec<u8> {
        let mut out = vec![0u8; descriptors.len() * stride];
        for (i, d) in descriptors.iter().enumerate() {
            unsafe {
                core::ptr::write_unaligned(
                    out.as_mut_ptr().add(i * stride) as *mut efi::MemoryDescriptor,
                    *d,
                );
            }
        }
        out
    }

    /// Scripted firmware double. Bumps the map key on every layout
    /// mutation; `stale_exits` scripts how many exit attempts report a
    /// stale key before one is allowed to succeed.
    struct FakeFirmware {
        map: Vec<u8>,
        stride: usize,
        version: u32,
        key: usize,
        stale_exits: u32,
        exited: bool,
        probes: u32,
        alloc_sizes: Vec<usize>,
        live_buffers: Vec<(NonNull<u8>, Box<[u8]>)>,
        released: usize,
        probe_answer: Option<Status>,
        exit_answer: Option<Status>,
    }

    impl FakeFirmware {
        fn new(descriptors: &[efi::MemoryDescriptor], stride: usize) -> Self {
            Self {
                map: map_bytes(descriptors, stride),
                stride,
                version: 1,
                key: 7,
                stale_exits: 0,
                exited: false,
                probes: 0,
                alloc_sizes: Vec::new(),
                live_buffers: Vec::new(),
                released: 0,
                probe_answer: None,
                exit_answer: None,
            }
        }
    }

    impl Firmware for FakeFirmware {
        fn memory_map(
            &mut self,
            size: &mut usize,
            buffer: Option<&mut [u8]>,
            map_key: &mut usize,
            descriptor_size: &mut usize,
            descriptor_version: &mut u32,
        ) -> Status {
            assert!(!self.exited, "memory_map after exit");
            *descriptor_size = self.stride;
            *descriptor_version = self.version;
            if buffer.is_none() {
                self.probes += 1;
                if let Some(answer) = self.probe_answer {
                    return answer;
                }
            }
            let needed = self.map.len();
            match buffer {
                Some(buf) if buf.len() >= needed => {
                    buf[..needed].copy_from_slice(&self.map);
                    *size = needed;
                    *map_key = self.key;
                    Status::SUCCESS
                }
                _ => {
                    *size = needed;
                    Status::BUFFER_TOO_SMALL
                }
            }
        }

        fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Status> {
            self.alloc_sizes.push(size);
            let mut storage = vec![0u8; size.max(1)].into_boxed_slice();
            let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
            self.live_buffers.push((ptr, storage));
            Ok(ptr)
        }

        fn release(&mut self, buffer: NonNull<u8>) {
            assert!(self.live_buffers.iter().any(|(p, _)| *p == buffer));
            self.released += 1;
        }

        fn exit_boot_services(&mut self, map_key: usize) -> Status {
            if let Some(answer) = self.exit_answer {
                return answer;
            }
            if map_key != self.key {
                return Status::INVALID_PARAMETER;
            }
            if self.stale_exits > 0 {
                self.stale_exits -= 1;
                // Firmware shuffled its layout: grow the map, new key.
                let grown = self.map.len() + self.stride;
                self.map.resize(grown, 0);
                self.key += 1;
                return Status::INVALID_PARAMETER;
            }
            self.exited = true;
            Status::SUCCESS
        }
    }

    #[test]
    fn test_clean_exit_first_attempt() {
        let mut fw = FakeFirmware::new(
            &[descriptor(efi::memory_type::CONVENTIONAL, 64), descriptor(efi::memory_type::RESERVED, 8)],
            DESC,
        );
        let snapshot = terminate(&mut fw).unwrap();
        assert!(fw.exited);
        assert_eq!(fw.probes, 1);
        assert_eq!(snapshot.map_key(), 7);
        assert_eq!(snapshot.descriptor_count(), 2);
        assert_eq!(snapshot.conventional_pages(), 64);
    }

    #[test]
    fn test_buffer_is_exactly_probe_size() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 4)], DESC);
        let expected = fw.map.len();
        terminate(&mut fw).unwrap();
        assert_eq!(fw.alloc_sizes, vec![expected]);
    }

    #[test]
    fn test_undersized_buffer_reports_too_small() {
        let mut fw = FakeFirmware::new(
            &[descriptor(efi::memory_type::CONVENTIONAL, 4), descriptor(efi::memory_type::RESERVED, 1)],
            DESC,
        );
        let mut size = 0;
        let (mut key, mut stride, mut version) = (0, 0, 0);
        let mut small = vec![0u8; DESC];
        let status =
            fw.memory_map(&mut size, Some(&mut small), &mut key, &mut stride, &mut version);
        assert_eq!(status, Status::BUFFER_TOO_SMALL);
        assert_eq!(size, 2 * DESC);
    }

    #[test]
    fn test_stale_key_renegotiates_from_probe() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 16)], DESC);
        fw.stale_exits = 1;
        let snapshot = terminate(&mut fw).unwrap();
        assert!(fw.exited);
        // Fresh probe, fresh buffer, nothing stale reused.
        assert_eq!(fw.probes, 2);
        assert_eq!(fw.alloc_sizes.len(), 2);
        assert_eq!(fw.alloc_sizes[1], fw.map.len());
        assert_eq!(fw.released, 1);
        assert_eq!(snapshot.map_key(), 8);
        assert_eq!(snapshot.len(), fw.map.len());
    }

    #[test]
    fn test_retry_attempts_are_bounded() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 16)], DESC);
        fw.stale_exits = MAX_ATTEMPTS + 1;
        let err = terminate(&mut fw).unwrap_err();
        assert_eq!(err, TerminationError::AttemptsExhausted);
        assert_eq!(err.status(), Status::ABORTED);
        assert!(!fw.exited);
        assert_eq!(fw.probes, MAX_ATTEMPTS);
        // Every buffer handed back before giving up.
        assert_eq!(fw.released, fw.alloc_sizes.len());
    }

    #[test]
    fn test_probe_success_is_a_protocol_violation() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 16)], DESC);
        fw.probe_answer = Some(Status::SUCCESS);
        let err = terminate(&mut fw).unwrap_err();
        assert_eq!(err, TerminationError::ProtocolViolation(Status::SUCCESS));
        assert_eq!(err.status(), Status::LOAD_ERROR);
        assert!(fw.alloc_sizes.is_empty());
    }

    #[test]
    fn test_probe_device_error_is_fatal() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 16)], DESC);
        fw.probe_answer = Some(Status::DEVICE_ERROR);
        let err = terminate(&mut fw).unwrap_err();
        assert_eq!(err, TerminationError::ProtocolViolation(Status::DEVICE_ERROR));
    }

    #[test]
    fn test_non_stale_exit_failure_is_fatal() {
        let mut fw = FakeFirmware::new(&[descriptor(efi::memory_type::CONVENTIONAL, 16)], DESC);
        fw.exit_answer = Some(Status::UNSUPPORTED);
        let err = terminate(&mut fw).unwrap_err();
        assert_eq!(err, TerminationError::ExitRefused(Status::UNSUPPORTED));
        assert_eq!(err.status(), Status::UNSUPPORTED);
        assert_eq!(fw.probes, 1);
    }

    #[test]
    fn test_descriptor_walk_honours_firmware_stride() {
        // Firmware reports a stride wider than our descriptor struct.
        let stride = DESC + 8;
        let mut fw = FakeFirmware::new(
            &[
                descriptor(efi::memory_type::CONVENTIONAL, 10),
                descriptor(efi::memory_type::LOADER_DATA, 3),
                descriptor(efi::memory_type::CONVENTIONAL, 5),
            ],
            stride,
        );
        let snapshot = terminate(&mut fw).unwrap();
        assert_eq!(snapshot.descriptor_size(), stride);
        assert_eq!(snapshot.descriptor_count(), 3);
        assert_eq!(snapshot.conventional_pages(), 15);
    }
}
