//! UEFI firmware interface definitions.
//!
//! Only the slice of the firmware ABI the kernel actually calls is declared
//! here: console text output, the memory-map/exit negotiation, pool
//! allocation, and the runtime clock. Everything else in the firmware tables
//! is kept as opaque reserved slots so the published vtable offsets still
//! line up.

use core::ffi::c_void;
use core::fmt;

/// Opaque firmware handle (image handle, device handles, ...).
pub type Handle = *mut c_void;

/// Firmware status code. Zero is success; error codes carry the high bit so
/// firmware-side tooling can interpret the value we return from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Status(pub usize);

impl Status {
    const ERROR_BIT: usize = 1 << (usize::BITS - 1);

    pub const SUCCESS: Status = Status(0);
    pub const LOAD_ERROR: Status = Status(Self::ERROR_BIT | 1);
    pub const INVALID_PARAMETER: Status = Status(Self::ERROR_BIT | 2);
    pub const UNSUPPORTED: Status = Status(Self::ERROR_BIT | 3);
    pub const BAD_BUFFER_SIZE: Status = Status(Self::ERROR_BIT | 4);
    pub const BUFFER_TOO_SMALL: Status = Status(Self::ERROR_BIT | 5);
    pub const NOT_READY: Status = Status(Self::ERROR_BIT | 6);
    pub const DEVICE_ERROR: Status = Status(Self::ERROR_BIT | 7);
    pub const WRITE_PROTECTED: Status = Status(Self::ERROR_BIT | 8);
    pub const OUT_OF_RESOURCES: Status = Status(Self::ERROR_BIT | 9);
    pub const NOT_FOUND: Status = Status(Self::ERROR_BIT | 14);
    pub const ABORTED: Status = Status(Self::ERROR_BIT | 21);

    #[inline]
    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR_BIT != 0
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            s if s == Self::SUCCESS => "EFI_SUCCESS",
            s if s == Self::LOAD_ERROR => "EFI_LOAD_ERROR",
            s if s == Self::INVALID_PARAMETER => "EFI_INVALID_PARAMETER",
            s if s == Self::UNSUPPORTED => "EFI_UNSUPPORTED",
            s if s == Self::BAD_BUFFER_SIZE => "EFI_BAD_BUFFER_SIZE",
            s if s == Self::BUFFER_TOO_SMALL => "EFI_BUFFER_TOO_SMALL",
            s if s == Self::NOT_READY => "EFI_NOT_READY",
            s if s == Self::DEVICE_ERROR => "EFI_DEVICE_ERROR",
            s if s == Self::WRITE_PROTECTED => "EFI_WRITE_PROTECTED",
            s if s == Self::OUT_OF_RESOURCES => "EFI_OUT_OF_RESOURCES",
            s if s == Self::NOT_FOUND => "EFI_NOT_FOUND",
            s if s == Self::ABORTED => "EFI_ABORTED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "status {:#x}", self.0),
        }
    }
}

/// Common header at the start of every firmware table.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TableHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub crc32: u32,
    pub reserved: u32,
}

/// "IBI SYST" little-endian.
pub const SYSTEM_TABLE_SIGNATURE: u64 = 0x5453_5953_2049_4249;

/// Simple text output protocol. Only `OutputString` is ever invoked; the
/// remaining entries keep the vtable layout.
#[repr(C)]
pub struct SimpleTextOutput {
    pub reset: usize,
    pub output_string:
        unsafe extern "efiapi" fn(this: *mut SimpleTextOutput, string: *const u16) -> Status,
    pub test_string: usize,
    pub query_mode: usize,
    pub set_mode: usize,
    pub set_attribute: usize,
    pub clear_screen: usize,
    pub set_cursor_position: usize,
    pub enable_cursor: usize,
    pub mode: usize,
}

/// Memory types used by the documented calls.
pub mod memory_type {
    pub const RESERVED: u32 = 0;
    pub const LOADER_CODE: u32 = 1;
    pub const LOADER_DATA: u32 = 2;
    pub const BOOT_SERVICES_CODE: u32 = 3;
    pub const BOOT_SERVICES_DATA: u32 = 4;
    pub const RUNTIME_SERVICES_CODE: u32 = 5;
    pub const RUNTIME_SERVICES_DATA: u32 = 6;
    pub const CONVENTIONAL: u32 = 7;
    pub const UNUSABLE: u32 = 8;
}

bitflags::bitflags! {
    /// Memory descriptor attribute bits (cacheability plus the runtime
    /// mapping requirement).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttribute: u64 {
        const UNCACHEABLE = 1 << 0;
        const WRITE_COMBINE = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const WRITE_BACK = 1 << 3;
        const RUNTIME = 1 << 63;
    }
}

/// One region in the firmware memory map. The firmware strides through these
/// by its reported descriptor size, which may exceed `size_of` here.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryDescriptor {
    pub ty: u32,
    pub _padding: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

/// Boot services table. Slots the kernel never calls are reserved `usize`s;
/// the named entries sit at their published UEFI 2.x offsets.
#[repr(C)]
pub struct BootServices {
    pub hdr: TableHeader,
    pub raise_tpl: usize,
    pub restore_tpl: usize,
    pub allocate_pages: usize,
    pub free_pages: usize,
    pub get_memory_map: unsafe extern "efiapi" fn(
        memory_map_size: *mut usize,
        memory_map: *mut MemoryDescriptor,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> Status,
    pub allocate_pool: unsafe extern "efiapi" fn(
        pool_type: u32,
        size: usize,
        buffer: *mut *mut u8,
    ) -> Status,
    pub free_pool: unsafe extern "efiapi" fn(buffer: *mut u8) -> Status,
    // CreateEvent .. UnloadImage
    pub _event_and_protocol: [usize; 19],
    pub exit_boot_services:
        unsafe extern "efiapi" fn(image_handle: Handle, map_key: usize) -> Status,
    pub get_next_monotonic_count: usize,
    pub stall: usize,
    pub set_watchdog_timer: usize,
}

/// Wall-clock time as reported by the runtime clock.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Time {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad1: u8,
    pub nanosecond: u32,
    /// Offset from UTC in minutes, or `TIMEZONE_UNSPECIFIED`.
    pub time_zone: i16,
    pub daylight: u8,
    pub pad2: u8,
}

pub const TIMEZONE_UNSPECIFIED: i16 = 2047;

/// Runtime services table. Only `GetTime` is invoked.
#[repr(C)]
pub struct RuntimeServices {
    pub hdr: TableHeader,
    pub get_time:
        unsafe extern "efiapi" fn(time: *mut Time, capabilities: *mut c_void) -> Status,
    pub set_time: usize,
}

/// The system table handed to the image at entry.
#[repr(C)]
pub struct SystemTable {
    pub hdr: TableHeader,
    pub firmware_vendor: *const u16,
    pub firmware_revision: u32,
    pub console_in_handle: Handle,
    pub con_in: usize,
    pub console_out_handle: Handle,
    pub con_out: *mut SimpleTextOutput,
    pub standard_error_handle: Handle,
    pub std_err: usize,
    pub runtime_services: *mut RuntimeServices,
    pub boot_services: *mut BootServices,
    pub number_of_table_entries: usize,
    pub configuration_table: usize,
}
