//! Resource provider: KVM handles, guest_memfd objects, and memory mappings.
//!
//! Everything under test flows through this module.  [`VmContext`] owns the
//! `/dev/kvm` root handle and the VM fd; guest_memfd objects are created
//! through it and mapped (or anonymous memory is mapped directly) into the
//! process as a [`MappedRegion`].
//!
//! Release is explicit: [`MappedRegion::unmap`] and [`GuestMemfd::close`]
//! consume their handle and surface the syscall result, because a failing
//! `munmap` or `close` is itself a finding for this tool.  `Drop` impls
//! release silently so error paths still clean up.

use kvm_bindings::kvm_create_guest_memfd;
use kvm_ioctls::{Cap, Kvm, VmFd};
use log::debug;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use thiserror::Error;

/// Memory granularity for all size calculations and pattern sampling.
pub const PAGE_SIZE: usize = 4096;

/// Request a guest_memfd that can be mapped into host userspace.
pub const GUEST_MEMFD_FLAG_MMAP: u64 = 1 << 0;
/// Create the guest_memfd with all memory initially shared with the host.
pub const GUEST_MEMFD_FLAG_INIT_SHARED: u64 = 1 << 1;
/// Keep the backing pages out of the kernel's direct map.
pub const GUEST_MEMFD_FLAG_NO_DIRECT_MAP: u64 = 1 << 2;

/// Compose the guest_memfd creation flags.
///
/// The tool always stresses the mappable, init-shared path; the direct-map
/// removal is included unless explicitly disabled by configuration.
pub fn guest_memfd_flags(no_direct_map: bool) -> u64 {
    let mut flags = GUEST_MEMFD_FLAG_MMAP | GUEST_MEMFD_FLAG_INIT_SHARED;
    if no_direct_map {
        flags |= GUEST_MEMFD_FLAG_NO_DIRECT_MAP;
    }
    flags
}

/// Errors from KVM or the mapping syscalls.
///
/// Every variant names the failing operation and carries the underlying
/// system error; the driver treats all of them as fatal.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_VM failed: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_GUEST_MEMFD failed for {size} bytes (flags {flags:#x}): {source}")]
    GuestMemfdCreate {
        size: usize,
        flags: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("munmap of {size} bytes failed: {source}")]
    Unmap {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("close of guest_memfd failed: {0}")]
    Close(#[source] io::Error),
}

/// Source of guest-memory objects (allows failure injection in tests).
///
/// The stress driver allocates through this trait; [`VmContext`] is the real
/// implementation backed by `KVM_CREATE_GUEST_MEMFD`.
pub trait GuestMemoryProvider {
    /// Create a guest-memory object of exactly `size` bytes.
    fn create_guest_memfd(&self, size: usize, flags: u64) -> Result<GuestMemfd, ProviderError>;
}

/// The VM-scoped context that owns every guest_memfd created by the tool.
///
/// Holds both the `/dev/kvm` root handle and the VM fd so the root outlives
/// the VM, which in turn outlives every [`GuestMemfd`].  Created once at
/// startup and dropped at shutdown.
pub struct VmContext {
    kvm: Kvm,
    vm: VmFd,
}

impl VmContext {
    /// Open `/dev/kvm` and create a fresh VM.
    pub fn new() -> Result<Self, ProviderError> {
        let kvm = Kvm::new().map_err(ProviderError::KvmOpen)?;
        debug!("KVM API version {}", kvm.get_api_version());
        let vm = kvm.create_vm().map_err(ProviderError::VmCreate)?;
        Ok(Self { kvm, vm })
    }

    /// Whether the kernel reports `KVM_CAP_GUEST_MEMFD`.
    ///
    /// Used only for diagnostics at startup; creation failures are still the
    /// authoritative signal.
    pub fn supports_guest_memfd(&self) -> bool {
        self.vm.check_extension(Cap::GuestMemfd)
    }

    /// Create a guest_memfd of exactly `size` bytes with the given flags.
    pub fn create_guest_memfd(
        &self,
        size: usize,
        flags: u64,
    ) -> Result<GuestMemfd, ProviderError> {
        let gmem = kvm_create_guest_memfd {
            size: size as u64,
            flags,
            ..Default::default()
        };
        let fd = self
            .vm
            .create_guest_memfd(gmem)
            .map_err(|source| ProviderError::GuestMemfdCreate {
                size,
                flags,
                source,
            })?;
        Ok(GuestMemfd { fd, size })
    }
}

impl GuestMemoryProvider for VmContext {
    fn create_guest_memfd(&self, size: usize, flags: u64) -> Result<GuestMemfd, ProviderError> {
        VmContext::create_guest_memfd(self, size, flags)
    }
}

/// A guest-memory object handle returned by `KVM_CREATE_GUEST_MEMFD`.
///
/// Only valid while the [`VmContext`] that created it is alive.
pub struct GuestMemfd {
    fd: RawFd,
    size: usize,
}

impl GuestMemfd {
    /// Wrap an already-created object fd of `size` bytes.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: RawFd, size: usize) -> Self {
        Self { fd, size }
    }

    /// Size of the backing object in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The underlying object fd, for mapping.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Close the guest_memfd, surfacing the syscall result.
    pub fn close(self) -> Result<(), ProviderError> {
        let fd = self.fd;
        std::mem::forget(self);
        // SAFETY: fd was obtained from KVM_CREATE_GUEST_MEMFD and ownership
        // was just taken out of the forgotten handle, so this is the only
        // close of it.
        if unsafe { libc::close(fd) } < 0 {
            return Err(ProviderError::Close(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for GuestMemfd {
    fn drop(&mut self) {
        // Best-effort cleanup on error paths; the explicit close() is the
        // one whose result matters.
        // SAFETY: the handle still owns fd (close() forgets self first).
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A range of memory mapped into the process, anonymous or guest-backed.
pub struct MappedRegion {
    addr: *mut u8,
    size: usize,
}

impl MappedRegion {
    /// Map `size` bytes of fresh anonymous memory (private, read-write).
    pub fn anonymous(size: usize) -> Result<Self, ProviderError> {
        // SAFETY: a NULL-hint anonymous mapping has no aliasing or fd
        // preconditions; the result is checked against MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ProviderError::Map {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            addr: addr.cast(),
            size,
        })
    }

    /// Map `size` bytes of a guest_memfd (shared, read-write).
    ///
    /// The memfd must have been created with [`GUEST_MEMFD_FLAG_MMAP`], and
    /// `size` must not exceed the object's size.
    pub fn from_guest_memfd(memfd: &GuestMemfd, size: usize) -> Result<Self, ProviderError> {
        // SAFETY: maps a valid, open fd at offset 0; the result is checked
        // against MAP_FAILED.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ProviderError::Map {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            addr: addr.cast(),
            size,
        })
    }

    /// Base address of the mapping.  Valid for `size()` bytes until the
    /// region is unmapped or dropped.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Length of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Unmap the region, surfacing the syscall result.
    pub fn unmap(self) -> Result<(), ProviderError> {
        let (addr, size) = (self.addr, self.size);
        std::mem::forget(self);
        // SAFETY: the mapping was created by this type and ownership was
        // just taken out of the forgotten handle, so this is the only unmap.
        if unsafe { libc::munmap(addr.cast(), size) } < 0 {
            return Err(ProviderError::Unmap {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // Best-effort cleanup on error paths.
        // SAFETY: the region still owns the mapping (unmap() forgets self
        // first).
        unsafe {
            libc::munmap(self.addr.cast(), self.size);
        }
    }
}
