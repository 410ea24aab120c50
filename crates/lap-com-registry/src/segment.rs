// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Anonymous sealed shared memory segment (spec.md §4.3).
//!
//! Unlike POSIX `shm_open` (named, path-visible shared memory), a registry
//! segment is created with `memfd_create` — an anonymous, unnamed file
//! visible only through its file descriptor — and is distributed to clients
//! purely by passing that descriptor over a local socket (see
//! [`crate::ipc`]). The file is sealed immediately after initialization so
//! no process holding the descriptor, including the creator, can resize it.

use crate::error::{RegistryError, Result};
use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// A mapped anonymous memory region, either freshly created (the
/// Initializer Server) or received over a socket and mapped locally (a
/// Table Client).
pub struct MemSegment {
    fd: OwnedFd,
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapped region is shared read/write across processes; all
// synchronized access to its contents goes through the seqlock protocol in
// `crate::slot`. The pointer itself is safe to hand across threads.
unsafe impl Send for MemSegment {}
unsafe impl Sync for MemSegment {}

impl MemSegment {
    /// Create a new anonymous, sealable memory object of `size` bytes,
    /// zero-initialize it, map it read/write, and apply the three seals
    /// from spec.md §4.3 step 4 (seal failure is logged and non-fatal).
    ///
    /// `name` is a diagnostic label only (visible in `/proc/<pid>/fd` on
    /// Linux) — it does not create a filesystem path.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = CString::new(name).expect("segment name must not contain NUL");

        // SAFETY: c_name is a valid NUL-terminated string; MFD_CLOEXEC and
        // MFD_ALLOW_SEALING are valid flags for memfd_create(2). Returns a
        // valid fd on success or -1 on error (checked below).
        let fd = unsafe {
            libc::syscall(
                libc::SYS_memfd_create,
                c_name.as_ptr(),
                libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
            )
        };
        if fd < 0 {
            return Err(RegistryError::MemoryCreateFailed(io::Error::last_os_error()));
        }
        // SAFETY: fd is a valid, just-created, owned file descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

        // SAFETY: fd is valid and size fits an off_t for any realistic
        // table size (262144 bytes for this registry).
        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if ret < 0 {
            return Err(RegistryError::MemoryResizeFailed(io::Error::last_os_error()));
        }

        let ptr = map_shared(fd.as_raw_fd(), size)?;

        // SAFETY: ptr points to a fresh mapping of exactly `size` bytes
        // that we exclusively own at this point.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        // Apply seals; failure is non-fatal per spec.md §4.3 step 4.
        let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;
        // SAFETY: fd is valid; F_ADD_SEALS with the three seal bits above
        // is a well-defined fcntl operation on a memfd created with
        // MFD_ALLOW_SEALING.
        let sealed = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) };
        if sealed < 0 {
            log::warn!(
                "[registry] failed to seal segment {name}: {}",
                io::Error::last_os_error()
            );
        }

        Ok(Self { fd, ptr, size })
    }

    /// Map an existing, already-sealed memory object received from an
    /// Initializer Server (spec.md §4.4 step 3). Takes ownership of `fd`.
    pub fn from_received_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        let ptr = map_shared(fd.as_raw_fd(), size)?;
        Ok(Self { fd, ptr, size })
    }

    /// Duplicate the underlying file descriptor (for handing to a client
    /// over the FD-passing socket — the original stays owned by the
    /// server).
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        // SAFETY: self.fd is a valid open descriptor; dup() never takes
        // ownership of the original.
        let dup = unsafe { libc::dup(self.fd.as_raw_fd()) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: dup is a freshly duplicated, owned descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Attempt to grow the segment via `ftruncate`. Used only by the test
    /// suite to prove sealing rejects resizes (spec.md §8 item 8) — the
    /// core never calls this itself.
    #[doc(hidden)]
    pub fn try_resize_for_test(&self, new_size: usize) -> io::Result<()> {
        // SAFETY: self.fd is a valid open descriptor.
        let ret = unsafe { libc::ftruncate(self.fd.as_raw_fd(), new_size as libc::off_t) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn map_shared(fd: RawFd, size: usize) -> Result<*mut u8> {
    // SAFETY: null first argument lets the kernel choose the address;
    // PROT_READ|PROT_WRITE and MAP_SHARED are valid for a read-write
    // mapping visible to other processes holding the same fd; fd is a
    // valid, open descriptor at least `size` bytes long.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(RegistryError::MemoryMapFailed(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

impl Drop for MemSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr was obtained from a successful mmap of exactly
        // self.size bytes and has not been unmapped before.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // fd closes via OwnedFd's own Drop.
    }
}
