// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Raw SCM_RIGHTS framing over a Unix domain socket (spec.md §4.3, §4.4).
//!
//! The wire format is deliberately minimal: one ancillary-data message per
//! connection, carrying a single file descriptor and a one-byte status
//! payload (`0x01` on success). There is no multi-FD batching and no
//! length-prefixed body — the whole point of the Initializer Server is to
//! hand over exactly one shared memory descriptor and then let the
//! connection close.

use crate::error::{RegistryError, Result};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

/// Byte sent alongside the passed descriptor to confirm the transfer
/// carried a payload and not just an empty control message.
pub const HANDOFF_OK: u8 = 0x01;

/// Send `fd` to the peer on `stream` as SCM_RIGHTS ancillary data, along
/// with the one-byte [`HANDOFF_OK`] payload.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<()> {
    let payload = [HANDOFF_OK];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: size_of::<RawFd>() fits in the c_uint CMSG_SPACE expects.
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg = libc::msghdr {
        msg_name: ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    // SAFETY: msg_control points at a buffer sized by CMSG_SPACE for
    // exactly one RawFd; CMSG_FIRSTHDR on a non-empty control buffer never
    // returns null.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    // SAFETY: stream's raw fd is valid for the duration of this call;
    // msg is fully initialized above.
    let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(RegistryError::FdPassingFailed(io::Error::last_os_error()));
    }
    Ok(())
}

/// Receive one SCM_RIGHTS-carried descriptor from `stream`. Returns
/// [`RegistryError::FdReceiveFailed`] if the control message is missing,
/// malformed, or the underlying `recvmsg` call fails.
pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: same reasoning as send_fd — room for exactly one RawFd.
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg = libc::msghdr {
        msg_name: ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    // SAFETY: stream's raw fd is valid; msg is fully initialized above and
    // its buffers outlive the call.
    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(RegistryError::FdReceiveFailed(io::Error::last_os_error()));
    }
    if received == 0 || payload[0] != HANDOFF_OK {
        return Err(RegistryError::FdReceiveFailed(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "initializer closed the connection before sending a descriptor",
        )));
    }

    // SAFETY: msg was populated by the kernel above; CMSG_FIRSTHDR /
    // CMSG_NXTHDR traversal is the documented way to walk ancillary data.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                return Ok(OwnedFd::from_raw_fd(fd));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Err(RegistryError::FdReceiveFailed(io::Error::new(
        io::ErrorKind::InvalidData,
        "no SCM_RIGHTS ancillary data in initializer response",
    )))
}
