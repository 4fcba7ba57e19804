//! Shareable-handle transfer over Unix datagrams.
//!
//! A handle is moved as an `SCM_RIGHTS` ancillary message riding on the same
//! datagram as the encoded response, so the receiver gets the kernel resource
//! itself rather than a descriptor number that is only meaningful in the
//! sender.

use super::endpoint::transport_error;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

/// Maximum number of handles accepted in one datagram.
pub const MAX_HANDLES_PER_MESSAGE: usize = 4;

/// Send `payload` to `peer` with `handle` attached as ancillary data.
///
/// Exactly one handle per call. The datagram goes out from a fresh unbound
/// socket connected to `peer`, so the caller's own endpoint is untouched.
pub fn send_with_handle(peer: &Path, payload: &[u8], handle: BorrowedFd<'_>) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::HandleTransfer("payload cannot be empty".into()));
    }

    let socket = UnixDatagram::unbound().map_err(|e| transport_error("socket", e))?;
    socket
        .connect(peer)
        .map_err(|e| transport_error("connect", e))?;

    let fds = [handle];
    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::HandleTransfer(
            "failed to add handle to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(payload)];
    let sent = sendmsg(socket.as_fd(), &iov, &mut ancillary, SendFlags::empty())
        .map_err(|e| errno_error("sendmsg", e))?;
    if sent != payload.len() {
        return Err(Error::Transport(format!(
            "short send: {} of {} bytes",
            sent,
            payload.len()
        )));
    }
    Ok(())
}

/// Receive one datagram and every handle attached to it.
///
/// Returns the payload length and the received handles, which are opened
/// close-on-exec in this process.
pub fn recv_with_handles(socket: &UnixDatagram, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    if buf.is_empty() {
        return Err(Error::HandleTransfer("receive buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(buf)];
    let result = recvmsg(
        socket.as_fd(),
        &mut iov,
        &mut ancillary,
        RecvFlags::CMSG_CLOEXEC,
    )
    .map_err(|e| errno_error("recvmsg", e))?;

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    if result.flags.contains(ReturnFlags::TRUNC) {
        return Err(Error::Transport(format!(
            "datagram truncated to {} bytes",
            result.bytes
        )));
    }
    if result.flags.contains(ReturnFlags::CTRUNC) {
        return Err(Error::HandleTransfer("ancillary data truncated".into()));
    }
    if fds.len() > MAX_HANDLES_PER_MESSAGE {
        return Err(Error::HandleTransfer(format!(
            "too many handles: {} > {}",
            fds.len(),
            MAX_HANDLES_PER_MESSAGE
        )));
    }

    Ok((result.bytes, fds))
}

fn errno_error(op: &str, e: Errno) -> Error {
    if e == Errno::AGAIN || e == Errno::TIMEDOUT {
        Error::Timeout
    } else {
        Error::Transport(format!("{op}: {e}"))
    }
}
