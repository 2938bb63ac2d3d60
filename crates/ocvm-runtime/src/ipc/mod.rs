//! Typed message channel over a Unix stream socket
//!
//! A frame is a little-endian `u64` payload length followed by the
//! `bincode` payload. File descriptors sent with a frame travel as
//! `SCM_RIGHTS` ancillary data attached to its first bytes, so the
//! receiver collects them while reading the length prefix.

mod memfd;
mod message;

pub use memfd::{read_memfd, write_memfd};
pub use message::{CompileOutcome, CompileRequest, CompileResult, CompiledCode, EvictionNotice, Message};

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::IpcError;

/// Largest payload a channel accepts
pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Most descriptors a single frame may carry
pub const MAX_FRAME_FDS: usize = 4;

const LEN_PREFIX: usize = std::mem::size_of::<u64>();

/// One end of a worker connection
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// A connected pair; both ends are close-on-exec
    pub fn pair() -> Result<(Channel, Channel), IpcError> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel { stream: a }, Channel { stream: b }))
    }

    /// Send one message with the given descriptors attached
    ///
    /// The descriptors stay owned by the caller; the peer receives
    /// duplicates.
    pub fn send(&mut self, message: &Message, fds: &[RawFd]) -> Result<(), IpcError> {
        if fds.len() > MAX_FRAME_FDS {
            return Err(IpcError::Unexpected(format!("{} descriptors in one frame", fds.len())));
        }
        let payload = bincode::serialize(message)?;
        let len = payload.len() as u64;
        if len > MAX_FRAME_BYTES {
            return Err(IpcError::TooLarge { len, max: MAX_FRAME_BYTES });
        }

        let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut sent = 0;
        if !fds.is_empty() {
            let rights = [ControlMessage::ScmRights(fds)];
            sent = loop {
                let iov = [IoSlice::new(&frame)];
                match sendmsg::<()>(self.stream.as_raw_fd(), &iov, &rights, MsgFlags::MSG_NOSIGNAL, None) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            };
        }
        self.stream.write_all(&frame[sent..])?;
        Ok(())
    }

    /// Receive one message and the descriptors that came with it
    ///
    /// Returns `IpcError::Closed` if the peer hung up between frames.
    pub fn receive(&mut self) -> Result<(Message, Vec<OwnedFd>), IpcError> {
        let mut prefix = [0u8; LEN_PREFIX];
        let mut space = nix::cmsg_space!([RawFd; MAX_FRAME_FDS]);
        let (read, fds) = loop {
            let mut iov = [IoSliceMut::new(&mut prefix)];
            match recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            // Safety: SCM_RIGHTS installed fresh descriptors owned by nobody else
                            fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                        }
                    }
                    break (msg.bytes, fds);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if read == 0 {
            return Err(IpcError::Closed);
        }
        if read < LEN_PREFIX {
            self.stream.read_exact(&mut prefix[read..])?;
        }

        let len = u64::from_le_bytes(prefix);
        if len > MAX_FRAME_BYTES {
            return Err(IpcError::TooLarge { len, max: MAX_FRAME_BYTES });
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload)?;
        Ok((bincode::deserialize(&payload)?, fds))
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl FromRawFd for Channel {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Channel { stream: UnixStream::from_raw_fd(fd) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocvm_engine::{CodeTuple, ContentHash, WasmLimits};
    use std::thread;

    fn tuple() -> CodeTuple {
        CodeTuple::new(ContentHash::of(b"contract"), 1)
    }

    #[test]
    fn test_message_without_descriptors() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let notice = Message::EvictionNotice(EvictionNotice { tuples: vec![tuple(), tuple()] });
        a.send(&notice, &[]).unwrap();
        let (received, fds) = b.receive().unwrap();
        assert_eq!(received, notice);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_descriptor_travels_with_frame() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let request = Message::CompileRequest(CompileRequest { tuple: tuple(), limits: WasmLimits::default() });
        let memfd = write_memfd(c"bytecode", b"\0asm\x01\0\0\0").unwrap();
        a.send(&request, &[memfd.as_raw_fd()]).unwrap();
        drop(memfd);

        let (received, mut fds) = b.receive().unwrap();
        assert_eq!(received, request);
        assert_eq!(fds.len(), 1);
        assert_eq!(read_memfd(fds.remove(0), 1024).unwrap(), b"\0asm\x01\0\0\0");
    }

    #[test]
    fn test_frames_stay_in_order() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let sender = thread::spawn(move || {
            for n in 0..50u8 {
                let notice = Message::EvictionNotice(EvictionNotice {
                    tuples: vec![CodeTuple::new(ContentHash([n; 32]), n)],
                });
                a.send(&notice, &[]).unwrap();
            }
        });
        for n in 0..50u8 {
            match b.receive().unwrap().0 {
                Message::EvictionNotice(notice) => assert_eq!(notice.tuples[0].vm_version, n),
                other => panic!("unexpected {}", other.kind()),
            }
        }
        sender.join().unwrap();
    }

    #[test]
    fn test_closed_peer() {
        let (a, mut b) = Channel::pair().unwrap();
        drop(a);
        assert!(matches!(b.receive(), Err(IpcError::Closed)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let (a, mut b) = Channel::pair().unwrap();
        let mut raw = a.stream;
        raw.write_all(&(MAX_FRAME_BYTES + 1).to_le_bytes()).unwrap();
        assert!(matches!(b.receive(), Err(IpcError::TooLarge { .. })));
    }
}
