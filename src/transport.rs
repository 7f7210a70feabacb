/* Abstraction for the transport semantics: one read/write surface over a
raw TCP socket, a local serial device, or an already-dialed modem. */

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::sys::termios::{
    self, ControlFlags, FlushArg, InputFlags, LocalFlags, SetArg, Termios,
};
use serial2::{KeepSettings, SerialPort};

use crate::buffer::ByteQueue;
use crate::modem::Modem;
use crate::{Error, Result};

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// The concrete byte channel under a [`Channel`].
#[derive(Debug)]
enum Link {
    Tcp(TcpStream),
    Serial(SerialPort),
    #[cfg(test)]
    Mock(mock::MockLink),
}

impl Link {
    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Link::Tcp(s) => Some(s.as_raw_fd()),
            Link::Serial(p) => Some(p.as_raw_fd()),
            #[cfg(test)]
            Link::Mock(_) => None,
        }
    }

    /// One underlying read, waiting at most `timeout` for data to appear.
    fn read_once(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize> {
        match self {
            Link::Tcp(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                match stream.read(dst) {
                    Ok(0) => Err(Error::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed",
                    ))),
                    Ok(n) => Ok(n),
                    Err(e) if timed_out(&e) => Err(Error::Timeout),
                    Err(e) => Err(Error::Io(e)),
                }
            }
            Link::Serial(port) => {
                port.set_read_timeout(timeout)?;
                match port.read(dst) {
                    Ok(0) => Err(Error::Timeout),
                    Ok(n) => Ok(n),
                    Err(e) if timed_out(&e) => Err(Error::Timeout),
                    Err(e) => Err(Error::Io(e)),
                }
            }
            #[cfg(test)]
            Link::Mock(m) => m.read_once(dst),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Link::Tcp(stream) => stream.write_all(buf)?,
            Link::Serial(port) => port.write_all(buf)?,
            #[cfg(test)]
            Link::Mock(m) => m.tx.extend_from_slice(buf),
        }
        Ok(())
    }

    /// Bytes readable on the OS side without blocking.
    fn kernel_pending(&self) -> Result<usize> {
        match self {
            #[cfg(test)]
            Link::Mock(m) => return Ok(m.pending()),
            _ => {}
        }
        let fd = self.raw_fd().expect("fd-backed link");
        let mut n: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }
}

fn timed_out(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Wait until `fd` is readable or the timeout expires.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(rc > 0)
}

/// Configure the line the way the datalogger protocol needs it: local line,
/// receiver on, no software flow control, no CR/LF translation, raw input.
fn apply_logger_attrs(fd: RawFd) -> Result<()> {
    let bfd = unsafe { borrow_fd(fd) };
    let mut tio = termios::tcgetattr(bfd)?;
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    tio.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
    tio.input_flags &= !(InputFlags::INLCR | InputFlags::IGNCR | InputFlags::ICRNL);
    tio.local_flags &=
        !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
    termios::tcsetattr(bfd, SetArg::TCSANOW, &tio)?;
    Ok(())
}

/// A duplex byte channel with a pushback buffer in front of it.
///
/// When the channel owns terminal attributes (serial and modem variants) the
/// snapshot taken before reconfiguration is restored on drop.
#[derive(Debug)]
pub struct Channel {
    link: Link,
    pushback: ByteQueue,
    saved: Option<Termios>,
}

impl Channel {
    /// Wrap a connected stream socket. No termios handling.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            link: Link::Tcp(stream),
            pushback: ByteQueue::new(),
            saved: None,
        }
    }

    /// Open a serial device, keeping its configured baud rate but switching
    /// the line into the raw mode the logger protocol needs.
    pub fn from_serial(device: &str) -> Result<Self> {
        let port = SerialPort::open(device, KeepSettings)?;
        let saved = termios::tcgetattr(unsafe { borrow_fd(port.as_raw_fd()) })?;
        apply_logger_attrs(port.as_raw_fd())?;
        Ok(Self {
            link: Link::Serial(port),
            pushback: ByteQueue::new(),
            saved: Some(saved),
        })
    }

    /// Take over an already-dialed modem: restore the attributes the modem
    /// driver saved at open, settle the line, then apply the same raw mode
    /// as for a plain serial device.
    pub fn from_modem(modem: Modem) -> Result<Self> {
        let (port, original) = modem.into_parts();
        let fd = port.as_raw_fd();
        let bfd = unsafe { borrow_fd(fd) };
        termios::tcsetattr(bfd, SetArg::TCSANOW, &original)?;
        termios::tcdrain(bfd)?;
        termios::tcflush(bfd, FlushArg::TCIOFLUSH)?;
        let saved = termios::tcgetattr(bfd)?;
        apply_logger_attrs(fd)?;
        Ok(Self {
            link: Link::Serial(port),
            pushback: ByteQueue::new(),
            saved: Some(saved),
        })
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.link.write_all(buf)
    }

    /// Read up to `dst.len()` bytes: the pushback buffer is drained first,
    /// then at most one underlying read tops the result up. Errors surface
    /// only when nothing at all was produced.
    pub fn read_raw(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize> {
        let got = self.pushback.take(dst);
        if got == dst.len() {
            return Ok(got);
        }
        match self.link.read_once(&mut dst[got..], timeout) {
            Ok(n) => Ok(got + n),
            Err(_) if got > 0 => Ok(got),
            Err(e) => Err(e),
        }
    }

    /// Repeat [`Channel::read_raw`] until `dst` is full.
    pub fn read_exact(&mut self, dst: &mut [u8], timeout: Duration) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            filled += self.read_raw(&mut dst[filled..], timeout)?;
        }
        Ok(())
    }

    /// Read one CR- or LF-terminated line of at most `cap - 1` bytes.
    ///
    /// Everything after the terminator goes back into the pushback buffer;
    /// when the byte following the terminator is LF it is consumed along
    /// with it. A full buffer without a terminator is returned as-is.
    pub fn read_line(&mut self, cap: usize, timeout: Duration) -> Result<String> {
        let mut buf = vec![0u8; cap.saturating_sub(1)];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_raw(&mut buf[filled..], timeout)?;
            let end = filled + n;
            if let Some(pos) = buf[filled..end].iter().position(|&b| b == b'\r' || b == b'\n') {
                let term = filled + pos;
                let mut rest = term + 1;
                if rest < end && buf[rest] == b'\n' {
                    rest += 1;
                }
                self.pushback.prepend(&buf[rest..end]);
                return Ok(String::from_utf8_lossy(&buf[..term]).into_owned());
            }
            filled = end;
        }
        Ok(String::from_utf8_lossy(&buf[..filled]).into_owned())
    }

    /// Pushback bytes plus whatever the kernel already holds for us.
    pub fn bytes_pending(&self) -> Result<usize> {
        Ok(self.pushback.len() + self.link.kernel_pending()?)
    }

    /// Like [`Channel::bytes_pending`], but waits for readability first.
    pub fn bytes_pending_blocking(&self, timeout: Duration) -> Result<usize> {
        if self.pushback.is_empty() {
            if let Some(fd) = self.link.raw_fd() {
                if !wait_readable(fd, timeout)? {
                    return Err(Error::Timeout);
                }
            }
        }
        self.bytes_pending()
    }

    /// Discard the kernel-side input and output queues. Bytes already pulled
    /// into the pushback buffer stay readable.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.link {
            Link::Tcp(stream) => {
                // A socket has no queue-discard ioctl; drain whatever is
                // immediately readable instead.
                stream.set_nonblocking(true)?;
                let mut sink = [0u8; 256];
                loop {
                    match stream.read(&mut sink) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            let _ = stream.set_nonblocking(false);
                            return Err(Error::Io(e));
                        }
                    }
                }
                stream.set_nonblocking(false)?;
            }
            Link::Serial(port) => port.discard_buffers()?,
            #[cfg(test)]
            Link::Mock(_) => {}
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_mock(link: mock::MockLink) -> Self {
        Self {
            link: Link::Mock(link),
            pushback: ByteQueue::new(),
            saved: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn mock(&mut self) -> &mut mock::MockLink {
        match &mut self.link {
            Link::Mock(m) => m,
            _ => panic!("not a mock channel"),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let (Some(tio), Some(fd)) = (&self.saved, self.link.raw_fd()) {
            let _ = termios::tcsetattr(unsafe { borrow_fd(fd) }, SetArg::TCSANOW, tio);
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted stand-in for the wire, so protocol logic can be exercised
    //! without a datalogger on the other end.

    use std::collections::VecDeque;

    use crate::{Error, Result};

    /// Byte source fed from a script of chunks. An empty chunk plays back as
    /// one read timeout. Writes are captured in `tx`.
    #[derive(Debug, Default)]
    pub(crate) struct MockLink {
        rx: VecDeque<Vec<u8>>,
        pub(crate) tx: Vec<u8>,
    }

    impl MockLink {
        pub(crate) fn new(script: &[&[u8]]) -> Self {
            Self {
                rx: script.iter().map(|c| c.to_vec()).collect(),
                tx: Vec::new(),
            }
        }

        pub(crate) fn push(&mut self, chunk: &[u8]) {
            self.rx.push_back(chunk.to_vec());
        }

        pub(crate) fn read_once(&mut self, dst: &mut [u8]) -> Result<usize> {
            let Some(mut chunk) = self.rx.pop_front() else {
                return Err(Error::Timeout);
            };
            if chunk.is_empty() {
                return Err(Error::Timeout);
            }
            let n = dst.len().min(chunk.len());
            dst[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.rx.push_front(chunk.split_off(n));
            }
            Ok(n)
        }

        pub(crate) fn pending(&self) -> usize {
            self.rx.iter().map(|c| c.len()).sum()
        }
    }
}
