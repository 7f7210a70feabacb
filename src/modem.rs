//! AT command driver for the dial-up path.
//!
//! Opens the serial device at the datalogger's maximum of 9600 baud, walks
//! the modem through reset/init, dials, and later guarantees the line is
//! dropped again. Echo handling is done here in software: the line loops
//! discard CRs and any echo of the command just written.

use std::env;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::thread;
use std::time::Duration;

use nix::sys::termios::{self, ControlFlags, SetArg, Termios};
use serial2::{KeepSettings, SerialPort};
use tracing::{debug, info};

use crate::{Error, Result};

/// Baud rate to use (the datalogger supports a maximum of 9600).
const BAUD_RATE: u32 = 9600;

/// Number of times to send ATZ to the modem before giving up.
const INIT_RETRIES: u32 = 10;

/// How long to wait for a response after dialing.
const DIAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Number of times to send ATH to the modem before giving up.
const HANGUP_RETRIES: u32 = 20;

/// Longest AT response line we care about.
const RESPONSE_MAX: usize = 32;

/// Result of a dial attempt that produced a recognized modem result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DialOutcome {
    #[display("CONNECT")]
    Connect,
    #[display("BUSY")]
    Busy,
    #[display("NO DIALTONE")]
    NoDialtone,
    #[display("NO CARRIER")]
    NoCarrier,
}

/// An open modem device, pre-configured for AT chatter. After a successful
/// dial the port is handed over to [`crate::transport::Channel::from_modem`],
/// which restores the saved attributes before reconfiguring the line for the
/// logger protocol.
#[derive(Debug)]
pub struct Modem {
    port: SerialPort,
    saved: Termios,
}

impl Modem {
    pub fn open(device: &str) -> Result<Self> {
        let mut port = SerialPort::open(device, KeepSettings)?;
        let fd = port.as_raw_fd();
        // SAFETY: fd is valid -- we just opened it
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        termios::tcdrain(bfd)?;
        let saved = termios::tcgetattr(bfd)?;

        // Raw mode, not canonical: every read loop below does its own line
        // assembly, and the hangup scan needs bytes as they arrive, not
        // after the kernel has buffered a full line.
        let mut cfg = port.get_configuration()?;
        cfg.set_raw();
        cfg.set_baud_rate(BAUD_RATE)?;
        port.set_configuration(&cfg)?;

        // AT chatter wants hardware flow control, which the raw profile
        // leaves disabled.
        let mut tio = termios::tcgetattr(bfd)?;
        tio.control_flags |= ControlFlags::CRTSCTS;
        termios::tcsetattr(bfd, SetArg::TCSANOW, &tio)?;

        port.discard_buffers()?;
        Ok(Self { port, saved })
    }

    /// Surrender the port and the termios snapshot taken at open.
    pub(crate) fn into_parts(self) -> (SerialPort, Termios) {
        (self.port, self.saved)
    }

    /// Discard anything the modem has sent that we have not read.
    pub fn flush(&mut self) -> Result<()> {
        self.port.discard_input_buffer()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        self.port.set_read_timeout(timeout)?;
        let mut b = [0u8; 1];
        match self.port.read(&mut b) {
            Ok(0) => Err(Error::Timeout),
            Ok(_) => Ok(b[0]),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
            {
                Err(Error::Timeout)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Send one AT command and return the first response line that is not
    /// an echo of the command itself.
    pub fn command(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        self.port.write_all(cmd.as_bytes())?;
        self.port.write_all(b"\r\n")?;

        let mut line = String::new();
        loop {
            let c = self.read_byte(timeout)? as char;
            if c == '\r' {
                continue;
            }
            if c == '\n' {
                if line.is_empty() {
                    continue;
                }
                if line == cmd {
                    line.clear();
                    continue;
                }
                break;
            }
            line.push(c);
            if line.len() >= RESPONSE_MAX {
                break;
            }
        }
        Ok(line)
    }

    /// Escape to command mode, reset with ATZ, then apply the init string
    /// (`MODEM_INITSTRING`, default `ATM1L0`). Both steps must answer `OK`.
    pub fn reset(&mut self) -> Result<()> {
        self.flush()?;

        let mut tries = 0;
        loop {
            self.port.write_all(b"+++")?;
            thread::sleep(Duration::from_secs(2));
            self.port.write_all(b"ATZ\r\n")?;

            let mut line = String::new();
            loop {
                let c = match self.read_byte(Duration::from_secs(5)) {
                    Ok(c) => c as char,
                    Err(Error::Timeout) => break,
                    Err(e) => return Err(e),
                };
                if c == '\r' {
                    continue;
                }
                if c != '\n' {
                    line.push(c);
                    if line.len() >= 15 {
                        break;
                    }
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                if line == "ATZ" || line == "+++ATZ" {
                    line.clear();
                    continue;
                }
                break;
            }

            if line == "OK" {
                break;
            }
            tries += 1;
            if tries >= INIT_RETRIES {
                return Err(Error::Modem("modem initialization failed".into()));
            }
        }

        self.flush()?;

        let initstring = env::var("MODEM_INITSTRING").unwrap_or_else(|_| "ATM1L0".into());
        debug!("using the initstring {initstring}");
        let reply = self.command(&initstring, Duration::from_secs(10))?;
        if reply != "OK" {
            return Err(Error::Modem(format!(
                "unexpected response initializing the modem: {reply}"
            )));
        }
        Ok(())
    }

    /// Dial `number` and wait up to two minutes for a result code.
    pub fn dial(&mut self, number: &str) -> Result<DialOutcome> {
        let reply = self.command(&format!("ATDT{number}"), DIAL_TIMEOUT)?;
        let outcome = if reply.starts_with("CONNECT") {
            DialOutcome::Connect
        } else if reply.contains("BUSY") {
            info!("the line is busy");
            DialOutcome::Busy
        } else if reply.contains("DIALTONE") {
            info!("no dialtone");
            DialOutcome::NoDialtone
        } else if reply.contains("CARRIER") {
            info!("no carrier");
            DialOutcome::NoCarrier
        } else {
            return Err(Error::Modem(format!(
                "error while dialing {number}: {reply}"
            )));
        };
        Ok(outcome)
    }

    /// Drop the call: end the logger-side session, escape to command mode
    /// with `+++` until the modem acknowledges, then issue ATH until it
    /// acknowledges again. Declared successful only when both `OK`s arrive.
    pub fn hangup(&mut self) -> Result<()> {
        let trace = env::var_os("DEBUG_HANGUP").is_some();

        self.flush()?;
        self.port.write_all(b"\r\n")?;
        // End the call for the datalogger before touching the modem.
        self.port.write_all(b"E\r\n")?;

        let mut rounds = 0;
        loop {
            rounds += 1;
            if rounds > HANGUP_RETRIES {
                return Err(Error::Modem("hangup error sending +++, giving up".into()));
            }
            thread::sleep(Duration::from_secs(1));

            // Near the end of the budget, alternate in an ATH in case the
            // modem already dropped carrier and ignores the escape.
            if rounds > HANGUP_RETRIES - 5 && rounds % 2 == 1 {
                self.port.write_all(b"\r\nATH\r\n")?;
                if trace {
                    debug!("sending: ATH");
                }
            } else {
                self.port.write_all(b"+++")?;
                if trace {
                    debug!("sending: +++");
                }
            }

            // Wait for the modem to catch up, then scan for a trailing OK.
            thread::sleep(Duration::from_secs(2));
            let mut tail = String::new();
            let mut acknowledged = false;
            for _ in 0..2000 {
                if let Ok(c) = self.read_byte(Duration::from_millis(1)) {
                    let c = c as char;
                    if c != '\r' && c != '\n' {
                        tail.push(c);
                        if tail.len() > 2 {
                            tail.remove(0);
                        }
                        if tail == "OK" {
                            acknowledged = true;
                            break;
                        }
                    }
                }
            }
            if acknowledged {
                break;
            }
        }

        let mut tries = 0;
        loop {
            tries += 1;
            if tries > HANGUP_RETRIES {
                return Err(Error::Modem("hangup error sending ATH, giving up".into()));
            }
            self.port.write_all(b"ATH\r\n")?;
            if trace {
                debug!("sending: ATH ({tries}/{HANGUP_RETRIES})");
            }
            thread::sleep(Duration::from_secs(1));

            let mut line = String::new();
            loop {
                let c = match self.read_byte(Duration::from_millis(10)) {
                    Ok(c) => c as char,
                    Err(Error::Timeout) => break,
                    Err(e) => return Err(e),
                };
                if c == '\r' {
                    continue;
                }
                if c != '\n' {
                    line.push(c);
                    if line.len() >= 200 {
                        break;
                    }
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                if line == "ATH" {
                    line.clear();
                    continue;
                }
                break;
            }
            if trace && !line.is_empty() {
                debug!("getting: {line}");
            }
            if line == "OK" {
                break;
            }
        }

        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The line-assembly rules are the part worth pinning down without a
    // device attached: CRs dropped, echoes skipped, first other line wins.
    fn assemble(cmd: &str, raw: &str) -> String {
        let mut line = String::new();
        for c in raw.chars() {
            if c == '\r' {
                continue;
            }
            if c == '\n' {
                if line.is_empty() {
                    continue;
                }
                if line == cmd {
                    line.clear();
                    continue;
                }
                return line;
            }
            line.push(c);
        }
        line
    }

    #[test]
    fn echo_is_skipped() {
        assert_eq!(assemble("ATM1L0", "ATM1L0\r\nOK\r\n"), "OK");
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(assemble("ATDT555", "\r\n\r\nCONNECT 9600\r\n"), "CONNECT 9600");
    }

    #[test]
    fn response_without_echo() {
        assert_eq!(assemble("ATH", "OK\r\n"), "OK");
    }

    #[test]
    fn dial_result_classification() {
        assert!("CONNECT 9600".starts_with("CONNECT"));
        assert!("NO DIALTONE".contains("DIALTONE"));
        assert!("NO CARRIER".contains("CARRIER"));
        assert_eq!(DialOutcome::NoDialtone.to_string(), "NO DIALTONE");
    }
}
