//! Connectors for reaching a datalogger through its three kinds of plumbing.
//!
//! The download planner holds one of these and re-invokes [`Connector::open`]
//! every time it decides a fresh transport is worth trying.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::modem::{DialOutcome, Modem};
use crate::transport::Channel;
use crate::{Error, Result};

const MODEM_INIT_ATTEMPTS: u32 = 3;
const MODEM_DIAL_ATTEMPTS: u32 = 1;
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A recipe for producing a fresh, connected [`Channel`].
#[derive(Debug, Clone)]
pub enum Connector {
    Serial { device: String },
    Modem { device: String, number: String },
    Tcp { host: String, port: u16 },
}

impl Connector {
    pub fn open(&self) -> Result<Channel> {
        match self {
            Connector::Serial { device } => open_serial(device),
            Connector::Modem { device, number } => open_modem(device, number),
            Connector::Tcp { host, port } => open_tcp(host, *port),
        }
    }
}

fn open_serial(device: &str) -> Result<Channel> {
    Channel::from_serial(device).map_err(|e| match e {
        Error::Io(ref io) if io.kind() == ErrorKind::NotFound => Error::Fatal {
            tag: 301,
            msg: "datalogger device does not exist",
        },
        other => other,
    })
}

fn open_modem(device: &str, number: &str) -> Result<Channel> {
    info!("opening port {device}");
    let mut modem = match Modem::open(device) {
        Ok(m) => m,
        Err(err) => {
            warn!("{device}: {err}");
            return Err(Error::Fatal {
                tag: 101,
                msg: "couldn't open modem device",
            });
        }
    };

    info!("initializing modem");
    let mut tries = 0;
    while let Err(err) = modem.reset() {
        warn!("modem reset failed: {err}");
        tries += 1;
        if tries > MODEM_INIT_ATTEMPTS {
            return Err(Error::Fatal {
                tag: 102,
                msg: "couldn't reset modem",
            });
        }
        drop(modem);
        thread::sleep(Duration::from_secs(5));
        modem = match Modem::open(device) {
            Ok(m) => m,
            Err(err) => {
                warn!("{device}: {err}");
                return Err(Error::Fatal {
                    tag: 103,
                    msg: "couldn't initialize modem",
                });
            }
        };
    }

    // One dial attempt only: by the time a redial got through, the logger
    // would have moved past the window we are about to compute.
    let mut dials = 0;
    loop {
        if dials != 0 && dials + 1 <= MODEM_DIAL_ATTEMPTS {
            thread::sleep(Duration::from_secs(5));
        }
        dials += 1;
        if dials > MODEM_DIAL_ATTEMPTS {
            return Err(Error::Fatal {
                tag: 104,
                msg: "too many dialing attempts, giving up",
            });
        }
        info!("dialing {number}");
        match modem.dial(number) {
            Ok(DialOutcome::Connect) => break,
            Ok(outcome) => warn!("dial returned {outcome}"),
            Err(err) => warn!("{err}"),
        }
    }
    info!("connected");

    Channel::from_modem(modem)
}

fn open_tcp(host: &str, port: u16) -> Result<Channel> {
    let addr = (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or(Error::Fatal {
            tag: 105,
            msg: "couldn't resolve address",
        })?;

    match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
        Ok(stream) => Ok(Channel::from_stream(stream)),
        Err(err) => {
            warn!("couldn't connect to {host}:{port}");
            Err(Error::Io(err))
        }
    }
}
