//! Retrieval of measurement records from Campbell-style field dataloggers.
//!
//! The `crget` crate speaks the logger's line-based command protocol over a
//! direct serial line, a dial-up modem, or a raw TCP socket acting as a
//! serial bridge, pulls the contents of the logger's circular sample memory
//! in checksummed binary chunks, and decodes the compact two-byte cell
//! encoding into comma-separated ASCII records.
//!
//! # Example
//! Download everything accumulated since location 1 from a logger behind a
//! TCP serial bridge and print the decoded records to stdout.
//!
//! ```no_run
//! # fn example() -> crget::Result<()> {
//! use crget::connect::Connector;
//! use crget::download::{self, DownloadOptions};
//!
//! let connector = Connector::Tcp { host: "10.0.0.5".into(), port: 2030 };
//! let opts = DownloadOptions {
//!     security_code: None,
//!     update_clock: false,
//!     start_location: Some(1),
//! };
//! let mut out = std::io::stdout();
//! let end = download::run(&mut out, &connector, &opts)?;
//! println!("next run should resume at location {end}");
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod buffer;
pub mod clock;
pub mod connect;
pub mod decode;
pub mod download;
pub mod logger;
pub mod modem;
pub mod transport;

/// Errors for the datalogger client and download planner.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
    /// A read produced nothing within its deadline.
    #[error("read timed out")]
    Timeout,
    /// The logger answered with something the protocol does not allow here.
    #[error("{0}")]
    InvalidResponse(String),
    /// The bulk-read checksum did not match. Non-fatal: the caller re-reads
    /// the affected chunk in smaller pieces before escalating.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("{0}")]
    Modem(String),
    /// A retry budget was exhausted. The numeric tag matches the messages
    /// operators grep their logs for.
    #[error("Error #{tag}: {msg}")]
    Fatal { tag: u16, msg: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
