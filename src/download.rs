//! The download planner: turns a reference/fill pair into an ordered series
//! of aligned chunk reads, survives transport resets by reconnecting, and
//! salvages partial progress when the retry budget runs out.

use std::io::{self, Write};

use tracing::{debug, error, info, warn};

use crate::connect::Connector;
use crate::decode::Decoder;
use crate::logger::{Logger, MAX_RECORD_SIZE, RingStatus};
use crate::modem::Modem;
use crate::{Error, Result};

/// How many times to call the connect function before giving up. Kept at
/// one: by the time a retry connected we would have fallen out of the
/// logger's timeframe.
const MAX_CONNECT_ATTEMPTS: u32 = 1;

/// Global failure budget for a whole download. Once this many things have
/// gone wrong, the program gives up.
const MAX_FAILED_ATTEMPTS: u32 = 3;

/// How many locations each planner-level sub-request asks for.
const DOWNLOAD_CHUNK_SIZE: u32 = 4096;

/// A failed download that still captured at least this many locations is
/// truncated to whole records and kept.
const SALVAGE_MIN_LOCATIONS: u32 = 100;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub security_code: Option<String>,
    /// Sync the logger's clock once, before the first position query.
    pub update_clock: bool,
    /// Explicit start location; `None` backs off from the write head.
    pub start_location: Option<u32>,
}

/// One connect cycle: transport, wake-up, optional security unlock. A bad
/// security code is a warning, not a failure.
fn connect_session(connector: &Connector, security_code: Option<&str>) -> Result<Logger> {
    let mut tries = 0;
    let chan = loop {
        match connector.open() {
            Ok(c) => break c,
            Err(err) => {
                warn!("connect failed: {err}");
                tries += 1;
                if tries > MAX_CONNECT_ATTEMPTS {
                    return Err(Error::Fatal {
                        tag: 201,
                        msg: "too many failed attempts to connect to datalogger... giving up",
                    });
                }
            }
        }
    };

    let mut logger = match Logger::connect(chan) {
        Ok(l) => l,
        Err(err) => {
            warn!("datalogger wake-up failed: {err}");
            return Err(Error::Fatal {
                tag: 202,
                msg: "too many failed attempts to communicate with datalogger... giving up",
            });
        }
    };

    if let Some(code) = security_code {
        if let Err(err) = logger.set_security_level(code) {
            warn!("security negotiation failed: {err}");
        }
    }
    Ok(logger)
}

fn reconnect(connector: &Connector, opts: &DownloadOptions) -> Option<Logger> {
    match connect_session(connector, opts.security_code.as_deref()) {
        Ok(l) => Some(l),
        Err(err) => {
            error!("{err}");
            None
        }
    }
}

/// Locations between `start` and `end` in the forward modular sense.
fn window_size(start: u32, end: u32, filled: u32) -> u32 {
    if start > end {
        filled - start + end - 1
    } else {
        end - start
    }
}

/// The next sub-request: where to position the cursor and how many
/// locations to pull, given how much of the window is already in hand.
fn next_chunk(start: u32, end: u32, filled: u32, downloaded: u32) -> (u32, u32) {
    let wrapped = start + downloaded >= filled;
    let (loc_to_start, span) = if !wrapped {
        let ls = start + downloaded;
        let span = if start > end { filled - ls } else { end - ls };
        (ls, span)
    } else {
        let ls = downloaded - (filled - start) + 1;
        (ls, end - ls)
    };
    (loc_to_start, span.min(DOWNLOAD_CHUNK_SIZE))
}

/// Truncate a partial download to whole records; returns the kept location
/// count and the matching new end location.
fn salvage(downloaded: u32, locations_per_array: u32, start: u32, filled: u32) -> (u32, u32) {
    let lpa = locations_per_array.max(1);
    let kept = (downloaded / lpa) * lpa;
    (kept, (start + kept) % filled)
}

fn draw_bar(cur: u32, max: u32) {
    let p = if max == 0 {
        100
    } else {
        (cur as u64 * 100 / max as u64) as u32
    };
    let b = p / 5;
    if cur != max {
        eprint!("\r {p}%\t[");
    } else {
        eprint!("\r100%\t[");
    }
    for i in 0..20 {
        if b >= i {
            eprint!("*");
        } else {
            eprint!(" ");
        }
    }
    eprint!("]\t{cur} / {max} ");
    let _ = io::stderr().flush();
}

/// Pull the whole window into `data`, advancing `downloaded` so a caller can
/// resume after a reconnect without refetching.
fn pull_chunks(
    logger: &mut Logger,
    data: &mut [u8],
    start: u32,
    end: u32,
    filled: u32,
    downloaded: &mut u32,
    show_bar: bool,
) -> Result<()> {
    let total = (data.len() / 2) as u32;
    while *downloaded < total {
        if show_bar {
            draw_bar(*downloaded, total);
        }
        let (loc_to_start, loc_to_read) = next_chunk(start, end, filled, *downloaded);
        let off = *downloaded as usize * 2;
        let got = logger.read_data(
            &mut data[off..off + loc_to_read as usize * 2],
            loc_to_start,
            loc_to_read,
        )?;
        *downloaded += got;
    }
    if show_bar {
        draw_bar(total, total);
        eprintln!();
    }
    Ok(())
}

/// Run a complete download against `connector` and stream the decoded
/// records into `out`. Returns the end location to persist for next time.
pub fn run(out: &mut dyn Write, connector: &Connector, opts: &DownloadOptions) -> Result<u32> {
    let mut failures = 0u32;
    let mut clock_pending = opts.update_clock;

    // Bring a session up and learn the ring geometry. Each pass through the
    // loop is one full attempt; any sub-step failing burns one attempt and
    // starts over with a fresh transport.
    let mut session: Option<(Logger, RingStatus)> = None;
    while failures < MAX_FAILED_ATTEMPTS {
        let mut logger = match connect_session(connector, opts.security_code.as_deref()) {
            Ok(l) => l,
            Err(err) => {
                error!("{err}");
                failures += 1;
                continue;
            }
        };
        if clock_pending {
            match logger.update_clock() {
                Ok(skew) => {
                    debug!("clock skew was {skew} seconds");
                    clock_pending = false;
                }
                Err(err) => {
                    warn!("clock update failed: {err}");
                    failures += 1;
                    continue;
                }
            }
        }
        match logger.get_position() {
            Ok(status) => {
                session = Some((logger, status));
                break;
            }
            Err(err) => {
                warn!("position query failed: {err}");
                failures += 1;
            }
        }
    }
    let Some((logger, status)) = session else {
        return Err(Error::Fatal {
            tag: 203,
            msg: "too many failed attempts to communicate with datalogger... giving up",
        });
    };
    let mut logger = Some(logger);

    // Choose the window. The default start backs MAX_RECORD_SIZE locations
    // past the write head, well clear of any record the logger is mid-way
    // through writing.
    let mut start = opts
        .start_location
        .unwrap_or(status.reference_location + MAX_RECORD_SIZE);
    let mut end = status.reference_location;
    if start > status.filled_locations {
        start = 1;
    }

    // Advance the start to a record boundary.
    loop {
        if let Some(l) = logger.as_mut() {
            match l.record_align(&mut start) {
                Ok(()) => break,
                Err(err) => warn!("record alignment failed: {err}"),
            }
        }
        failures += 1;
        if failures > MAX_FAILED_ATTEMPTS {
            return Err(Error::Fatal {
                tag: 204,
                msg: "too many failed attempts to communicate with datalogger... giving up",
            });
        }
        logger = reconnect(connector, opts);
    }

    info!("downloading data between locations {start} and {end}");

    // Chunked pull. `downloaded` survives reconnects, so a resumed session
    // picks up exactly where the broken one stopped.
    let total = window_size(start, end, status.filled_locations);
    let mut data = vec![0u8; total as usize * 2];
    let mut downloaded = 0u32;
    let show_bar = std::env::var_os("HIDE_DOWNLOADBAR").is_none();

    loop {
        let pulled = match logger.as_mut() {
            Some(l) => pull_chunks(
                l,
                &mut data,
                start,
                end,
                status.filled_locations,
                &mut downloaded,
                show_bar,
            ),
            None => Err(Error::InvalidResponse("no session".into())),
        };
        match pulled {
            Ok(()) => break,
            Err(err) => {
                warn!("download interrupted: {err}");
                failures += 1;
                if failures > MAX_FAILED_ATTEMPTS {
                    if downloaded >= SALVAGE_MIN_LOCATIONS {
                        let (kept, new_end) = salvage(
                            downloaded,
                            status.locations_per_array,
                            start,
                            status.filled_locations,
                        );
                        downloaded = kept;
                        end = new_end;
                        info!("saving incomplete download ({downloaded} locations)");
                        break;
                    }
                    return Err(Error::Fatal {
                        tag: 205,
                        msg: "too many failed attempts to communicate with datalogger... giving up",
                    });
                }
                logger = reconnect(connector, opts);
            }
        }
    }

    // Decode and finish.
    let mut decoder = Decoder::new();
    decoder.decode(&data[..downloaded as usize * 2], out)?;
    out.write_all(b"\n")?;
    Ok(end)
}

pub fn download_serial(out: &mut dyn Write, device: &str, opts: &DownloadOptions) -> Result<u32> {
    run(
        out,
        &Connector::Serial {
            device: device.into(),
        },
        opts,
    )
}

pub fn download_modem(
    out: &mut dyn Write,
    number: &str,
    device: &str,
    opts: &DownloadOptions,
) -> Result<u32> {
    let result = run(
        out,
        &Connector::Modem {
            device: device.into(),
            number: number.into(),
        },
        opts,
    );

    // The download's channel is gone by now; reopen the device so the call
    // is guaranteed to be torn down even after a failed run.
    match Modem::open(device) {
        Ok(mut modem) => {
            if let Err(err) = modem.hangup() {
                warn!("modem hangup failed: {err}");
            }
        }
        Err(err) => {
            warn!("{device}: {err}");
            return Err(Error::Fatal {
                tag: 206,
                msg: "couldn't open modem device to terminate connection",
            });
        }
    }
    result
}

pub fn download_tcpip(
    out: &mut dyn Write,
    host: &str,
    port: u16,
    opts: &DownloadOptions,
) -> Result<u32> {
    run(out, &Connector::Tcp { host: host.into(), port }, opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk the planner the way `pull_chunks` would, with every read
    /// succeeding in full, and return the visited locations in order.
    fn walk(start: u32, end: u32, filled: u32) -> Vec<u32> {
        let total = window_size(start, end, filled);
        let mut visited = Vec::new();
        let mut downloaded = 0;
        while downloaded < total {
            let (ls, n) = next_chunk(start, end, filled, downloaded);
            assert!(n > 0, "stalled at {downloaded}/{total}");
            visited.extend((0..n).map(|i| ls + i));
            downloaded += n;
        }
        visited
    }

    /// The locations a download from `start` to `end` must touch: forward to
    /// the top of the ring, then from the bottom up to `end`.
    fn expected(start: u32, end: u32, filled: u32) -> Vec<u32> {
        if start > end {
            (start..filled).chain(1..end).collect()
        } else {
            (start..end).collect()
        }
    }

    #[test]
    fn wrap_case_legs() {
        // start=995, end=5, filled=1000: 5 locations up to the top of the
        // ring, then 4 from the bottom.
        assert_eq!(window_size(995, 5, 1000), 9);
        assert_eq!(next_chunk(995, 5, 1000, 0), (995, 5));
        assert_eq!(next_chunk(995, 5, 1000, 5), (1, 4));
    }

    #[test]
    fn forward_case_single_leg() {
        assert_eq!(window_size(10, 500, 1000), 490);
        assert_eq!(next_chunk(10, 500, 1000, 0), (10, 490));
    }

    #[test]
    fn legs_are_capped_at_the_chunk_size() {
        assert_eq!(next_chunk(1, 9000, 10000, 0), (1, DOWNLOAD_CHUNK_SIZE));
        assert_eq!(
            next_chunk(1, 9000, 10000, DOWNLOAD_CHUNK_SIZE),
            (1 + DOWNLOAD_CHUNK_SIZE, DOWNLOAD_CHUNK_SIZE)
        );
    }

    #[test]
    fn planner_covers_the_window_exactly() {
        for filled in 4..=12u32 {
            for start in 1..=filled {
                for end in 1..=filled {
                    if start == end {
                        assert_eq!(window_size(start, end, filled), 0);
                        continue;
                    }
                    assert_eq!(
                        walk(start, end, filled),
                        expected(start, end, filled),
                        "start={start} end={end} filled={filled}"
                    );
                }
            }
        }
    }

    #[test]
    fn salvage_truncates_to_whole_records() {
        let (kept, end) = salvage(137, 4, 995, 1000);
        assert_eq!(kept % 4, 0);
        assert_eq!(kept, 136);
        assert_eq!(end, (995 + 136) % 1000);
    }

    #[test]
    fn salvage_with_degenerate_stride() {
        let (kept, end) = salvage(137, 0, 1, 1000);
        assert_eq!(kept, 137);
        assert_eq!(end, 138);
    }
}
