//! RFC 2347/2348/2349 option negotiation.

use std::collections::HashMap;

/// Payload size per DATA packet absent any `blksize` negotiation.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest blksize a client may negotiate (RFC 2348).
pub const MIN_BLOCK_SIZE: usize = 8;

/// Largest blksize a client may negotiate (RFC 2348) — the biggest payload
/// that still fits a UDP datagram alongside IP/UDP headers.
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Largest `timeout` value accepted (RFC 2349).
pub const MAX_TIMEOUT_SECS: u32 = 255;

/// The outcome of negotiating one request's option table: the settings the
/// connection should actually use, and the subset to echo back via OACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub blocksize: usize,
    pub timeout: Option<u32>,
    /// `true` when the client asked for `tsize`; the caller fills in the
    /// actual value (file size for rrq, `0` acknowledgment for wrq) before
    /// building the OACK.
    pub wants_tsize: bool,
    /// The option/value pairs to echo verbatim in an OACK, in the order
    /// they should be considered (blksize, timeout; tsize is added by the
    /// caller once the size is known).
    pub echo: HashMap<String, String>,
}

impl Negotiated {
    pub fn any_negotiated(&self) -> bool {
        !self.echo.is_empty() || self.wants_tsize
    }
}

/// Negotiate `blksize`/`timeout`/`tsize` out of a request's option table.
/// Only options actually present are considered; unrecognized options are
/// silently ignored per RFC 2347. A `blksize` outside `[8, 65464]` is
/// rejected and the request falls back to the default.
pub fn negotiate(requested: &HashMap<String, String>, default_timeout: u32) -> Negotiated {
    let mut echo = HashMap::new();
    let mut blocksize = DEFAULT_BLOCK_SIZE;
    let mut timeout = None;

    if let Some(val) = requested.get("blksize")
        && let Ok(parsed) = val.parse::<usize>()
    {
        let clamped = parsed.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        blocksize = clamped;
        echo.insert("blksize".to_string(), clamped.to_string());
    }

    if let Some(val) = requested.get("timeout")
        && let Ok(parsed) = val.parse::<u32>()
        && parsed <= MAX_TIMEOUT_SECS
    {
        timeout = Some(if parsed == 0 { default_timeout } else { parsed });
        echo.insert("timeout".to_string(), parsed.to_string());
    }

    let wants_tsize = requested.contains_key("tsize");

    Negotiated { blocksize, timeout, wants_tsize, echo }
}
