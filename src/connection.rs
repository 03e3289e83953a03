//! The per-peer connection state machine: sequencing, option negotiation,
//! retransmission bookkeeping, and the mapping from application-handle
//! failures to wire-level TFTP errors.
//!
//! A `Connection` never touches the network itself. Its methods consume an
//! inbound packet (or a timer fire) and return an [`Outcome`] describing
//! what, if anything, the dispatcher should send — this keeps the state
//! machine testable without a real socket.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::ErrorKind;
use crate::handle::{Handle, WriteSink};
use crate::options::Negotiated;
use crate::packet::{Opcode, Packet};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Server -> client data (the client issued an RRQ).
    Rrq,
    /// Client -> server data (the client issued a WRQ).
    Wrq,
}

/// What the dispatcher should do after a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this packet; the connection remains live.
    Send(Packet),
    /// Optionally send a final packet, then tear the connection down.
    /// An empty `error` denotes a successful transfer.
    Close { packet: Option<Packet>, error: String },
}

/// One active transfer, keyed externally by `peer`.
pub struct Connection {
    pub kind: Kind,
    pub file: String,
    pub mode: String,
    pub peer: SocketAddr,
    /// The option table as parsed from the RRQ/WRQ (RFC 2347 `rfc`).
    pub options: HashMap<String, String>,
    pub blocksize: usize,
    pub timeout: u32,
    pub retries: i32,
    pub sequence_number: u16,
    pub last_sequence_number: Option<u16>,
    pub lastop: Option<Opcode>,
    pub error: String,
    /// rrq: file size reported via OACK `tsize`. wrq: the advertised
    /// upload size cap from the client's own `tsize` option.
    pub filesize: Option<u64>,

    handle: Option<Handle>,
    echo_options: HashMap<String, String>,
    wants_tsize: bool,
    bytes_transferred: u64,
    last_packet: Option<Packet>,
}

impl Connection {
    pub fn new(
        kind: Kind,
        peer: SocketAddr,
        file: String,
        mode: String,
        options: HashMap<String, String>,
        negotiated: Negotiated,
        default_timeout: u32,
        initial_retries: u32,
    ) -> Self {
        let filesize = if kind == Kind::Wrq {
            options.get("tsize").and_then(|v| v.parse::<u64>().ok())
        } else {
            None
        };
        Self {
            kind,
            file,
            mode,
            peer,
            options,
            blocksize: negotiated.blocksize,
            timeout: negotiated.timeout.unwrap_or(default_timeout),
            retries: initial_retries as i32,
            sequence_number: 1,
            last_sequence_number: None,
            lastop: None,
            error: String::new(),
            filesize,
            handle: None,
            echo_options: negotiated.echo,
            wants_tsize: negotiated.wants_tsize,
            bytes_transferred: 0,
            last_packet: None,
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn attach_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    /// Set the source file size for an rrq, so it can be echoed via OACK
    /// `tsize`. Has no effect on a wrq connection.
    pub fn set_filesize(&mut self, size: u64) {
        if self.kind == Kind::Rrq {
            self.filesize = Some(size);
        }
    }

    fn any_option_negotiated(&self) -> bool {
        !self.echo_options.is_empty() || (self.kind == Kind::Rrq && self.wants_tsize)
    }

    fn oack_options(&self) -> HashMap<String, String> {
        let mut opts = self.echo_options.clone();
        if self.kind == Kind::Rrq && self.wants_tsize {
            opts.insert("tsize".to_string(), self.filesize.unwrap_or(0).to_string());
        }
        opts
    }

    fn remember_and_send(&mut self, lastop: Opcode, packet: Packet) -> Outcome {
        self.lastop = Some(lastop);
        self.last_packet = Some(packet.clone());
        Outcome::Send(packet)
    }

    fn remember_and_close(&mut self, lastop: Opcode, packet: Option<Packet>, error: String) -> Outcome {
        self.lastop = Some(lastop);
        self.last_packet = packet.clone();
        Outcome::Close { packet, error }
    }

    /// The first transmission after the dispatcher has attached (or failed
    /// to attach) a handle in response to the `rrq`/`wrq` event.
    pub fn start(&mut self) -> Outcome {
        if !self.has_handle() {
            return self.remember_and_close(
                Opcode::Error,
                Some(Packet::error(ErrorKind::FileNotFound, None)),
                "no handle attached".to_string(),
            );
        }
        if self.any_option_negotiated() {
            let opts = self.oack_options();
            self.remember_and_send(Opcode::Oack, Packet::Oack { options: opts })
        } else if self.kind == Kind::Rrq {
            self.send_next_data()
        } else {
            self.remember_and_send(Opcode::Ack, Packet::Ack { block: 0 })
        }
    }

    /// Read the block at `sequence_number` from the handle and send it.
    fn send_next_data(&mut self) -> Outcome {
        let offset = (self.sequence_number as u64 - 1) * self.blocksize as u64;
        let read = match self.handle.as_mut() {
            Some(Handle::Read(src)) => src.read(offset, self.blocksize),
            _ => {
                return self.remember_and_close(
                    Opcode::Error,
                    Some(Packet::error(ErrorKind::FileNotFound, None)),
                    "no read handle attached".to_string(),
                );
            }
        };
        match read {
            Ok(payload) => {
                if payload.len() < self.blocksize {
                    self.last_sequence_number = Some(self.sequence_number);
                }
                let block = self.sequence_number;
                self.remember_and_send(Opcode::Data, Packet::Data { block, payload })
            }
            Err(e) => self.remember_and_close(
                Opcode::Error,
                Some(Packet::error(ErrorKind::FileNotFound, Some(e.to_string()))),
                format!("read error: {e}"),
            ),
        }
    }

    /// An ACK arrived for an rrq connection.
    pub fn receive_ack(&mut self, block: u16) -> Option<Outcome> {
        debug_assert_eq!(self.kind, Kind::Rrq);

        if Some(block) == self.last_sequence_number {
            self.error.clear();
            return Some(self.remember_and_close(self.lastop.unwrap_or(Opcode::Ack), None, String::new()));
        }
        if block == self.sequence_number {
            self.sequence_number = self.sequence_number.wrapping_add(1);
            return Some(self.send_next_data());
        }
        if block == 0 && self.lastop == Some(Opcode::Oack) {
            return Some(self.send_next_data());
        }
        self.decrement_retries()
    }

    /// A DATA packet arrived for a wrq connection.
    pub fn receive_data(&mut self, block: u16, payload: Vec<u8>) -> Option<Outcome> {
        debug_assert_eq!(self.kind, Kind::Wrq);

        if block != self.sequence_number {
            return self.decrement_retries();
        }

        let is_last = payload.len() < self.blocksize;
        let prospective_total = self.bytes_transferred + payload.len() as u64;
        if let Some(cap) = self.filesize
            && prospective_total > cap
        {
            return Some(self.remember_and_close(
                Opcode::Error,
                Some(Packet::error(ErrorKind::DiskFull, Some("tsize exceeded".to_string()))),
                "tsize exceeded".to_string(),
            ));
        }

        let offset = (block as u64 - 1) * self.blocksize as u64;
        if let Some(Handle::Write(sink)) = self.handle.as_mut()
            && let Err(e) = sink.write_at(offset, &payload)
        {
            return Some(self.remember_and_close(
                Opcode::Error,
                Some(Packet::error(ErrorKind::IllegalOperation, Some(format!("Write: {e}")))),
                format!("write error: {e}"),
            ));
        }

        self.bytes_transferred = prospective_total;
        if is_last {
            self.last_sequence_number = Some(block);
        }
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let ack = Packet::Ack { block };
        if is_last {
            Some(self.remember_and_close(Opcode::Ack, Some(ack), String::new()))
        } else {
            Some(self.remember_and_send(Opcode::Ack, ack))
        }
    }

    /// The peer's reply was something other than the opcode this
    /// connection's direction expects (e.g. DATA arriving on an rrq).
    pub fn protocol_violation(&mut self) -> Outcome {
        self.remember_and_close(
            Opcode::Error,
            Some(Packet::error(ErrorKind::IllegalOperation, None)),
            "illegal operation".to_string(),
        )
    }

    /// The peer sent an ERROR packet. Always terminal; nothing is sent
    /// back (ERROR packets are fire-and-forget both ways).
    pub fn receive_error(&mut self, code: u16, message: String) -> Outcome {
        let err = format!("peer error {code}: {message}");
        self.remember_and_close(Opcode::Error, None, err)
    }

    /// An opcode arrived on an established connection that isn't ACK, DATA,
    /// or ERROR (e.g. a stray RRQ/WRQ/OACK). Always terminal.
    pub fn unknown_opcode(&mut self) -> Outcome {
        self.remember_and_close(Opcode::Error, None, "Unknown opcode".to_string())
    }

    /// The retransmit timer fired without progress: resend whatever was
    /// last sent and charge one retry. `None` is never returned — either a
    /// resend or a close is always produced.
    pub fn retransmit(&mut self) -> Outcome {
        if self.lastop == Some(Opcode::Error) {
            return Outcome::Close { packet: None, error: self.error.clone() };
        }
        match self.decrement_retries() {
            Some(outcome) => outcome,
            None => match self.last_packet.clone() {
                Some(packet) => Outcome::Send(packet),
                None => Outcome::Close {
                    packet: None,
                    error: "retransmit with nothing sent yet".to_string(),
                },
            },
        }
    }

    fn decrement_retries(&mut self) -> Option<Outcome> {
        self.retries -= 1;
        if self.retries < 0 {
            self.error = "retry budget exhausted".to_string();
            Some(self.remember_and_close(Opcode::Error, None, self.error.clone()))
        } else {
            None
        }
    }
}

/// Build a `Handle::Write` from anything implementing `WriteSink`.
pub fn write_handle(sink: impl WriteSink + 'static) -> Handle {
    Handle::Write(Box::new(sink))
}
