//! Wire frame encoding and decoding.
//!
//! Layout: `START VERSION COMMAND ADDRESS LENGTH PAYLOAD.. CHECKSUM END`,
//! where CHECKSUM is the XOR of every byte from VERSION through PAYLOAD.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const START_BYTE: u8 = 0xA5;
pub const END_BYTE: u8 = 0x5A;
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Largest payload a single frame carries.
pub const MAX_PAYLOAD_LEN: usize = 9;

const HEADER_LEN: usize = 5;
const TRAILER_LEN: usize = 2;

pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_PAYLOAD_LEN;

/// Address of the radio module itself, only used by presence probes.
pub const MODULE_ADDRESS: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Payload too large ({0} bytes, max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Length mismatch: declared {declared} payload bytes in a {buffer_len}-byte buffer")]
    LengthMismatch { declared: usize, buffer_len: usize },

    #[error("Checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch { computed: u8, received: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    GetStatus = 0x02,
    SetMode = 0x03,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Command::Ping),
            0x02 => Some(Command::GetStatus),
            0x03 => Some(Command::SetMode),
            _ => None,
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.code()
    }
}

/// A decoded frame. The command is kept as its raw code so that frames with
/// codes this build does not know still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub command: u8,
    pub address: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    pub fn is_reply_to(&self, command: Command, address: u8) -> bool {
        self.command == command.code() && self.address == address
    }
}

pub fn checksum(version: u8, command: u8, address: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(version ^ command ^ address ^ payload.len() as u8, |acc, &b| acc ^ b)
}

/// Stateless frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(&self, command: u8, address: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }

        let mut out = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
        out.extend_from_slice(&[START_BYTE, PROTOCOL_VERSION, command, address, payload.len() as u8]);
        out.extend_from_slice(payload);
        out.push(checksum(PROTOCOL_VERSION, command, address, payload));
        out.push(END_BYTE);
        Ok(out)
    }

    /// Decodes exactly one frame occupying the whole buffer. No resynchronization
    /// is attempted; see [`FrameAssembler`] for that.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(FrameError::MalformedFrame("buffer too short"));
        }
        if buf[0] != START_BYTE {
            return Err(FrameError::MalformedFrame("missing start marker"));
        }

        let declared = buf[4] as usize;
        if declared > MAX_PAYLOAD_LEN || MIN_FRAME_LEN + declared != buf.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                buffer_len: buf.len(),
            });
        }
        if buf[buf.len() - 1] != END_BYTE {
            return Err(FrameError::MalformedFrame("missing end marker"));
        }

        let (version, command, address) = (buf[1], buf[2], buf[3]);
        let payload = &buf[HEADER_LEN..HEADER_LEN + declared];
        let received = buf[HEADER_LEN + declared];
        let computed = checksum(version, command, address, payload);
        if computed != received {
            return Err(FrameError::ChecksumMismatch { computed, received });
        }

        if version != PROTOCOL_VERSION {
            return Err(FrameError::MalformedFrame("unsupported protocol version"));
        }

        Ok(Frame {
            command,
            address,
            payload: payload.to_vec(),
        })
    }
}

/// Cuts candidate frames out of a raw serial byte stream.
///
/// Bytes ahead of a start marker are discarded. A start marker whose length
/// field is out of range, whose end marker is not where the length says it
/// should be, or whose checksum does not match is skipped and the scan
/// resumes at the next byte. END is also an ordinary payload value, so a
/// stray START can line up with a data byte of the real reply behind it.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

const MAX_ASSEMBLY_BYTES: usize = 4 * MAX_FRAME_LEN;

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_ASSEMBLY_BYTES {
            let excess = self.buf.len() - MAX_ASSEMBLY_BYTES;
            self.buf.drain(..excess);
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == START_BYTE) {
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared = self.buf[4] as usize;
            if declared > MAX_PAYLOAD_LEN {
                self.buf.remove(0);
                continue;
            }

            let total = MIN_FRAME_LEN + declared;
            if self.buf.len() < total {
                return None;
            }
            if self.buf[total - 1] != END_BYTE {
                self.buf.remove(0);
                continue;
            }
            if let Err(FrameError::ChecksumMismatch { .. }) = FrameCodec.decode(&self.buf[..total]) {
                self.buf.remove(0);
                continue;
            }

            return Some(self.buf.drain(..total).collect());
        }
    }
}
