//! Framing codec: length-prefixed typed frames over the secure channel.
//!
//! A frame is an 8-byte header (3-byte magic, 1-byte type, 4-byte LE
//! length) followed by the payload and, once the channel ciphers are up, an
//! 8-byte MAC. The length field counts payload plus MAC. The MAC is
//! computed over the plaintext header+payload; the whole frame is then
//! passed through the stream cipher, so decryption boundaries always align
//! with frame boundaries.
//!
//! The reader is a two-state machine (reading-header, reading-payload). It
//! hands out one frame at a time so the caller can run a handler between
//! frames: handlers may install ciphers (changing how the *next* bytes
//! decrypt), disable message types, or delete the connection outright. The
//! caller re-checks connection liveness before feeding the remainder.

use crate::msgs::{size_policy, Msg, MsgError};
use crate::schannel::SChannel;
use crate::types::{ProtocolViolation, HEADER_SIZE, PROTOCOL_MAGIC};

/// Parsed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub magic: [u8; 3],
    pub msg_type: u8,
    /// Payload + MAC length.
    pub len: u32,
}

impl MsgHeader {
    pub fn read(src: &[u8; HEADER_SIZE]) -> Self {
        MsgHeader {
            magic: [src[0], src[1], src[2]],
            msg_type: src[3],
            len: u32::from_le_bytes([src[4], src[5], src[6], src[7]]),
        }
    }

    pub fn write(&self, dst: &mut [u8]) {
        dst[..3].copy_from_slice(&self.magic);
        dst[3] = self.msg_type;
        dst[4..HEADER_SIZE].copy_from_slice(&self.len.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeader,
    ReadingPayload,
}

/// What one `next()` call produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The input ran dry mid-frame; feed more bytes later.
    NeedMore,
    /// One complete, MAC-verified frame (MAC already stripped).
    Frame { msg_type: u8, payload: Vec<u8> },
}

/// Per-connection frame reader.
pub struct MsgReader {
    state: State,
    buf: Vec<u8>,
    /// Bytes of `buf` filled so far.
    filled: usize,
    /// Bytes still missing for the current state.
    bytes_left: usize,
    default_size: usize,
    /// Per-connection enabled message types, one bit per code.
    enabled: [u64; 4],
}

impl MsgReader {
    pub fn new(default_size: usize) -> Self {
        let default_size = default_size.max(HEADER_SIZE);
        MsgReader {
            state: State::ReadingHeader,
            buf: vec![0u8; default_size],
            filled: 0,
            bytes_left: HEADER_SIZE,
            default_size,
            enabled: [u64::MAX; 4],
        }
    }

    pub fn enable(&mut self, code: u8) {
        self.enabled[(code / 64) as usize] |= 1 << (code % 64);
    }

    pub fn disable(&mut self, code: u8) {
        self.enabled[(code / 64) as usize] &= !(1 << (code % 64));
    }

    pub fn enable_all(&mut self) {
        self.enabled = [u64::MAX; 4];
    }

    pub fn disable_all(&mut self) {
        self.enabled = [0u64; 4];
    }

    pub fn is_enabled(&self, code: u8) -> bool {
        self.enabled[(code / 64) as usize] & (1 << (code % 64)) != 0
    }

    /// True between frames: reading a header from the start of the buffer.
    pub fn at_frame_boundary(&self) -> bool {
        self.state == State::ReadingHeader && self.filled == 0 && self.bytes_left == HEADER_SIZE
    }

    /// Pull the next frame out of `input[*consumed..]`, advancing
    /// `*consumed` past every byte that was taken. Bytes are decrypted as
    /// they are copied in, never ahead of the current frame, so a handler
    /// that installs ciphers affects exactly the bytes after its frame.
    pub fn next(
        &mut self,
        sc: &mut SChannel,
        input: &[u8],
        consumed: &mut usize,
    ) -> Result<ReadOutcome, ProtocolViolation> {
        loop {
            let avail = input.len() - *consumed;
            let take = avail.min(self.bytes_left);
            if take > 0 {
                let dst = &mut self.buf[self.filled..self.filled + take];
                dst.copy_from_slice(&input[*consumed..*consumed + take]);
                sc.decrypt(dst);
                self.filled += take;
                self.bytes_left -= take;
                *consumed += take;
            }

            if self.bytes_left > 0 {
                return Ok(ReadOutcome::NeedMore);
            }

            match self.state {
                State::ReadingHeader => {
                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&self.buf[..HEADER_SIZE]);
                    let header = MsgHeader::read(&raw);
                    self.approve_header(&header, sc.mac_size_in())?;

                    self.bytes_left = header.len as usize;
                    if self.buf.len() < HEADER_SIZE + self.bytes_left {
                        self.buf.resize(HEADER_SIZE + self.bytes_left, 0);
                    }
                    self.state = State::ReadingPayload;
                }
                State::ReadingPayload => {
                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&self.buf[..HEADER_SIZE]);
                    let header = MsgHeader::read(&raw);

                    let mac_size = sc.mac_size_in();
                    let total = HEADER_SIZE + header.len as usize;
                    let body_end = total - mac_size;
                    if !sc.verify(&self.buf[..body_end], &self.buf[body_end..total]) {
                        return Err(ProtocolViolation::BadMac);
                    }

                    let payload = self.buf[HEADER_SIZE..body_end].to_vec();

                    // keep per-stream memory bounded after a large frame
                    if self.buf.len() > 2 * self.default_size {
                        self.buf = vec![0u8; self.default_size];
                    }
                    self.state = State::ReadingHeader;
                    self.filled = 0;
                    self.bytes_left = HEADER_SIZE;

                    return Ok(ReadOutcome::Frame { msg_type: header.msg_type, payload });
                }
            }
        }
    }

    fn approve_header(&self, header: &MsgHeader, mac_size: usize) -> Result<(), ProtocolViolation> {
        if header.magic != PROTOCOL_MAGIC {
            return Err(ProtocolViolation::BadMagic);
        }
        let Some(policy) = size_policy(header.msg_type) else {
            return Err(ProtocolViolation::MsgType(header.msg_type));
        };
        if !self.is_enabled(header.msg_type) {
            return Err(ProtocolViolation::UnexpectedMsg(header.msg_type));
        }
        let Some(body_len) = (header.len as usize).checked_sub(mac_size) else {
            return Err(ProtocolViolation::MsgSize { msg_type: header.msg_type, size: header.len });
        };
        if (body_len as u32) < policy.min || (body_len as u32) > policy.max {
            return Err(ProtocolViolation::MsgSize { msg_type: header.msg_type, size: header.len });
        }
        Ok(())
    }
}

/// Serialize, frame, MAC and encrypt one outbound message.
///
/// The returned bytes go on the wire verbatim; the channel's transmit
/// keystream has advanced by exactly their length.
pub fn write_frame(msg: &Msg, sc: &mut SChannel) -> Result<Vec<u8>, MsgError> {
    let payload = msg.encode_payload()?;
    let mac_size = sc.mac_size_out();

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + mac_size);
    frame.resize(HEADER_SIZE, 0);
    frame.extend_from_slice(&payload);

    let header = MsgHeader {
        magic: PROTOCOL_MAGIC,
        msg_type: msg.code(),
        len: (payload.len() + mac_size) as u32,
    };
    header.write(&mut frame[..HEADER_SIZE]);

    if let Some(mac) = sc.sign(&frame) {
        frame.extend_from_slice(&mac);
    }
    sc.encrypt(&mut frame);
    Ok(frame)
}
