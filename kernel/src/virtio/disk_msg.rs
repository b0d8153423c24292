//! Wire format of the disk port protocol.
//!
//! A command is 16 ASCII bytes:
//!
//! ```text
//! MODE(1) BLOCKID(7) DATA_PORT(4) MSG_PORT(4)      e.g. "W0000042" "0003" "0004"
//! ```
//!
//! and the driver answers each one with 9 bytes on `MSG_PORT`:
//!
//! ```text
//! MODE(1) STATUS(1) BLOCKID(7)                     e.g. "W00000042"
//! ```
//!
//! `STATUS` is `'0'` on success and `'1'` on failure. Numbers are
//! zero-padded decimal.

use core::fmt;
use core::ops::Range;

use thiserror::Error;

use crate::param::{DISK_MSG_LEN, DISK_RESP_LEN};
use crate::port::PortId;

const BLOCKID: Range<usize> = 1..8;
const DATA_PORT: Range<usize> = 8..12;
const MSG_PORT: Range<usize> = 12..16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskMode {
    Read,
    Write,
}

impl DiskMode {
    pub fn as_byte(self) -> u8 {
        match self {
            DiskMode::Read => b'R',
            DiskMode::Write => b'W',
        }
    }
}

impl TryFrom<u8> for DiskMode {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        match b {
            b'R' => Ok(DiskMode::Read),
            b'W' => Ok(DiskMode::Write),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgField {
    BlockId,
    DataPort,
    MsgPort,
}

impl fmt::Display for MsgField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MsgField::BlockId => "blockid",
            MsgField::DataPort => "data port",
            MsgField::MsgPort => "msg port",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiskMsgError {
    #[error("disk message is {0} bytes, want {want}", want = DISK_MSG_LEN)]
    TooShort(usize),
    #[error("bad digit {byte:#04x} in {field} field")]
    BadDigit { field: MsgField, byte: u8 },
}

/// A command as it arrived. The mode byte is kept raw so that a
/// rejection can echo it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskMsg {
    pub mode: u8,
    pub blockid: u32,
    pub data_port: PortId,
    pub msg_port: PortId,
}

impl DiskMsg {
    pub fn parse(raw: &[u8]) -> Result<Self, DiskMsgError> {
        if raw.len() < DISK_MSG_LEN {
            return Err(DiskMsgError::TooShort(raw.len()));
        }
        Ok(DiskMsg {
            mode: raw[0],
            blockid: parse_digits(MsgField::BlockId, &raw[BLOCKID])?,
            data_port: parse_digits(MsgField::DataPort, &raw[DATA_PORT])?,
            msg_port: parse_digits(MsgField::MsgPort, &raw[MSG_PORT])?,
        })
    }

    /// Where to send the rejection of a command `parse` refused, if the
    /// command says so legibly. The block id falls back to 0.
    pub fn salvage(raw: &[u8]) -> Option<DiskResp> {
        if raw.len() < DISK_MSG_LEN {
            return None;
        }
        let msg_port = parse_digits(MsgField::MsgPort, &raw[MSG_PORT]).ok()?;
        let blockid = parse_digits(MsgField::BlockId, &raw[BLOCKID]).unwrap_or(0);
        Some(DiskResp::failed(raw[0], blockid, msg_port))
    }

    pub fn encode(&self) -> [u8; DISK_MSG_LEN] {
        let mut out = [0; DISK_MSG_LEN];
        out[0] = self.mode;
        put_digits(&mut out[BLOCKID], self.blockid);
        put_digits(&mut out[DATA_PORT], self.data_port);
        put_digits(&mut out[MSG_PORT], self.msg_port);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Ok,
    Failed,
}

impl DiskStatus {
    fn as_byte(self) -> u8 {
        match self {
            DiskStatus::Ok => b'0',
            DiskStatus::Failed => b'1',
        }
    }
}

/// The answer to one command, bound for `port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskResp {
    pub mode: u8,
    pub status: DiskStatus,
    pub blockid: u32,
    pub port: PortId,
}

impl DiskResp {
    pub fn ok(mode: DiskMode, blockid: u32, port: PortId) -> Self {
        DiskResp {
            mode: mode.as_byte(),
            status: DiskStatus::Ok,
            blockid,
            port,
        }
    }

    pub fn failed(mode: u8, blockid: u32, port: PortId) -> Self {
        DiskResp {
            mode,
            status: DiskStatus::Failed,
            blockid,
            port,
        }
    }

    pub fn encode(&self) -> [u8; DISK_RESP_LEN] {
        let mut out = [0; DISK_RESP_LEN];
        out[0] = self.mode;
        out[1] = self.status.as_byte();
        put_digits(&mut out[2..], self.blockid);
        out
    }

    /// Decode a response read back from `port`.
    pub fn parse(raw: &[u8], port: PortId) -> Option<Self> {
        if raw.len() < DISK_RESP_LEN {
            return None;
        }
        let status = match raw[1] {
            b'0' => DiskStatus::Ok,
            b'1' => DiskStatus::Failed,
            _ => return None,
        };
        Some(DiskResp {
            mode: raw[0],
            status,
            blockid: parse_digits(MsgField::BlockId, &raw[2..DISK_RESP_LEN]).ok()?,
            port,
        })
    }
}

fn parse_digits(field: MsgField, raw: &[u8]) -> Result<u32, DiskMsgError> {
    raw.iter().try_fold(0u32, |acc, &byte| {
        if byte.is_ascii_digit() {
            Ok(acc * 10 + u32::from(byte - b'0'))
        } else {
            Err(DiskMsgError::BadDigit { field, byte })
        }
    })
}

// Too-large values keep their low digits.
fn put_digits(out: &mut [u8], mut v: u32) {
    for b in out.iter_mut().rev() {
        *b = b'0' + (v % 10) as u8;
        v /= 10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_decimal() {
        let msg = DiskMsg::parse(b"W0000042").unwrap_err();
        assert_eq!(msg, DiskMsgError::TooShort(8));

        let msg = DiskMsg::parse(b"R123456709870012").unwrap();
        assert_eq!(
            msg,
            DiskMsg {
                mode: b'R',
                blockid: 1_234_567,
                data_port: 987,
                msg_port: 12,
            }
        );
        assert_eq!(DiskMode::try_from(msg.mode), Ok(DiskMode::Read));
    }

    #[test]
    fn encode_pads_with_zeroes() {
        let msg = DiskMsg {
            mode: b'W',
            blockid: 42,
            data_port: 3,
            msg_port: 4,
        };
        assert_eq!(&msg.encode(), b"W000004200030004");
        assert_eq!(DiskMsg::parse(&msg.encode()), Ok(msg));
    }

    #[test]
    fn mode_is_not_validated_by_parse() {
        let msg = DiskMsg::parse(b"X000000100020003").unwrap();
        assert_eq!(DiskMode::try_from(msg.mode), Err(b'X'));
    }

    #[test]
    fn rejects_non_digits() {
        assert_eq!(
            DiskMsg::parse(b"W00 004200030004"),
            Err(DiskMsgError::BadDigit {
                field: MsgField::BlockId,
                byte: b' ',
            })
        );
        assert_eq!(
            DiskMsg::parse(b"W00000420003000-"),
            Err(DiskMsgError::BadDigit {
                field: MsgField::MsgPort,
                byte: b'-',
            })
        );
    }

    #[test]
    fn salvage_needs_a_legible_msg_port() {
        assert_eq!(
            DiskMsg::salvage(b"W0000042000x0004"),
            Some(DiskResp::failed(b'W', 42, 4))
        );
        assert_eq!(
            DiskMsg::salvage(b"Wabcdefg00010004"),
            Some(DiskResp::failed(b'W', 0, 4))
        );
        assert_eq!(DiskMsg::salvage(b"W00000420001000?"), None);
    }

    #[test]
    fn response_layout() {
        let resp = DiskResp::ok(DiskMode::Write, 42, 4);
        assert_eq!(&resp.encode(), b"W00000042");
        assert_eq!(&DiskResp::failed(b'X', 7, 4).encode(), b"X10000007");
        assert_eq!(DiskResp::parse(&resp.encode(), 4), Some(resp));
        assert_eq!(DiskResp::parse(b"W20000042", 4), None);
    }

    #[test]
    fn error_messages() {
        use std::string::ToString;

        assert_eq!(
            DiskMsgError::TooShort(3).to_string(),
            "disk message is 3 bytes, want 16"
        );
        assert_eq!(
            DiskMsgError::BadDigit {
                field: MsgField::DataPort,
                byte: b'x',
            }
            .to_string(),
            "bad digit 0x78 in data port field"
        );
    }
}
