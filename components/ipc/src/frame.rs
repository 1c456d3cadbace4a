// Copyright 2022 The Ledgerd Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The typed frame and its wire representation.

use byteorder::{BigEndian, ByteOrder};

use std::convert::TryFrom;

use crate::{authed::MAC_LEN, error::FrameError};

/// Upper bound on `string` and `data` payloads.
///
/// Anything larger than this is treated as a protocol violation rather than
/// an allocation request.
pub const MAX_VARIABLE_PAYLOAD: usize = 10 * 1024 * 1024;

/// Size of the frame header: one tag byte plus a big-endian u32 length.
pub const HEADER_LEN: usize = 5;

/// Recognized frame type tags.
///
/// The numeric values are implementation-chosen but stable across restarts of
/// a deployment; both sides of every socket in the fleet are built from the
/// same crate, so stability within a build is sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// UTF-8 string payload.
    String = 0x10,
    /// Opaque byte payload.
    Data = 0x20,
    /// Unsigned 8-bit integer.
    U8 = 0x30,
    /// Signed 8-bit integer.
    I8 = 0x31,
    /// Unsigned 64-bit integer, big-endian.
    U64 = 0x38,
    /// Signed 64-bit integer, big-endian.
    I64 = 0x39,
    /// Authenticated-encryption envelope.
    Authed = 0x40,
}

impl FrameType {
    /// The smallest payload length valid for this type.
    pub fn min_payload_len(self) -> usize {
        match self {
            FrameType::String | FrameType::Data => 0,
            FrameType::U8 | FrameType::I8 => 1,
            FrameType::U64 | FrameType::I64 => 8,
            // Encrypted inner type + inner length, then the MAC.
            FrameType::Authed => 4 + 4 + MAC_LEN,
        }
    }

    /// The largest payload length valid for this type.
    pub fn max_payload_len(self) -> usize {
        match self {
            FrameType::String | FrameType::Data => MAX_VARIABLE_PAYLOAD,
            FrameType::U8 | FrameType::I8 => 1,
            FrameType::U64 | FrameType::I64 => 8,
            FrameType::Authed => 4 + 4 + MAC_LEN + MAX_VARIABLE_PAYLOAD,
        }
    }

    /// Validates a declared payload length against the per-type bounds.
    pub fn check_len(self, len: usize) -> Result<(), FrameError> {
        if len < self.min_payload_len() || len > self.max_payload_len() {
            Err(FrameError::BadSize {
                tag: self as u8,
                len,
            })
        } else {
            Ok(())
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0x10 => Ok(FrameType::String),
            0x20 => Ok(FrameType::Data),
            0x30 => Ok(FrameType::U8),
            0x31 => Ok(FrameType::I8),
            0x38 => Ok(FrameType::U64),
            0x39 => Ok(FrameType::I64),
            0x40 => Ok(FrameType::Authed),
            tag => Err(FrameError::BadType { tag }),
        }
    }
}

/// A typed IPC message.
///
/// `Authed` carries the sealed envelope produced by
/// [`AuthedChannel::seal`](crate::authed::AuthedChannel::seal); the framing
/// layer treats it as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 string.
    String(String),
    /// Opaque bytes.
    Data(Vec<u8>),
    /// Unsigned byte.
    U8(u8),
    /// Signed byte.
    I8(i8),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 64-bit integer.
    I64(i64),
    /// Sealed authenticated envelope.
    Authed(Vec<u8>),
}

impl Frame {
    /// The type tag of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::String(_) => FrameType::String,
            Frame::Data(_) => FrameType::Data,
            Frame::U8(_) => FrameType::U8,
            Frame::I8(_) => FrameType::I8,
            Frame::U64(_) => FrameType::U64,
            Frame::I64(_) => FrameType::I64,
            Frame::Authed(_) => FrameType::Authed,
        }
    }

    /// The payload length of this frame on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::String(s) => s.len(),
            Frame::Data(d) | Frame::Authed(d) => d.len(),
            Frame::U8(_) | Frame::I8(_) => 1,
            Frame::U64(_) | Frame::I64(_) => 8,
        }
    }

    /// Serializes the payload into `out`, which must have room for
    /// [`payload_len`](Self::payload_len) bytes.
    pub fn write_payload(&self, out: &mut [u8]) {
        match self {
            Frame::String(s) => out.copy_from_slice(s.as_bytes()),
            Frame::Data(d) | Frame::Authed(d) => out.copy_from_slice(d),
            Frame::U8(v) => out[0] = *v,
            Frame::I8(v) => out[0] = *v as u8,
            Frame::U64(v) => BigEndian::write_u64(out, *v),
            Frame::I64(v) => BigEndian::write_i64(out, *v),
        }
    }

    /// Reassembles a frame from its type tag and payload bytes.
    ///
    /// The payload length must already have been validated with
    /// [`FrameType::check_len`].
    pub fn from_parts(frame_type: FrameType, payload: &[u8]) -> Result<Self, FrameError> {
        match frame_type {
            FrameType::String => String::from_utf8(payload.to_vec())
                .map(Frame::String)
                .map_err(|_| FrameError::MalformedPayload {
                    tag: frame_type as u8,
                }),
            FrameType::Data => Ok(Frame::Data(payload.to_vec())),
            FrameType::U8 => Ok(Frame::U8(payload[0])),
            FrameType::I8 => Ok(Frame::I8(payload[0] as i8)),
            FrameType::U64 => Ok(Frame::U64(BigEndian::read_u64(payload))),
            FrameType::I64 => Ok(Frame::I64(BigEndian::read_i64(payload))),
            FrameType::Authed => Ok(Frame::Authed(payload.to_vec())),
        }
    }

    /// Consumes the frame, returning the payload of a `Data` frame.
    pub fn into_data(self) -> Result<Vec<u8>, FrameError> {
        match self {
            Frame::Data(d) => Ok(d),
            other => Err(FrameError::UnexpectedType {
                expected: FrameType::Data as u8,
                actual: other.frame_type() as u8,
            }),
        }
    }

    /// Consumes the frame, returning the payload of a `String` frame.
    pub fn into_string(self) -> Result<String, FrameError> {
        match self {
            Frame::String(s) => Ok(s),
            other => Err(FrameError::UnexpectedType {
                expected: FrameType::String as u8,
                actual: other.frame_type() as u8,
            }),
        }
    }

    /// Returns the value of a `U8` frame.
    pub fn as_u8(&self) -> Result<u8, FrameError> {
        match self {
            Frame::U8(v) => Ok(*v),
            other => Err(FrameError::UnexpectedType {
                expected: FrameType::U8 as u8,
                actual: other.frame_type() as u8,
            }),
        }
    }

    /// Returns the value of a `U64` frame.
    pub fn as_u64(&self) -> Result<u64, FrameError> {
        match self {
            Frame::U64(v) => Ok(*v),
            other => Err(FrameError::UnexpectedType {
                expected: FrameType::U64 as u8,
                actual: other.frame_type() as u8,
            }),
        }
    }

    /// Returns the value of an `I64` frame.
    pub fn as_i64(&self) -> Result<i64, FrameError> {
        match self {
            Frame::I64(v) => Ok(*v),
            other => Err(FrameError::UnexpectedType {
                expected: FrameType::I64 as u8,
                actual: other.frame_type() as u8,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tag_round_trip() {
        for frame in &[
            Frame::String("ledgerd".to_owned()),
            Frame::Data(vec![1, 2, 3]),
            Frame::U8(7),
            Frame::I8(-7),
            Frame::U64(0xdead_beef),
            Frame::I64(-42),
        ] {
            let tag = frame.frame_type() as u8;
            assert_eq!(FrameType::try_from(tag).unwrap(), frame.frame_type());
        }
    }

    #[test]
    fn fixed_width_lengths_are_exact() {
        assert!(FrameType::U64.check_len(8).is_ok());
        assert!(FrameType::U64.check_len(7).is_err());
        assert!(FrameType::U64.check_len(9).is_err());
        assert!(FrameType::U8.check_len(1).is_ok());
        assert!(FrameType::U8.check_len(0).is_err());
    }

    #[test]
    fn authed_requires_header_and_mac() {
        assert!(FrameType::Authed.check_len(4 + 4 + MAC_LEN - 1).is_err());
        assert!(FrameType::Authed.check_len(4 + 4 + MAC_LEN).is_ok());
    }

    #[test]
    fn unknown_tag_is_bad_type() {
        match FrameType::try_from(0x77) {
            Err(FrameError::BadType { tag: 0x77 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
