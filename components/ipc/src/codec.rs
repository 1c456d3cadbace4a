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

//! Cooperative frame codec.
//!
//! Wrapping a socket in `Framed::new(sock, FrameCodec::default())` gives the
//! fiber a suspension point per frame: an incomplete frame yields `Ok(None)`
//! and the task is resumed on readiness. Writes are staged into the framed
//! sink's outbound buffer and drained on write-readiness.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use std::convert::TryFrom;

use crate::{
    error::FrameError,
    frame::{Frame, FrameType, HEADER_LEN},
};

/// Codec for `<type:u8><length:u32 BE><payload>` frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Declared length of the frame currently being assembled, once the
    // header has been validated.
    pending: Option<(FrameType, usize)>,
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let (frame_type, len) = match self.pending {
            Some(pending) => pending,
            None => {
                if buf.len() < HEADER_LEN {
                    return Ok(None);
                }

                let frame_type = FrameType::try_from(buf[0])?;
                let len = BigEndian::read_u32(&buf[1..HEADER_LEN]) as usize;
                buf.advance(HEADER_LEN);

                // A bad declared length is rejected here, before any payload
                // bytes are consumed past the header.
                frame_type.check_len(len)?;

                buf.reserve(len);
                self.pending = Some((frame_type, len));
                (frame_type, len)
            }
        };

        if buf.len() < len {
            return Ok(None);
        }

        self.pending = None;
        let payload = buf.split_to(len);
        Frame::from_parts(frame_type, &payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(FrameError::ShortRead),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload_len();
        frame.frame_type().check_len(len)?;

        buf.reserve(HEADER_LEN + len);
        buf.put_u8(frame.frame_type() as u8);
        buf.put_u32(len as u32);

        let start = buf.len();
        buf.resize(start + len, 0);
        frame.write_payload(&mut buf[start..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(frame: Frame) {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_decode_identity() {
        round_trip(Frame::String("This is a test.".to_owned()));
        round_trip(Frame::Data(b"\x00\x01\x02\xff".to_vec()));
        round_trip(Frame::U8(0xa5));
        round_trip(Frame::I8(-128));
        round_trip(Frame::U64(u64::max_value()));
        round_trip(Frame::I64(i64::min_value()));
    }

    #[test]
    fn partial_frame_suspends() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::U64(17), &mut buf).unwrap();

        let mut partial = buf.split_to(7);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Frame::U64(17)));
    }

    #[test]
    fn oversized_fixed_width_is_bad_size() {
        let mut codec = FrameCodec::default();
        // u64 frame declaring nine payload bytes.
        let mut buf = BytesMut::from(&[0x38, 0, 0, 0, 9][..]);
        buf.extend_from_slice(&[0; 9]);
        match codec.decode(&mut buf) {
            Err(FrameError::BadSize { tag: 0x38, len: 9 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // Nothing beyond the header was consumed.
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn eof_mid_frame_is_short_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Data(vec![1, 2, 3, 4]), &mut buf).unwrap();
        buf.truncate(6);
        match codec.decode_eof(&mut buf) {
            Err(FrameError::ShortRead) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn bad_tag_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x99, 0, 0, 0, 0][..]);
        match codec.decode(&mut buf) {
            Err(FrameError::BadType { tag: 0x99 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
