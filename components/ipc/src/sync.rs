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

//! Blocking frame I/O.
//!
//! Used where no fiber scheduler is running: the supervisor before the event
//! loop starts, privilege-separated reader children, and the signal thread.

use byteorder::{BigEndian, ByteOrder};

use std::convert::TryFrom;
use std::io::{self, Read, Write};

use crate::{
    error::FrameError,
    frame::{Frame, FrameType, HEADER_LEN},
};

/// Writes one frame to a blocking stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let len = frame.payload_len();
    frame.frame_type().check_len(len)?;

    let mut header = [0_u8; HEADER_LEN];
    header[0] = frame.frame_type() as u8;
    BigEndian::write_u32(&mut header[1..], len as u32);
    writer.write_all(&header)?;

    let mut payload = vec![0_u8; len];
    frame.write_payload(&mut payload);
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from a blocking stream.
///
/// A clean shutdown before the first header byte is `PeerClosed`; a shutdown
/// anywhere inside a frame is `ShortRead`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0_u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header, true)?;

    let frame_type = FrameType::try_from(header[0])?;
    let len = BigEndian::read_u32(&header[1..]) as usize;
    frame_type.check_len(len)?;

    let mut payload = vec![0_u8; len];
    read_exact_or_closed(reader, &mut payload, false)?;
    Frame::from_parts(frame_type, &payload)
}

/// Reads a frame and requires it to be a `U8`.
pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, FrameError> {
    read_frame(reader)?.as_u8()
}

/// Reads a frame and requires it to be a `U64`.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64, FrameError> {
    read_frame(reader)?.as_u64()
}

/// Reads a frame and requires it to be an `I64`.
pub fn read_i64<R: Read>(reader: &mut R) -> Result<i64, FrameError> {
    read_frame(reader)?.as_i64()
}

/// Reads a frame and requires it to be a `String`.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, FrameError> {
    read_frame(reader)?.into_string()
}

/// Reads a frame and requires it to be `Data`.
pub fn read_data<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    read_frame(reader)?.into_data()
}

fn read_exact_or_closed<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    at_boundary: bool,
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && at_boundary => return Err(FrameError::PeerClosed),
            Ok(0) => return Err(FrameError::ShortRead),
            Ok(n) => filled += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn frame_round_trip_over_socketpair() {
        let (mut lhs, mut rhs) = UnixStream::pair().unwrap();
        let frames = vec![
            Frame::String("This is a test.".to_owned()),
            Frame::U64(12345),
            Frame::I64(-1),
            Frame::Data(vec![0xb8, 0x4e, 0x5b, 0xe9]),
        ];

        for frame in &frames {
            write_frame(&mut lhs, frame).unwrap();
        }
        for frame in &frames {
            assert_eq!(read_frame(&mut rhs).unwrap(), *frame);
        }
    }

    #[test]
    fn closed_peer_at_boundary() {
        let (lhs, mut rhs) = UnixStream::pair().unwrap();
        drop(lhs);
        match read_frame(&mut rhs) {
            Err(FrameError::PeerClosed) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn closed_peer_mid_frame() {
        let (mut lhs, mut rhs) = UnixStream::pair().unwrap();
        // Header declaring four bytes, but only two arrive.
        lhs.write_all(&[0x20, 0, 0, 0, 4, 1, 2]).unwrap();
        drop(lhs);
        match read_frame(&mut rhs) {
            Err(FrameError::ShortRead) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn typed_reader_rejects_mismatch() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::U8(3)).unwrap();
        match read_u64(&mut Cursor::new(buf)) {
            Err(FrameError::UnexpectedType { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
