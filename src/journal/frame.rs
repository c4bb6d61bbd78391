use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 16 * 1024 * 1024;
const FRAME_FIXED_BODY_BYTES: usize = 8 + 8 + 1 + 4;

/// `len | seq | timestamp_micros | op_type | payload | crc32c`, big endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub timestamp_micros: u64,
    pub op_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub fn encode_frame(
    seq: u64,
    timestamp_micros: u64,
    op_type: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let body_len = FRAME_FIXED_BODY_BYTES + payload.len();
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::Corruption);
    }
    let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&frame_length.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&timestamp_micros.to_be_bytes());
    out.push(op_type);
    out.extend_from_slice(payload);
    let crc = crc32c(&out).to_be_bytes();
    out.extend_from_slice(&crc);
    Ok(out)
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(
        &mut self,
        seq: u64,
        timestamp_micros: u64,
        op_type: u8,
        payload: &[u8],
    ) -> Result<usize, FrameError> {
        let frame = encode_frame(seq, timestamp_micros, op_type, payload)?;
        self.inner.write_all(&frame)?;
        Ok(frame.len())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        match self.inner.read_exact(&mut len_buf[1..4]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(FRAME_FIXED_BODY_BYTES..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        match self.inner.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if stored_crc != crc32c(&crc_input) {
            return Err(FrameError::Corruption);
        }

        let seq = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
        let timestamp_micros =
            u64::from_be_bytes(body[8..16].try_into().map_err(|_| FrameError::Corruption)?);
        Ok(Some(Frame {
            seq,
            timestamp_micros,
            op_type: body[16],
            payload: body[17..crc_offset].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameError, FrameReader, FrameWriter, MAX_FRAME_BODY_BYTES};
    use std::io::Cursor;

    #[test]
    fn frames_read_back_in_order() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        for i in 1..=200 {
            writer
                .append(i, 1000 + i, 0x05, format!("op-{i}").as_bytes())
                .expect("append");
        }
        let mut reader = FrameReader::new(Cursor::new(writer.into_inner()));
        for i in 1..=200 {
            let frame = reader.next_frame().expect("next").expect("frame");
            assert_eq!(frame.seq, i);
            assert_eq!(frame.timestamp_micros, 1000 + i);
            assert_eq!(frame.op_type, 0x05);
            assert_eq!(frame.payload, format!("op-{i}").as_bytes());
        }
        assert!(reader.next_frame().expect("end").is_none());
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        let first = writer.append(1, 1, 0x01, b"alpha").expect("append");
        writer.append(2, 2, 0x01, b"beta").expect("append");
        let mut bytes = writer.into_inner();
        bytes[first + 4 + 8 + 8 + 1] ^= 0xFF;

        let mut reader = FrameReader::new(Cursor::new(bytes));
        reader.next_frame().expect("first ok").expect("frame");
        assert_eq!(
            reader.next_frame().expect_err("corrupt"),
            FrameError::Corruption
        );
    }

    #[test]
    fn cut_tail_is_truncation_not_corruption() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        for i in 1..=5 {
            writer.append(i, i, 0x01, &[7u8; 12]).expect("append");
        }
        let bytes = writer.into_inner();
        for cut in 1..20 {
            let mut reader = FrameReader::new(Cursor::new(&bytes[..bytes.len() - cut]));
            loop {
                match reader.next_frame() {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(FrameError::Truncation) => break,
                    Err(e) => panic!("unexpected error after cutting {cut} bytes: {e:?}"),
                }
            }
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let oversized = (MAX_FRAME_BODY_BYTES as u32).saturating_add(1);
        let mut reader = FrameReader::new(Cursor::new(oversized.to_be_bytes().to_vec()));
        assert_eq!(
            reader.next_frame().expect_err("oversized"),
            FrameError::Corruption
        );
    }
}
