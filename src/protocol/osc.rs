//! OSC 1.0 message encoder and decoder
//!
//! Only the subset the discovery protocol needs: single messages (no
//! bundles) with `i`, `f` and `s` arguments.
//!
//! Message layout:
//! ```text
//! address   - OSC-string: UTF-8, NUL-terminated, padded to 4 bytes
//! type tags - OSC-string starting with ','  e.g. ",ssiiiii"
//! arguments - i: int32 BE, f: float32 BE, s: OSC-string
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::CodecError;

const TAG_INT: u8 = b'i';
const TAG_FLOAT: u8 = b'f';
const TAG_STRING: u8 = b's';

/// A typed OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl OscArg {
    pub fn tag(&self) -> char {
        match self {
            OscArg::Int(_) => TAG_INT as char,
            OscArg::Float(_) => TAG_FLOAT as char,
            OscArg::Str(_) => TAG_STRING as char,
        }
    }
}

/// An address-tagged message
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

/// Bytes needed to hold `len` string bytes plus NUL, rounded up to 4
fn padded_len(len: usize) -> usize {
    (len + 4) & !3
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    let padding = padded_len(s.len()) - s.len();
    buf.put_bytes(0, padding);
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::UnexpectedEof)?;
    let total = padded_len(end);
    if buf.remaining() < total {
        return Err(CodecError::UnexpectedEof);
    }
    let raw = buf.split_to(end);
    buf.advance(total - end);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn int(mut self, value: i32) -> Self {
        self.args.push(OscArg::Int(value));
        self
    }

    pub fn float(mut self, value: f32) -> Self {
        self.args.push(OscArg::Float(value));
        self
    }

    pub fn string(mut self, value: impl Into<String>) -> Self {
        self.args.push(OscArg::Str(value.into()));
        self
    }

    /// Type tag string including the leading comma
    pub fn type_tags(&self) -> String {
        std::iter::once(',')
            .chain(self.args.iter().map(OscArg::tag))
            .collect()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(128);
        put_string(&mut buf, &self.address);
        put_string(&mut buf, &self.type_tags());
        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.put_i32(*v),
                OscArg::Float(v) => buf.put_f32(*v),
                OscArg::Str(s) => put_string(&mut buf, s),
            }
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(buf.len()));
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(data.len()));
        }
        let mut buf = Bytes::copy_from_slice(data);

        let address = get_string(&mut buf)?;
        if !address.starts_with('/') {
            return Err(CodecError::InvalidAddress(address));
        }

        if !buf.has_remaining() {
            return Ok(Self::new(address));
        }
        let tags = get_string(&mut buf)?;
        let tags = tags.strip_prefix(',').ok_or(CodecError::MissingTypeTags)?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                TAG_INT => {
                    if buf.remaining() < 4 {
                        return Err(CodecError::UnexpectedEof);
                    }
                    OscArg::Int(buf.get_i32())
                }
                TAG_FLOAT => {
                    if buf.remaining() < 4 {
                        return Err(CodecError::UnexpectedEof);
                    }
                    OscArg::Float(buf.get_f32())
                }
                TAG_STRING => OscArg::Str(get_string(&mut buf)?),
                other => return Err(CodecError::UnsupportedTag(other as char)),
            };
            args.push(arg);
        }

        Ok(Self { address, args })
    }
}

/// Sequential typed reader over message arguments
pub struct ArgReader<'a> {
    args: &'a [OscArg],
    index: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(message: &'a OscMessage) -> Self {
        Self {
            args: &message.args,
            index: 0,
        }
    }

    fn next(&mut self) -> Result<&'a OscArg, CodecError> {
        let arg = self.args.get(self.index).ok_or(CodecError::ArgumentCount {
            expected: self.index + 1,
            found: self.args.len(),
        })?;
        self.index += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: char, found: &OscArg) -> CodecError {
        CodecError::ArgumentType {
            index: self.index - 1,
            expected,
            found: found.tag(),
        }
    }

    pub fn int32(&mut self) -> Result<i32, CodecError> {
        match self.next()? {
            OscArg::Int(v) => Ok(*v),
            other => Err(self.mismatch('i', other)),
        }
    }

    pub fn string(&mut self) -> Result<&'a str, CodecError> {
        match self.next()? {
            OscArg::Str(s) => Ok(s.as_str()),
            other => Err(self.mismatch('s', other)),
        }
    }

    /// Fail if arguments remain
    pub fn finish(self) -> Result<(), CodecError> {
        if self.index != self.args.len() {
            return Err(CodecError::ArgumentCount {
                expected: self.index,
                found: self.args.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_padding() {
        assert_eq!(padded_len(0), 4);
        assert_eq!(padded_len(3), 4);
        assert_eq!(padded_len(4), 8);
        assert_eq!(padded_len(13), 16);
    }

    #[test]
    fn test_encode_layout() {
        let encoded = OscMessage::new("/a").int(1).string("xy").encode().unwrap();
        let expected: &[u8] = &[
            b'/', b'a', 0, 0, // address
            b',', b'i', b's', 0, // tags
            0, 0, 0, 1, // int32
            b'x', b'y', 0, 0, // string
        ];
        assert_eq!(&encoded[..], expected);
    }

    #[test]
    fn test_decode_mixed_args() {
        let msg = OscMessage::new("/memorySharing")
            .string("audioSharing_1000")
            .float(0.5)
            .int(-7);
        let decoded = OscMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = OscMessage::new("/x").int(5).encode().unwrap();
        let err = OscMessage::decode(&encoded[..encoded.len() - 2]).unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEof);

        assert_eq!(OscMessage::decode(b"/abc").unwrap_err(), CodecError::UnexpectedEof);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            OscMessage::decode(b"abc\0"),
            Err(CodecError::InvalidAddress(_))
        ));
        assert_eq!(
            OscMessage::decode(b"/a\0\0xi\0\0").unwrap_err(),
            CodecError::MissingTypeTags
        );
        assert_eq!(
            OscMessage::decode(b"/a\0\0,b\0\0").unwrap_err(),
            CodecError::UnsupportedTag('b')
        );
        assert!(OscMessage::decode(&[0xff; 4096]).is_err());
    }

    #[test]
    fn test_arg_reader_type_checks() {
        let msg = OscMessage::new("/a").string("s").int(3);
        let mut reader = ArgReader::new(&msg);
        assert_eq!(
            reader.int32().unwrap_err(),
            CodecError::ArgumentType {
                index: 0,
                expected: 'i',
                found: 's'
            }
        );

        let mut reader = ArgReader::new(&msg);
        assert_eq!(reader.string().unwrap(), "s");
        assert_eq!(reader.int32().unwrap(), 3);
        assert!(reader.int32().is_err());
    }
}
