//! Discovery announcement
//!
//! Producers broadcast this periodically; consumers treat each one as a
//! heartbeat for the named segment.
//!
//! ```text
//! /memorySharing ,ssiiiii
//!   segment_name       s  "audioSharing_1000" (or bare key "1000")
//!   stream_name        s  human-readable
//!   frames_per_buffer  i
//!   sample_rate        i
//!   channel_count      i
//!   ring_slot_count    i
//!   return_port        i  producer control socket
//! ```

use bytes::Bytes;

use super::osc::{ArgReader, OscMessage};
use super::StreamFormat;
use crate::constants::ANNOUNCE_ADDRESS;
use crate::error::CodecError;
use crate::shm::SegmentId;

/// Decoded discovery announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub segment: SegmentId,
    pub stream_name: String,
    pub format: StreamFormat,
    pub return_port: u16,
}

fn positive(field: &'static str, value: i32) -> Result<u32, CodecError> {
    if value <= 0 {
        return Err(CodecError::InvalidField {
            field,
            value: value as i64,
        });
    }
    Ok(value as u32)
}

impl Announcement {
    pub fn to_message(&self) -> OscMessage {
        OscMessage::new(ANNOUNCE_ADDRESS)
            .string(self.segment.name())
            .string(self.stream_name.as_str())
            .int(self.format.frames_per_buffer as i32)
            .int(self.format.sample_rate as i32)
            .int(self.format.channels as i32)
            .int(self.format.ring_slot_count as i32)
            .int(self.return_port as i32)
    }

    /// Encode for the wire. Fails for a segment name the decoder would refuse.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if !self.segment.is_canonical() {
            return Err(CodecError::InvalidSegment(self.segment.name().to_string()));
        }
        self.to_message().encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Self::from_message(&OscMessage::decode(data)?)
    }

    pub fn from_message(message: &OscMessage) -> Result<Self, CodecError> {
        if message.address != ANNOUNCE_ADDRESS {
            return Err(CodecError::UnexpectedAddress(message.address.clone()));
        }

        let mut args = ArgReader::new(message);
        let segment_field = args.string()?;
        let stream_name = args.string()?.to_string();
        let frames_per_buffer = positive("frames_per_buffer", args.int32()?)?;
        let sample_rate = positive("sample_rate", args.int32()?)?;
        let channels = positive("channel_count", args.int32()?)?;
        let ring_slot_count = positive("ring_slot_count", args.int32()?)?;
        let return_port = args.int32()?;
        args.finish()?;

        let segment = SegmentId::parse(segment_field)
            .map_err(|_| CodecError::InvalidSegment(segment_field.to_string()))?;

        let channels = u16::try_from(channels).map_err(|_| CodecError::InvalidField {
            field: "channel_count",
            value: channels as i64,
        })?;
        let return_port = u16::try_from(return_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(CodecError::InvalidField {
                field: "return_port",
                value: return_port as i64,
            })?;

        let format = StreamFormat {
            frames_per_buffer,
            sample_rate,
            channels,
            ring_slot_count,
        };
        format
            .validate()
            .map_err(|e| CodecError::InvalidFormat(e.to_string()))?;

        Ok(Self {
            segment,
            stream_name,
            format,
            return_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Announcement {
        Announcement {
            segment: SegmentId::from_key(1000),
            stream_name: "synth".into(),
            format: StreamFormat {
                frames_per_buffer: 512,
                sample_rate: 44100,
                channels: 2,
                ring_slot_count: 2,
            },
            return_port: 2021,
        }
    }

    #[test]
    fn test_encode_decode() {
        let ann = sample();
        let bytes = ann.encode().unwrap();
        assert_eq!(Announcement::decode(&bytes).unwrap(), ann);
        assert_eq!(ann.to_message().type_tags(), ",ssiiiii");
    }

    #[test]
    fn test_non_canonical_segment_not_encoded() {
        let mut ann = sample();
        ann.segment = SegmentId::new("scratch_area", 1000);
        assert!(matches!(ann.encode(), Err(CodecError::InvalidSegment(_))));

        ann.segment = SegmentId::new("audioSharing_1001", 1000);
        assert!(matches!(ann.encode(), Err(CodecError::InvalidSegment(_))));
    }

    #[test]
    fn test_bare_key_segment_accepted() {
        let msg = OscMessage::new(ANNOUNCE_ADDRESS)
            .string("1000")
            .string("synth")
            .int(512)
            .int(44100)
            .int(2)
            .int(2)
            .int(2021);
        let ann = Announcement::from_message(&msg).unwrap();
        assert_eq!(ann.segment, SegmentId::from_key(1000));
    }

    #[test]
    fn test_wrong_address_rejected() {
        let mut msg = sample().to_message();
        msg.address = "/other".into();
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::UnexpectedAddress(_))
        ));
    }

    #[test]
    fn test_missing_return_port_rejected() {
        let mut msg = sample().to_message();
        msg.args.pop();
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_extra_argument_rejected() {
        let msg = sample().to_message().int(1);
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut msg = sample().to_message();
        msg.args[3] = super::super::OscArg::Int(0);
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::InvalidField { field: "sample_rate", .. })
        ));

        let mut msg = sample().to_message();
        msg.args[5] = super::super::OscArg::Int(1);
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::InvalidFormat(_))
        ));

        let mut msg = sample().to_message();
        msg.args[6] = super::super::OscArg::Int(70000);
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::InvalidField { field: "return_port", .. })
        ));

        let mut msg = sample().to_message();
        msg.args[0] = super::super::OscArg::Str("not-a-segment".into());
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_mistyped_argument_rejected() {
        let mut msg = sample().to_message();
        msg.args[2] = super::super::OscArg::Str("512".into());
        assert!(matches!(
            Announcement::from_message(&msg),
            Err(CodecError::ArgumentType { index: 2, .. })
        ));
    }
}
