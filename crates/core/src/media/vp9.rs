use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{DEFAULT_MTU, Packetizer, PropertyValue};
use crate::codec::Codec;
use crate::error::{Result, SinkError};

const DESCRIPTOR_LEN: usize = 3;

const FLAG_I: u8 = 0x80;
const FLAG_P: u8 = 0x40;
const FLAG_B: u8 = 0x08;
const FLAG_E: u8 = 0x04;

/// VP9 RTP packetizer (RFC 9628), flexible mode off, no layer indices.
///
/// Descriptor layout: `|I|P|L|F|B|E|V|Z|` followed by `M` and a 15-bit
/// picture id. `B` marks the first packet of a frame and `E` the last.
/// `P` (inter-picture predicted) is derived from the uncompressed header
/// of the frame.
#[derive(Debug)]
pub struct Vp9Packetizer {
    header: RtpHeader,
    mtu: usize,
    picture_id: u16,
}

impl Vp9Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc))
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            picture_id: rand::random::<u16>() & 0x7FFF,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(DESCRIPTOR_LEN + 1);
        self
    }

    pub fn picture_id(&self) -> u16 {
        self.picture_id
    }
}

/// Whether the frame is a keyframe, from the first byte of the
/// uncompressed header:
/// `frame_marker(2) profile_low(1) profile_high(1) [reserved(1)] show_existing(1) frame_type(1)`.
pub fn is_keyframe(frame: &[u8]) -> bool {
    let Some(&b) = frame.first() else {
        return false;
    };
    if b >> 6 != 0b10 {
        return false;
    }
    let profile = ((b >> 5) & 1) | (((b >> 4) & 1) << 1);
    // Profile 3 carries an extra reserved bit.
    let shift = if profile == 3 { 1 } else { 0 };
    let show_existing = (b >> (3 - shift)) & 1;
    if show_existing == 1 {
        return false;
    }
    (b >> (2 - shift)) & 1 == 0
}

impl Packetizer for Vp9Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let predicted = !is_keyframe(encoded_data);
        let max = self.mtu - DESCRIPTOR_LEN;
        let count = encoded_data.len().div_ceil(max.max(1));
        let mut packets = Vec::with_capacity(count);

        for (i, chunk) in super::rtp::chunks(encoded_data, max).enumerate() {
            let last = i + 1 == count;
            let mut flags = FLAG_I;
            if predicted {
                flags |= FLAG_P;
            }
            if i == 0 {
                flags |= FLAG_B;
            }
            if last {
                flags |= FLAG_E;
            }
            let descriptor = [
                flags,
                0x80 | (self.picture_id >> 8) as u8,
                self.picture_id as u8,
            ];
            packets.push(self.header.packet(last, &[&descriptor, chunk]));
        }

        self.picture_id = (self.picture_id + 1) & 0x7FFF;
        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec(&self) -> Codec {
        Codec::Vp9
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.header.pt;
        vec![
            format!("a=rtpmap:{pt} VP9/90000"),
            format!("a=fmtp:{pt} profile-id=0"),
        ]
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        match (name, value) {
            ("mtu", PropertyValue::Int(v)) if *v > (RTP_HEADER_LEN + DESCRIPTOR_LEN) as i64 => {
                self.mtu = *v as usize - RTP_HEADER_LEN;
                Ok(())
            }
            ("mtu", other) => Err(SinkError::Property {
                name: name.to_string(),
                reason: format!("invalid value {other}"),
            }),
            _ => Err(SinkError::unknown_property(name)),
        }
    }
}
