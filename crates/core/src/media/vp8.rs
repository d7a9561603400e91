use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{DEFAULT_MTU, Packetizer, PropertyValue};
use crate::codec::Codec;
use crate::error::{Result, SinkError};

/// Payload descriptor with X, I and a 15-bit picture id.
const DESCRIPTOR_LEN: usize = 4;

/// VP8 RTP packetizer (RFC 7741).
///
/// Every packet starts with a 4-byte payload descriptor:
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |X|R|N|S|R| PID |   X=1, S=1 on the first packet of a frame
/// +-+-+-+-+-+-+-+-+
/// |I|L|T|K| RSV   |   I=1
/// +-+-+-+-+-+-+-+-+
/// |M| PictureID   |   M=1, 15-bit picture id
/// +-+-+-+-+-+-+-+-+
/// |   PictureID   |
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// The picture id increments per frame and wraps at `0x7FFF`.
#[derive(Debug)]
pub struct Vp8Packetizer {
    header: RtpHeader,
    mtu: usize,
    picture_id: u16,
}

impl Vp8Packetizer {
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

    fn descriptor(&self, start: bool) -> [u8; DESCRIPTOR_LEN] {
        let first = if start { 0x90 } else { 0x80 };
        [
            first,
            0x80,
            0x80 | (self.picture_id >> 8) as u8,
            self.picture_id as u8,
        ]
    }
}

impl Packetizer for Vp8Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let max = self.mtu - DESCRIPTOR_LEN;
        let count = encoded_data.len().div_ceil(max.max(1));
        let mut packets = Vec::with_capacity(count);

        for (i, chunk) in super::rtp::chunks(encoded_data, max).enumerate() {
            let descriptor = self.descriptor(i == 0);
            packets.push(self.header.packet(i + 1 == count, &[&descriptor, chunk]));
        }

        self.picture_id = (self.picture_id + 1) & 0x7FFF;
        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec(&self) -> Codec {
        Codec::Vp8
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self) -> Vec<String> {
        vec![format!("a=rtpmap:{} VP8/90000", self.header.pt)]
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        match (name, value) {
            ("mtu", PropertyValue::Int(v)) if *v > (RTP_HEADER_LEN + DESCRIPTOR_LEN) as i64 => {
                self.mtu = *v as usize - RTP_HEADER_LEN;
                Ok(())
            }
            ("picture-id-mode", PropertyValue::Str(mode)) if mode == "15-bit" => Ok(()),
            ("mtu" | "picture-id-mode", other) => Err(SinkError::Property {
                name: name.to_string(),
                reason: format!("invalid value {other}"),
            }),
            _ => Err(SinkError::unknown_property(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packetizer() -> Vp8Packetizer {
        let mut p = Vp8Packetizer::new(96, 0x0102_0304);
        p.picture_id = 0x7FFE;
        p
    }

    #[test]
    fn single_packet_frame() {
        let mut p = make_packetizer();
        let packets = p.packetize(&[0x10, 0x02, 0x00, 0x9d], 3000);
        assert_eq!(packets.len(), 1);

        let pkt = &packets[0];
        assert_eq!(pkt[1] & 0x80, 0x80);
        assert_eq!(&pkt[RTP_HEADER_LEN..RTP_HEADER_LEN + 4], &[0x90, 0x80, 0xFF, 0xFE]);
        assert_eq!(&pkt[RTP_HEADER_LEN + 4..], &[0x10, 0x02, 0x00, 0x9d]);
    }

    #[test]
    fn fragments_only_first_has_start_bit() {
        let mut p = make_packetizer().with_mtu(54);
        let frame = vec![0x42; 120];
        let packets = p.packetize(&frame, 3000);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][RTP_HEADER_LEN], 0x90);
        assert_eq!(packets[1][RTP_HEADER_LEN], 0x80);
        assert_eq!(packets[2][RTP_HEADER_LEN], 0x80);
        assert_eq!(packets[1][1] & 0x80, 0);
        assert_eq!(packets[2][1] & 0x80, 0x80);

        let payload: usize = packets.iter().map(|p| p.len() - RTP_HEADER_LEN - 4).sum();
        assert_eq!(payload, 120);
    }

    #[test]
    fn picture_id_wraps() {
        let mut p = make_packetizer();
        p.packetize(&[0; 8], 3000);
        assert_eq!(p.picture_id(), 0x7FFF);
        p.packetize(&[0; 8], 3000);
        assert_eq!(p.picture_id(), 0);
    }

    #[test]
    fn sdp_rtpmap() {
        let p = make_packetizer();
        assert_eq!(p.sdp_attributes(), vec!["a=rtpmap:96 VP8/90000".to_string()]);
    }
}
