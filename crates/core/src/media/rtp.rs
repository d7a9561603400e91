/// RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Composed by every packetizer. The timestamp is kept as u64 so RTP-time
/// arithmetic (config intervals) never wraps; the low 32 bits go on the
/// wire. Padding, extension and CSRC count are always zero.
#[derive(Debug)]
pub struct RtpHeader {
    pub pt: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::trace!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence: rand::random::<u16>() & 0x7fff,
            timestamp: 0,
        }
    }

    /// Random SSRC per RFC 3550 §8.1, so independent branches never collide.
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>())
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    /// Build one packet: header with `marker`, then `payload_parts` in order.
    /// Advances the sequence number.
    pub fn packet(&mut self, marker: bool, payload_parts: &[&[u8]]) -> Vec<u8> {
        let len: usize = payload_parts.iter().map(|p| p.len()).sum();
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + len);
        packet.extend_from_slice(&self.write(marker));
        for part in payload_parts {
            packet.extend_from_slice(part);
        }
        packet
    }

    /// Serialize the 12-byte header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | self.pt;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}

/// Split `payload` into chunks of at most `max` bytes (at least one chunk
/// when `payload` is non-empty).
pub(crate) fn chunks(payload: &[u8], max: usize) -> impl Iterator<Item = &[u8]> {
    payload.chunks(max.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        let mut h = RtpHeader::new(96, 0xAABBCCDD);
        h.set_sequence(0);
        h
    }

    #[test]
    fn version_and_payload_type() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0] >> 6, 2);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        assert_eq!(h.write(false)[1] & 0x80, 0);
        assert_eq!(h.write(true)[1] & 0x80, 0x80);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = make_header();
        h.set_sequence(u16::MAX);
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn packet_concatenates_parts() {
        let mut h = make_header();
        let p = h.packet(true, &[&[1, 2], &[3]]);
        assert_eq!(p.len(), RTP_HEADER_LEN + 3);
        assert_eq!(&p[RTP_HEADER_LEN..], &[1, 2, 3]);
        assert_eq!(u32::from_be_bytes([p[8], p[9], p[10], p[11]]), 0xAABBCCDD);
    }

    #[test]
    fn timestamp_written_low_32_bits() {
        let mut h = make_header();
        h.advance_timestamp(u32::MAX);
        h.advance_timestamp(3001);
        assert_eq!(h.timestamp(), u32::MAX as u64 + 3001);
        let buf = h.write(false);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 3000);
    }
}
