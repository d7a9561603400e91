use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{DEFAULT_MTU, Packetizer, PropertyValue};
use crate::codec::Codec;
use crate::error::{Result, SinkError};

const OBU_SEQUENCE_HEADER: u8 = 1;
const OBU_TEMPORAL_DELIMITER: u8 = 2;
const OBU_TILE_LIST: u8 = 8;
const OBU_PADDING: u8 = 15;

const AGG_Z: u8 = 0x80;
const AGG_Y: u8 = 0x40;
const AGG_W1: u8 = 0x10;
const AGG_N: u8 = 0x08;

/// One OBU as it will travel on the wire: header (with `obu_has_size_field`
/// cleared), optional extension byte, and payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Obu {
    pub obu_type: u8,
    pub element: Vec<u8>,
}

/// Parse a low-overhead bitstream temporal unit into OBUs.
///
/// Stops at the first malformed OBU; whatever parsed cleanly is returned.
pub fn parse_obus(data: &[u8]) -> Vec<Obu> {
    let mut obus = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let header = data[pos];
        let obu_type = (header >> 3) & 0x0F;
        let has_extension = header & 0x04 != 0;
        let has_size = header & 0x02 != 0;

        let mut cursor = pos + 1;
        let extension = if has_extension {
            let Some(&ext) = data.get(cursor) else { break };
            cursor += 1;
            Some(ext)
        } else {
            None
        };

        let payload_len = if has_size {
            let Some((size, used)) = read_leb128(&data[cursor..]) else {
                break;
            };
            cursor += used;
            size
        } else {
            data.len() - cursor
        };

        let Some(end) = cursor.checked_add(payload_len).filter(|&e| e <= data.len()) else {
            tracing::debug!(obu_type, payload_len, "truncated OBU");
            break;
        };

        let mut element = Vec::with_capacity(2 + payload_len);
        element.push(header & !0x02);
        if let Some(ext) = extension {
            element.push(ext);
        }
        element.extend_from_slice(&data[cursor..end]);
        obus.push(Obu { obu_type, element });

        pos = end;
    }

    obus
}

fn read_leb128(data: &[u8]) -> Option<(usize, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().take(8).enumerate() {
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value as usize, i + 1));
        }
    }
    None
}

/// AV1 RTP packetizer (AOM "RTP Payload Format for AV1").
///
/// Each packet carries one OBU element (`W=1`) behind the 1-byte
/// aggregation header `|Z|Y|W W|N|-|-|-|`. OBUs larger than the MTU are
/// fragmented with `Y` on every piece but the last and `Z` on every piece
/// but the first. Temporal delimiters, tile lists and padding are dropped.
/// `N` is set on the first packet of a temporal unit that starts a coded
/// video sequence.
#[derive(Debug)]
pub struct Av1Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl Av1Packetizer {
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
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(2);
        self
    }
}

impl Packetizer for Av1Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let obus: Vec<Obu> = parse_obus(encoded_data)
            .into_iter()
            .filter(|o| {
                !matches!(
                    o.obu_type,
                    OBU_TEMPORAL_DELIMITER | OBU_TILE_LIST | OBU_PADDING
                )
            })
            .collect();
        let new_sequence = obus.iter().any(|o| o.obu_type == OBU_SEQUENCE_HEADER);

        let max = self.mtu - 1;
        let mut packets = Vec::new();
        let obu_count = obus.len();

        for (i, obu) in obus.iter().enumerate() {
            let last_obu = i + 1 == obu_count;
            let fragments = obu.element.len().div_ceil(max);
            for (j, piece) in super::rtp::chunks(&obu.element, max).enumerate() {
                let mut agg = AGG_W1;
                if j > 0 {
                    agg |= AGG_Z;
                }
                if j + 1 < fragments {
                    agg |= AGG_Y;
                }
                if new_sequence && packets.is_empty() {
                    agg |= AGG_N;
                }
                let marker = last_obu && j + 1 == fragments;
                packets.push(self.header.packet(marker, &[&[agg], piece]));
            }
        }

        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec(&self) -> Codec {
        Codec::Av1
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self) -> Vec<String> {
        vec![format!("a=rtpmap:{} AV1/90000", self.header.pt)]
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        match (name, value) {
            ("mtu", PropertyValue::Int(v)) if *v > (RTP_HEADER_LEN + 1) as i64 => {
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
