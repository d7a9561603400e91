use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{DEFAULT_MTU, Packetizer, PropertyValue};
use crate::codec::Codec;
use crate::error::{Result, SinkError};

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Used in `a=fmtp` until an SPS has been seen: constrained baseline 3.1.
const FALLBACK_PROFILE_LEVEL_ID: &str = "42e01f";

/// How parameter sets are framed ahead of a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Every NAL unit travels in its own packet (or FU-A fragments).
    None,
    /// SPS/PPS preceding a slice are bundled into a single STAP-A so the
    /// decoder has them in the same packet burst as the IDR.
    ZeroLatency,
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Input is an Annex B access unit. Each NAL unit is sent as:
///
/// - **Single NAL unit packet** (§5.6) when it fits the MTU.
/// - **FU-A fragments** (§5.8) otherwise; the FU indicator carries F/NRI
///   and type 28, the FU header carries S/E and the original NAL type.
/// - **STAP-A** (§5.7.1) for parameter sets when
///   [`AggregateMode::ZeroLatency`] is selected.
///
/// SPS/PPS are captured from the stream as they pass. `config-interval`
/// controls re-insertion: `-1` inserts them before every IDR that lacks
/// them, `0` never inserts, `N > 0` inserts at most every `N` seconds of
/// RTP time. The marker bit closes each access unit (§5.1).
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    config_interval: i64,
    last_config_ts: Option<u64>,
    aggregate: AggregateMode,
}

impl H264Packetizer {
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
            sps: None,
            pps: None,
            config_interval: 0,
            last_config_ts: None,
            aggregate: AggregateMode::None,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(3);
        self
    }

    pub fn config_interval(&self) -> i64 {
        self.config_interval
    }

    pub fn aggregate_mode(&self) -> AggregateMode {
        self.aggregate
    }

    /// Split an Annex B byte stream on `00 00 01` / `00 00 00 01` start codes.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        // (start code offset, payload offset)
        let mut marks = Vec::new();
        let mut i = 0;
        while i + 3 <= data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
                marks.push((code_start, i + 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        let mut nals = Vec::with_capacity(marks.len());
        for (idx, &(_, payload)) in marks.iter().enumerate() {
            let end = marks.get(idx + 1).map_or(data.len(), |&(code, _)| code);
            if end > payload {
                nals.push(&data[payload..end]);
            }
        }
        nals
    }

    fn profile_level_id(&self) -> String {
        match self.sps.as_deref() {
            Some(sps) if sps.len() >= 4 => format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]),
            _ => FALLBACK_PROFILE_LEVEL_ID.to_string(),
        }
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn should_insert_config(&self) -> bool {
        match self.config_interval {
            i if i < 0 => true,
            0 => false,
            secs => match self.last_config_ts {
                None => true,
                Some(last) => {
                    let elapsed = self.header.timestamp().saturating_sub(last);
                    elapsed >= secs as u64 * super::VIDEO_CLOCK_RATE as u64
                }
            },
        }
    }

    /// Send one NAL unit as a single packet or as FU-A fragments.
    fn packetize_nal(&mut self, nal: &[u8], last_of_frame: bool, packets: &mut Vec<Vec<u8>>) {
        if nal.is_empty() {
            return;
        }

        if nal.len() <= self.mtu {
            packets.push(self.header.packet(last_of_frame, &[nal]));
            return;
        }

        let fu_indicator = (nal[0] & 0xE0) | NAL_FU_A;
        let nal_type = nal[0] & 0x1F;
        let body = &nal[1..];
        let max = self.mtu - 2;
        let count = body.len().div_ceil(max);

        for (i, fragment) in super::rtp::chunks(body, max).enumerate() {
            let start = i == 0;
            let end = i + 1 == count;
            let fu_header = ((start as u8) << 7) | ((end as u8) << 6) | nal_type;
            packets.push(
                self.header
                    .packet(end && last_of_frame, &[&[fu_indicator, fu_header], fragment]),
            );
        }
    }

    /// Emit parameter sets as one STAP-A, or individually if they don't fit.
    fn flush_aggregate(&mut self, pending: &[&[u8]], last_of_frame: bool, packets: &mut Vec<Vec<u8>>) {
        match pending {
            [] => {}
            [single] => self.packetize_nal(single, last_of_frame, packets),
            many => {
                let size: usize = 1 + many.iter().map(|n| 2 + n.len()).sum::<usize>();
                if size > self.mtu {
                    let n = many.len();
                    for (i, nal) in many.iter().enumerate() {
                        self.packetize_nal(nal, last_of_frame && i + 1 == n, packets);
                    }
                    return;
                }
                let f_bit = many.iter().fold(0, |acc, n| acc | (n[0] & 0x80));
                let nri = many.iter().map(|n| n[0] & 0x60).max().unwrap_or(0);
                let mut payload = Vec::with_capacity(size);
                payload.push(f_bit | nri | NAL_STAP_A);
                for nal in many {
                    payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                    payload.extend_from_slice(nal);
                }
                packets.push(self.header.packet(last_of_frame, &[&payload]));
            }
        }
    }
}

fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map_or(0, |b| b & 0x1F)
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nals = Self::extract_nal_units(encoded_data);

        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_idr = false;
        for nal in &nals {
            match nal_type(nal) {
                NAL_SPS => {
                    has_sps = true;
                    if self.sps.as_deref() != Some(*nal) {
                        tracing::debug!(len = nal.len(), "captured SPS");
                        self.sps = Some(nal.to_vec());
                    }
                }
                NAL_PPS => {
                    has_pps = true;
                    if self.pps.as_deref() != Some(*nal) {
                        tracing::debug!(len = nal.len(), "captured PPS");
                        self.pps = Some(nal.to_vec());
                    }
                }
                NAL_IDR => has_idr = true,
                _ => {}
            }
        }

        let mut injected: Vec<Vec<u8>> = Vec::new();
        if has_idr && self.should_insert_config() {
            if !has_sps && let Some(sps) = &self.sps {
                injected.push(sps.clone());
            }
            if !has_pps && let Some(pps) = &self.pps {
                injected.push(pps.clone());
            }
            self.last_config_ts = Some(self.header.timestamp());
        } else if has_sps && has_pps {
            self.last_config_ts = Some(self.header.timestamp());
        }

        let units: Vec<&[u8]> = injected
            .iter()
            .map(Vec::as_slice)
            .chain(nals.iter().copied())
            .collect();

        let mut packets = Vec::new();
        let mut pending: Vec<&[u8]> = Vec::new();
        let total = units.len();
        for (i, nal) in units.iter().copied().enumerate() {
            let last = i + 1 == total;
            let t = nal_type(nal);
            if self.aggregate == AggregateMode::ZeroLatency && (t == NAL_SPS || t == NAL_PPS) && !last {
                pending.push(nal);
                continue;
            }
            self.flush_aggregate(&pending, false, &mut packets);
            pending.clear();
            self.packetize_nal(nal, last, &mut packets);
        }

        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// `a=rtpmap` and `a=fmtp` (RFC 6184 §8.1). Once SPS/PPS have been
    /// captured the fmtp line carries the real profile and
    /// `sprop-parameter-sets`.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.header.pt;
        let mut fmtp = format!(
            "a=fmtp:{pt} level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
            self.profile_level_id()
        );
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(";sprop-parameter-sets=");
            fmtp.push_str(&sprop);
        }
        vec![format!("a=rtpmap:{pt} H264/90000"), fmtp]
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        match (name, value) {
            ("config-interval", PropertyValue::Int(v)) if *v >= -1 => {
                self.config_interval = *v;
                Ok(())
            }
            ("aggregate-mode", PropertyValue::Str(mode)) => {
                self.aggregate = match mode.as_str() {
                    "none" => AggregateMode::None,
                    "zero-latency" => AggregateMode::ZeroLatency,
                    other => {
                        return Err(SinkError::Property {
                            name: name.to_string(),
                            reason: format!("unknown aggregate mode '{other}'"),
                        });
                    }
                };
                Ok(())
            }
            ("mtu", PropertyValue::Int(v))
                if *v > (RTP_HEADER_LEN + 2) as i64 && *v <= u16::MAX as i64 =>
            {
                self.mtu = *v as usize - RTP_HEADER_LEN;
                Ok(())
            }
            ("config-interval" | "aggregate-mode" | "mtu", other) => Err(SinkError::Property {
                name: name.to_string(),
                reason: format!("invalid value {other}"),
            }),
            _ => Err(SinkError::unknown_property(name)),
        }
    }
}
