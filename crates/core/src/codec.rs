//! Static codec table.
//!
//! Every codec a client may negotiate is described once here: the caps
//! media type an encoder must be able to produce, the RTP encoding name,
//! and the packetizer that frames its bitstream. The table is never
//! mutated at runtime.

use std::fmt;

use crate::media::PacketizerKind;

/// Video codecs a branch can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Vp8,
    H264,
    Vp9,
    Av1,
}

/// Immutable description of one codec.
#[derive(Debug)]
pub struct CodecDescriptor {
    pub codec: Codec,
    /// Name used by clients and configuration (`"vp8"`, `"h264"`, ...).
    pub name: &'static str,
    /// Target caps media type an encoder must produce.
    pub media_type: &'static str,
    /// Encoding name for the SDP `a=rtpmap` attribute.
    pub encoding_name: &'static str,
    /// RTP payload type advertised for this codec.
    pub payload_type: u8,
    /// Packetizer that frames this codec's bitstream.
    pub packetizer: PacketizerKind,
}

static DESCRIPTORS: [CodecDescriptor; 4] = [
    CodecDescriptor {
        codec: Codec::Vp8,
        name: "vp8",
        media_type: "video/x-vp8",
        encoding_name: "VP8",
        payload_type: 96,
        packetizer: PacketizerKind::Vp8,
    },
    CodecDescriptor {
        codec: Codec::H264,
        name: "h264",
        media_type: "video/x-h264",
        encoding_name: "H264",
        payload_type: 102,
        packetizer: PacketizerKind::H264,
    },
    CodecDescriptor {
        codec: Codec::Vp9,
        name: "vp9",
        media_type: "video/x-vp9",
        encoding_name: "VP9",
        payload_type: 98,
        packetizer: PacketizerKind::Vp9,
    },
    CodecDescriptor {
        codec: Codec::Av1,
        name: "av1",
        media_type: "video/x-av1",
        encoding_name: "AV1",
        payload_type: 45,
        packetizer: PacketizerKind::Av1,
    },
];

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::Vp8, Codec::H264, Codec::Vp9, Codec::Av1];

    /// Look up a codec by name, ignoring case and surrounding whitespace.
    ///
    /// Returns `None` for names outside the table; callers treat that as
    /// "no preference".
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        DESCRIPTORS
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.codec)
    }

    pub fn descriptor(self) -> &'static CodecDescriptor {
        match self {
            Codec::Vp8 => &DESCRIPTORS[0],
            Codec::H264 => &DESCRIPTORS[1],
            Codec::Vp9 => &DESCRIPTORS[2],
            Codec::Av1 => &DESCRIPTORS[3],
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn media_type(self) -> &'static str {
        self.descriptor().media_type
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Find the codec whose target media type is `media_type`.
pub fn codec_for_media_type(media_type: &str) -> Option<Codec> {
    DESCRIPTORS
        .iter()
        .find(|d| d.media_type == media_type)
        .map(|d| d.codec)
}
