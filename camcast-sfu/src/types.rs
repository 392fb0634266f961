//! Common types used throughout the SFU implementation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(nanoid::nanoid!())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Room identity (the publishing device in practice)
    RoomId
);
string_id!(
    /// One signaling connection
    PeerId
);
string_id!(WorkerId);
string_id!(RouterId);
string_id!(TransportId);
string_id!(ProducerId);
string_id!(ConsumerId);

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Which way media flows on a transport, seen from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// Codec a router (or a peer) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl RtpCodecCapability {
    /// Same codec family and clock rate
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type) && self.clock_rate == codec.clock_rate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// First capability able to receive `codec`
    #[must_use]
    pub fn find(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(codec))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl RtpCodecParameters {
    /// Subtype of the mime type ("VP8" for "video/VP8")
    #[must_use]
    pub fn codec_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(_, name)| name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
}

impl RtpParameters {
    /// The codec actually carried (first entry, RTX and friends follow it)
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// Render a codec parameter the way SDP `fmtp` lines expect it
#[must_use]
pub fn format_parameter(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ProducerId::generate(), ProducerId::generate());
        assert_eq!(RoomId::from("cam-1").as_str(), "cam-1");
    }

    #[test]
    fn test_capability_matches_case_insensitive() {
        let cap = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
        };
        let codec = RtpCodecParameters {
            mime_type: "video/vp8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
        };
        assert!(cap.matches(&codec));
        assert_eq!(codec.codec_name(), "vp8");

        let caps = RtpCapabilities { codecs: vec![cap] };
        assert!(caps.find(&codec).is_some());
    }

    #[test]
    fn test_rtp_parameters_wire_format() {
        let params: RtpParameters = serde_json::from_value(serde_json::json!({
            "codecs": [{
                "mimeType": "video/H264",
                "payloadType": 102,
                "clockRate": 90000,
                "parameters": { "packetization-mode": 1 }
            }],
            "encodings": [{ "ssrc": 1111 }]
        }))
        .unwrap();

        let codec = params.primary_codec().unwrap();
        assert_eq!(codec.payload_type, 102);
        assert_eq!(format_parameter(&codec.parameters["packetization-mode"]), "1");
        assert_eq!(params.encodings[0].ssrc, Some(1111));
    }

    #[test]
    fn test_media_kind_parse() {
        assert_eq!("Video".parse::<MediaKind>().unwrap(), MediaKind::Video);
        assert!("data".parse::<MediaKind>().is_err());
    }
}
