//! Session descriptor handed to the decoder.
//!
//! One `m=` section per recorded track, each pointing at the port pair the
//! media engine sends that track to:
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 127.0.0.1
//! s=camcast recording cam-1
//! c=IN IP4 127.0.0.1
//! t=0 0
//! m=audio 20000 RTP/AVP 100
//! a=rtcp:20001
//! a=rtpmap:100 opus/48000/2
//! a=recvonly
//! m=video 20002 RTP/AVP 101
//! a=rtcp:20003
//! a=rtpmap:101 VP8/90000
//! a=recvonly
//! ```

use std::net::IpAddr;

use crate::types::{format_parameter, MediaKind, RtpCodecParameters};

/// One recorded track as the decoder sees it
#[derive(Debug, Clone)]
pub struct SdpTrack<'a> {
    pub kind: MediaKind,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub codec: &'a RtpCodecParameters,
}

pub fn generate_sdp(host: IpAddr, session_name: &str, tracks: &[SdpTrack<'_>]) -> String {
    let family = if host.is_ipv4() { "IP4" } else { "IP6" };
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN {family} {host}"));
    sdp.push(format!("s={session_name}"));
    sdp.push(format!("c=IN {family} {host}"));
    sdp.push("t=0 0".to_string());

    for track in tracks {
        let codec = track.codec;
        let pt = codec.payload_type;

        sdp.push(format!("m={} {} RTP/AVP {pt}", track.kind, track.rtp_port));
        sdp.push(format!("a=rtcp:{}", track.rtcp_port));
        match codec.channels {
            Some(channels) if track.kind == MediaKind::Audio => sdp.push(format!(
                "a=rtpmap:{pt} {}/{}/{channels}",
                codec.codec_name(),
                codec.clock_rate
            )),
            _ => sdp.push(format!(
                "a=rtpmap:{pt} {}/{}",
                codec.codec_name(),
                codec.clock_rate
            )),
        }
        if !codec.parameters.is_empty() {
            let fmtp: Vec<String> = codec
                .parameters
                .iter()
                .map(|(key, value)| format!("{key}={}", format_parameter(value)))
                .collect();
            sdp.push(format!("a=fmtp:{pt} {}", fmtp.join(";")));
        }
        sdp.push("a=recvonly".to_string());
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
