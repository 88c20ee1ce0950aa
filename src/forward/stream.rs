//! SSE framing for the two keepalive/error conventions this gateway's
//! upstreams use: Anthropic's named `ping` event, and the bare `: ping`
//! comment line the Gemini-derived and Sora wire formats expect instead.
//! Both conventions carry a mid-stream failure as a named `error` event so
//! a client already consuming an open stream sees it the same way its
//! vendor SDK would, rather than as a dropped connection.

use crate::domain::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Anthropic,
    Comment,
}

impl StreamProtocol {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Anthropic => StreamProtocol::Anthropic,
            _ => StreamProtocol::Comment,
        }
    }

    pub fn keepalive_frame(&self) -> Vec<u8> {
        match self {
            StreamProtocol::Anthropic => b"event: ping\ndata: {}\n\n".to_vec(),
            StreamProtocol::Comment => b": ping\n\n".to_vec(),
        }
    }

    /// A mid-stream failure frame. Left status-code-free by design: once
    /// any byte of the response has gone out the HTTP status is already
    /// committed at 200, so the failure can only be signalled in-band.
    pub fn error_frame(&self, error_type: &str, message: &str) -> Vec<u8> {
        let payload = serde_json::json!({
            "type": "error",
            "error": { "type": error_type, "message": message },
        });
        format!("event: error\ndata: {payload}\n\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_keepalive_is_a_named_ping_event() {
        let frame = StreamProtocol::Anthropic.keepalive_frame();
        assert!(String::from_utf8(frame).unwrap().starts_with("event: ping"));
    }

    #[test]
    fn other_platforms_use_a_bare_comment_ping() {
        let frame = StreamProtocol::Comment.keepalive_frame();
        assert_eq!(frame, b": ping\n\n");
    }

    #[test]
    fn for_platform_maps_anthropic_only_to_the_named_protocol() {
        assert_eq!(StreamProtocol::for_platform(Platform::Anthropic), StreamProtocol::Anthropic);
        assert_eq!(StreamProtocol::for_platform(Platform::Gemini), StreamProtocol::Comment);
        assert_eq!(StreamProtocol::for_platform(Platform::Antigravity), StreamProtocol::Comment);
        assert_eq!(StreamProtocol::for_platform(Platform::Sora), StreamProtocol::Comment);
    }

    #[test]
    fn error_frame_carries_the_vendor_error_envelope() {
        let frame = StreamProtocol::Anthropic.error_frame("upstream_error", "boom");
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with("event: error\ndata:"));
        assert!(text.contains("upstream_error"));
        assert!(text.contains("boom"));
    }
}
