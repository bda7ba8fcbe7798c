//! Session descriptions exchanged during offer/answer negotiation.

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Which half of an offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// An immutable SDP offer or answer.
///
/// Serializes the same way a browser `RTCSessionDescriptionInit` does:
/// `{"type": "offer", "sdp": "v=0..."}`. Renegotiation produces a new
/// descriptor; existing ones are never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
}

impl SessionDescriptor {
    /// Create an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }

    /// Convert to a webrtc-rs description, parsing the SDP.
    pub(crate) fn to_rtc(&self) -> Result<RTCSessionDescription, String> {
        let parsed = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        };
        parsed.map_err(|e| format!("Invalid {} SDP: {}", self.kind.as_str(), e))
    }

    /// Convert from a webrtc-rs description. Only offers and answers map.
    pub(crate) fn from_rtc(desc: &RTCSessionDescription) -> Result<Self, String> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(Self::offer(desc.sdp.clone())),
            RTCSdpType::Answer => Ok(Self::answer(desc.sdp.clone())),
            other => Err(format!("Unsupported SDP type: {}", other)),
        }
    }
}
