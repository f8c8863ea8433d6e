//! JSON shapes of the control port

use serde::{Deserialize, Serialize};

use crate::registry::{BroadcastStatus, Device};
use crate::session::state::BroadcastErrorCode;

/// One `GET /streams` entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub port: u16,
    pub name: String,
    /// Camera index, as a string
    pub index: String,
    pub is_recording_active: bool,
    pub video_id: String,
    pub recording_duration_sec: i64,
    /// Empty when the last recording request succeeded
    pub last_recording_error_code: String,
    #[serde(rename = "type")]
    pub device_type: u8,
    pub outer_streams: Vec<OuterStreamInfo>,
}

impl StreamInfo {
    pub async fn from_device(device: &Device) -> Self {
        let recording = device.recording_status().await;
        let outer_streams = device
            .broadcast_status()
            .await
            .iter()
            .map(OuterStreamInfo::from)
            .collect();
        Self {
            port: device.port(),
            name: device.name().to_string(),
            index: device.descriptor().index.to_string(),
            is_recording_active: recording.active,
            video_id: recording.video_id,
            recording_duration_sec: recording.duration_ms / 1000,
            last_recording_error_code: recording
                .last_error
                .map(|code| code.code().to_string())
                .unwrap_or_default(),
            device_type: device.device_type().into(),
            outer_streams,
        }
    }
}

/// Broadcast destination inside a [`StreamInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OuterStreamInfo {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u8>,
    pub state: u8,
}

impl From<&BroadcastStatus> for OuterStreamInfo {
    fn from(status: &BroadcastStatus) -> Self {
        Self {
            url: status.url.clone(),
            kind: status.kind.as_str().to_string(),
            error_code: (status.error != BroadcastErrorCode::None).then(|| status.error.code()),
            state: status.state as u8,
        }
    }
}

/// `PUT /stream` body. Missing fields take their defaults, so a request
/// without `port` targets no device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SetStreamRequest {
    pub port: u16,
    pub is_recording_active: bool,
    pub video_id: String,
}

/// `POST /outerstream` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OuterStreamRequest {
    pub port: u16,
    /// `None` when absent or not an array
    #[serde(deserialize_with = "array_or_none")]
    pub streams: Option<Vec<OuterStreamEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OuterStreamEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub is_active: bool,
}

fn array_or_none<'de, D>(deserializer: D) -> Result<Option<Vec<OuterStreamEntry>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// `GET /video/<id>` response; `null` while the video is being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoInfo {
    pub duration: Option<i64>,
}

/// Parse a request body, treating anything unparsable as an empty object
/// the same way missing fields are treated
pub fn parse_lenient<T>(body: &[u8]) -> T
where
    T: for<'de> Deserialize<'de> + Default,
{
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unparsable request body");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionState;
    use crate::session::OuterStreamKind;

    #[test]
    fn test_outer_stream_info_omits_none_error() {
        let mut status = BroadcastStatus {
            kind: OuterStreamKind::Ustream,
            url: "rtmp://example/live".into(),
            state: SessionState::Disabled,
            error: BroadcastErrorCode::None,
        };
        let json = serde_json::to_string(&OuterStreamInfo::from(&status)).unwrap();
        assert_eq!(json, r#"{"url":"rtmp://example/live","type":"ustream","state":1}"#);

        status.state = SessionState::Error;
        status.error = BroadcastErrorCode::Url;
        let json = serde_json::to_string(&OuterStreamInfo::from(&status)).unwrap();
        assert_eq!(
            json,
            r#"{"url":"rtmp://example/live","type":"ustream","error_code":5,"state":4}"#
        );
    }

    #[test]
    fn test_lenient_request_parsing() {
        let req: SetStreamRequest =
            parse_lenient(br#"{"port": 8081, "is_recording_active": true, "video_id": "a"}"#);
        assert_eq!(req.port, 8081);
        assert!(req.is_recording_active);

        let req: SetStreamRequest = parse_lenient(b"not json");
        assert_eq!(req, SetStreamRequest::default());

        let req: OuterStreamRequest =
            parse_lenient(br#"{"port": 8081, "streams": [{"type": "ustream", "url": "rtmp://x"}]}"#);
        let streams = req.streams.unwrap();
        assert_eq!(streams[0].kind, "ustream");
        assert!(!streams[0].is_active);

        let req: OuterStreamRequest = parse_lenient(br#"{"port": 8081, "streams": "none"}"#);
        assert!(req.streams.is_none());
        let req: OuterStreamRequest = parse_lenient(br#"{"port": 8081}"#);
        assert!(req.streams.is_none());
    }
}
