//! Control/data envelopes exchanged with the avatar service.
//!
//! Every message on the wire is `{header, parameter, payload}`. Outbound
//! messages are modelled as one enum variant per control verb; inbound
//! messages are decoded into [`InboundEnvelope`] and then flattened into
//! [`InboundEvent`]s for exhaustive dispatch.

use crate::frame::{AudioFrame, FrameStatus};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Raised when an inbound frame cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Video stream settings requested in the `start` handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamParameter {
    pub protocol: String,
    pub fps: u32,
    pub bitrate: u32,
    pub alpha: u8,
}

impl Default for StreamParameter {
    fn default() -> Self {
        Self {
            protocol: "webrtc".to_string(),
            fps: 25,
            bitrate: 5000,
            alpha: 0,
        }
    }
}

/// Avatar identity and rendering settings for the `start` handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvatarParameter {
    pub stream: StreamParameter,
    pub avatar_id: String,
    pub width: u32,
    pub height: u32,
}

impl AvatarParameter {
    pub fn new(avatar_id: impl Into<String>) -> Self {
        Self {
            stream: StreamParameter::default(),
            avatar_id: avatar_id.into(),
            width: 720,
            height: 1280,
        }
    }
}

/// PCM format announced with every audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: "raw".to_string(),
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Messages sent from this process to the avatar service.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Opens the avatar stream. Sent once, right after the socket opens.
    Start {
        request_id: String,
        vcn: String,
        avatar: AvatarParameter,
    },
    /// Keep-alive, answered by a `pong` avatar event.
    Ping { request_id: String },
    /// Text the avatar should answer through its own dialogue engine.
    TextInteract {
        request_id: String,
        vcn: String,
        content: String,
    },
    /// Text the avatar should speak verbatim.
    TextDriver {
        request_id: String,
        vcn: String,
        content: String,
    },
    /// One frame of microphone audio.
    AudioInteract {
        request_id: String,
        format: AudioFormat,
        status: FrameStatus,
        seq: u32,
        frame_size: usize,
        audio: String,
    },
}

impl ClientMessage {
    /// Builds the audio message for one frame of a framed buffer.
    pub fn audio(request_id: &str, format: &AudioFormat, frame: &AudioFrame<'_>) -> Self {
        ClientMessage::AudioInteract {
            request_id: request_id.to_string(),
            format: format.clone(),
            status: frame.status,
            seq: frame.seq,
            frame_size: frame.frame_size(),
            audio: frame.encoded(),
        }
    }

    /// The control verb carried in the header.
    pub fn ctrl(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. } => "start",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::TextInteract { .. } => "text_interact",
            ClientMessage::TextDriver { .. } => "text_driver",
            ClientMessage::AudioInteract { .. } => "audio_interact",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            ClientMessage::Start { request_id, .. }
            | ClientMessage::Ping { request_id }
            | ClientMessage::TextInteract { request_id, .. }
            | ClientMessage::TextDriver { request_id, .. }
            | ClientMessage::AudioInteract { request_id, .. } => request_id,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, ClientMessage::AudioInteract { .. })
    }

    /// Serializes the message into its wire text.
    pub fn encode(&self, app_id: &str) -> Result<String, serde_json::Error> {
        let header = wire::Header {
            app_id,
            request_id: self.request_id(),
            ctrl: self.ctrl(),
        };
        match self {
            ClientMessage::Start { vcn, avatar, .. } => serde_json::to_string(&wire::Envelope {
                header,
                parameter: Some(wire::StartParameter {
                    tts: wire::Tts { vcn },
                    avatar,
                }),
                payload: None::<()>,
            }),
            ClientMessage::Ping { .. } => serde_json::to_string(&wire::Envelope::<(), ()> {
                header,
                parameter: None,
                payload: None,
            }),
            ClientMessage::TextInteract { vcn, content, .. } => {
                serde_json::to_string(&wire::Envelope {
                    header,
                    parameter: Some(wire::TextInteractParameter {
                        tts: wire::Tts { vcn },
                        air: wire::Air { air: 1 },
                    }),
                    payload: Some(wire::TextPayload {
                        text: wire::Text { content },
                    }),
                })
            }
            ClientMessage::TextDriver { vcn, content, .. } => {
                serde_json::to_string(&wire::Envelope {
                    header,
                    parameter: Some(wire::TextDriverParameter {
                        tts: wire::Tts { vcn },
                        avatar_dispatch: wire::AvatarDispatch {
                            interactive_mode: 0,
                        },
                    }),
                    payload: Some(wire::TextPayload {
                        text: wire::Text { content },
                    }),
                })
            }
            ClientMessage::AudioInteract {
                format,
                status,
                seq,
                frame_size,
                audio,
                ..
            } => serde_json::to_string(&wire::Envelope {
                header,
                parameter: Some(wire::AudioParameter {
                    asr: wire::Asr { full_duplex: 0 },
                }),
                payload: Some(wire::AudioPayload {
                    audio: wire::Audio {
                        encoding: &format.encoding,
                        sample_rate: format.sample_rate,
                        channels: format.channels,
                        bit_depth: format.bit_depth,
                        status: *status,
                        seq: *seq,
                        frame_size: *frame_size,
                        audio,
                    },
                }),
            }),
        }
    }
}

// Borrowed serialization shapes for outbound envelopes.
mod wire {
    use super::{AvatarParameter, FrameStatus};
    use serde::Serialize;

    #[derive(Serialize)]
    pub(super) struct Envelope<'a, P, L> {
        pub header: Header<'a>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub parameter: Option<P>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub payload: Option<L>,
    }

    #[derive(Serialize)]
    pub(super) struct Header<'a> {
        pub app_id: &'a str,
        pub request_id: &'a str,
        pub ctrl: &'a str,
    }

    #[derive(Serialize)]
    pub(super) struct Tts<'a> {
        pub vcn: &'a str,
    }

    #[derive(Serialize)]
    pub(super) struct StartParameter<'a> {
        pub tts: Tts<'a>,
        pub avatar: &'a AvatarParameter,
    }

    #[derive(Serialize)]
    pub(super) struct Air {
        pub air: u8,
    }

    #[derive(Serialize)]
    pub(super) struct TextInteractParameter<'a> {
        pub tts: Tts<'a>,
        pub air: Air,
    }

    #[derive(Serialize)]
    pub(super) struct AvatarDispatch {
        pub interactive_mode: u8,
    }

    #[derive(Serialize)]
    pub(super) struct TextDriverParameter<'a> {
        pub tts: Tts<'a>,
        pub avatar_dispatch: AvatarDispatch,
    }

    #[derive(Serialize)]
    pub(super) struct Text<'a> {
        pub content: &'a str,
    }

    #[derive(Serialize)]
    pub(super) struct TextPayload<'a> {
        pub text: Text<'a>,
    }

    #[derive(Serialize)]
    pub(super) struct Asr {
        pub full_duplex: u8,
    }

    #[derive(Serialize)]
    pub(super) struct AudioParameter {
        pub asr: Asr,
    }

    #[derive(Serialize)]
    pub(super) struct Audio<'a> {
        pub encoding: &'a str,
        pub sample_rate: u32,
        pub channels: u16,
        pub bit_depth: u16,
        pub status: FrameStatus,
        pub seq: u32,
        pub frame_size: usize,
        pub audio: &'a str,
    }

    #[derive(Serialize)]
    pub(super) struct AudioPayload<'a> {
        pub audio: Audio<'a>,
    }
}

/// A decoded message from the avatar service.
///
/// Only the header is decoded eagerly. Payload blocks stay raw until
/// [`InboundEnvelope::into_events`] so that one malformed block cannot hide
/// the header code or the blocks next to it.
#[derive(Deserialize, Debug, Clone)]
pub struct InboundEnvelope {
    pub header: InboundHeader,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct InboundHeader {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AvatarEvent {
    pub event_type: AvatarEventType,
    #[serde(default)]
    pub stream_url: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AvatarEventType {
    StreamInfo,
    Stop,
    Pong,
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TextBlock {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: FrameStatus,
}

/// One piece of streamed text, keyed by the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub request_id: String,
    pub text: String,
    pub status: FrameStatus,
}

/// What an inbound envelope means to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The header carried a nonzero code.
    RemoteError { code: i64, message: String },
    /// The avatar stream is up.
    StreamInfo { stream_url: Option<String> },
    /// The service ended the avatar session.
    AvatarStopped,
    /// Heartbeat reply.
    Pong,
    /// A piece of the avatar's reply.
    Reply(Fragment),
    /// A piece of the recognized user utterance.
    Utterance(Fragment),
    /// An avatar event this layer does not act on.
    Ignored,
    /// A payload block that failed to decode; its siblings are still delivered.
    Skipped { block: &'static str, reason: String },
}

impl InboundEnvelope {
    /// Flattens the envelope into the events it carries, in dispatch order.
    ///
    /// A nonzero header code short-circuits everything else.
    pub fn into_events(self) -> Vec<InboundEvent> {
        if self.header.code != 0 {
            return vec![InboundEvent::RemoteError {
                code: self.header.code,
                message: self.header.message.unwrap_or_default(),
            }];
        }
        let Some(mut payload) = self.payload else {
            return Vec::new();
        };
        let header_request_id = self.header.request_id.unwrap_or_default();
        let fragment = |block: TextBlock| Fragment {
            request_id: block
                .request_id
                .unwrap_or_else(|| header_request_id.clone()),
            text: block.text,
            status: block.status,
        };

        let mut events = Vec::new();
        if let Some(avatar) = take_block::<AvatarEvent>(&mut payload, "avatar", &mut events) {
            events.push(match avatar.event_type {
                AvatarEventType::StreamInfo => InboundEvent::StreamInfo {
                    stream_url: avatar.stream_url,
                },
                AvatarEventType::Stop => InboundEvent::AvatarStopped,
                AvatarEventType::Pong => InboundEvent::Pong,
                AvatarEventType::Other => InboundEvent::Ignored,
            });
        }
        if let Some(asr) = take_block::<TextBlock>(&mut payload, "asr", &mut events) {
            events.push(InboundEvent::Utterance(fragment(asr)));
        }
        if let Some(nlp) = take_block::<TextBlock>(&mut payload, "nlp", &mut events) {
            events.push(InboundEvent::Reply(fragment(nlp)));
        }
        events
    }
}

/// Pulls one named block out of the payload and decodes it, recording a
/// [`InboundEvent::Skipped`] when it does not fit its type.
fn take_block<T: DeserializeOwned>(
    payload: &mut Value,
    block: &'static str,
    events: &mut Vec<InboundEvent>,
) -> Option<T> {
    let raw = payload.get_mut(block).map(Value::take)?;
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value(raw) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            events.push(InboundEvent::Skipped {
                block,
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Decodes one inbound text frame.
pub fn decode(text: &str) -> Result<InboundEnvelope, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MAX_AUDIO_FRAME_BYTES, frame_audio};
    use serde_json::{Value, json};

    fn encoded(msg: &ClientMessage) -> Value {
        serde_json::from_str(&msg.encode("app-1").unwrap()).unwrap()
    }

    #[test]
    fn test_start_envelope_shape() {
        let msg = ClientMessage::Start {
            request_id: "r-1".into(),
            vcn: "x4_lingxiaoxuan".into(),
            avatar: AvatarParameter::new("avatar-7"),
        };
        let value = encoded(&msg);

        assert_eq!(
            value["header"],
            json!({"app_id": "app-1", "request_id": "r-1", "ctrl": "start"})
        );
        assert_eq!(value["parameter"]["tts"]["vcn"], "x4_lingxiaoxuan");
        assert_eq!(value["parameter"]["avatar"]["avatar_id"], "avatar-7");
        assert_eq!(value["parameter"]["avatar"]["stream"]["protocol"], "webrtc");
        assert_eq!(value["parameter"]["avatar"]["width"], 720);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_ping_has_header_only() {
        let value = encoded(&ClientMessage::Ping {
            request_id: "p".into(),
        });
        assert_eq!(value["header"]["ctrl"], "ping");
        assert!(value.get("parameter").is_none());
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_text_envelopes() {
        let interact = encoded(&ClientMessage::TextInteract {
            request_id: "t".into(),
            vcn: "v".into(),
            content: "hello".into(),
        });
        assert_eq!(interact["header"]["ctrl"], "text_interact");
        assert_eq!(interact["parameter"]["air"]["air"], 1);
        assert_eq!(interact["payload"]["text"]["content"], "hello");

        let driver = encoded(&ClientMessage::TextDriver {
            request_id: "d".into(),
            vcn: "v".into(),
            content: "say this".into(),
        });
        assert_eq!(driver["header"]["ctrl"], "text_driver");
        assert_eq!(
            driver["parameter"]["avatar_dispatch"]["interactive_mode"],
            0
        );
        assert_eq!(driver["payload"]["text"]["content"], "say this");
    }

    #[test]
    fn test_audio_envelope_reports_decoded_size() {
        let audio = vec![7u8; 1500];
        let frames = frame_audio(&audio, MAX_AUDIO_FRAME_BYTES);
        let format = AudioFormat::default();
        let last = encoded(&ClientMessage::audio("req", &format, &frames[1]));

        assert_eq!(last["header"]["ctrl"], "audio_interact");
        assert_eq!(last["parameter"]["asr"]["full_duplex"], 0);
        let body = &last["payload"]["audio"];
        assert_eq!(body["status"], 2);
        assert_eq!(body["seq"], 1);
        assert_eq!(body["frame_size"], 476);
        assert_eq!(body["sample_rate"], 16000);
        assert_eq!(body["encoding"], "raw");
        assert_eq!(body["audio"].as_str().unwrap(), frames[1].encoded());
    }

    #[test]
    fn test_nonzero_code_is_remote_error() {
        let env = decode(
            r#"{"header":{"code":10110,"message":"invalid app","sid":"s"},
                "payload":{"avatar":{"event_type":"stream_info","stream_url":"x"}}}"#,
        )
        .unwrap();
        assert_eq!(
            env.into_events(),
            vec![InboundEvent::RemoteError {
                code: 10110,
                message: "invalid app".into()
            }]
        );
    }

    #[test]
    fn test_avatar_events() {
        let info = decode(
            r#"{"header":{"code":0},"payload":{"avatar":{"event_type":"stream_info","stream_url":"xrtc://play/1"}}}"#,
        )
        .unwrap();
        assert_eq!(
            info.into_events(),
            vec![InboundEvent::StreamInfo {
                stream_url: Some("xrtc://play/1".into())
            }]
        );

        let stop = decode(r#"{"header":{},"payload":{"avatar":{"event_type":"stop"}}}"#).unwrap();
        assert_eq!(stop.into_events(), vec![InboundEvent::AvatarStopped]);

        let pong = decode(r#"{"header":{},"payload":{"avatar":{"event_type":"pong"}}}"#).unwrap();
        assert_eq!(pong.into_events(), vec![InboundEvent::Pong]);

        let other =
            decode(r#"{"header":{},"payload":{"avatar":{"event_type":"action_start"}}}"#).unwrap();
        assert_eq!(other.into_events(), vec![InboundEvent::Ignored]);
    }

    #[test]
    fn test_text_fragments_fall_back_to_header_request_id() {
        let env = decode(
            r#"{"header":{"code":0,"request_id":"hdr"},
                "payload":{"asr":{"text":"I am","status":0},
                           "nlp":{"text":"Hi","request_id":"own","status":2}}}"#,
        )
        .unwrap();
        assert_eq!(
            env.into_events(),
            vec![
                InboundEvent::Utterance(Fragment {
                    request_id: "hdr".into(),
                    text: "I am".into(),
                    status: FrameStatus::Start,
                }),
                InboundEvent::Reply(Fragment {
                    request_id: "own".into(),
                    text: "Hi".into(),
                    status: FrameStatus::End,
                }),
            ]
        );
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"payload":{}}"#).is_err());
        assert!(decode(r#"{"header":{"code":"oops"}}"#).is_err());
    }

    #[test]
    fn test_bad_block_is_skipped_without_losing_siblings() {
        let env = decode(
            r#"{"header":{"code":0,"request_id":"q"},
                "payload":{"avatar":{"event_type":"stream_info","stream_url":"xrtc://s"},
                           "nlp":{"text":"x"}}}"#,
        )
        .unwrap();
        let events = env.into_events();

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            InboundEvent::StreamInfo {
                stream_url: Some("xrtc://s".into())
            }
        );
        assert!(matches!(events[1], InboundEvent::Skipped { block: "nlp", .. }));
    }

    #[test]
    fn test_unknown_status_is_skipped() {
        let env =
            decode(r#"{"header":{},"payload":{"nlp":{"text":"x","status":9}}}"#).unwrap();
        let events = env.into_events();
        assert!(matches!(
            events.as_slice(),
            [InboundEvent::Skipped { block: "nlp", .. }]
        ));
    }

    #[test]
    fn test_nonzero_code_wins_over_bad_blocks() {
        let env = decode(
            r#"{"header":{"code":10110,"message":"license limit"},
                "payload":{"avatar":{"stream_url":"x"},"nlp":{"text":"x","status":5}}}"#,
        )
        .unwrap();
        assert_eq!(
            env.into_events(),
            vec![InboundEvent::RemoteError {
                code: 10110,
                message: "license limit".into()
            }]
        );
    }

    #[test]
    fn test_header_only_message_has_no_events() {
        let env = decode(r#"{"header":{"code":0,"sid":"abc"}}"#).unwrap();
        assert!(env.into_events().is_empty());
    }
}
