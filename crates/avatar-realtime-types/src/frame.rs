use base64::Engine;
use serde::{Deserialize, Serialize};

/// Largest decoded audio payload the service accepts in a single frame.
pub const MAX_AUDIO_FRAME_BYTES: usize = 1024;

/// Position of a frame or text fragment within its stream.
///
/// Serialized as the integer the service uses: `0` start, `1` middle, `2` end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FrameStatus {
    Start,
    Middle,
    End,
}

impl FrameStatus {
    /// Whether this status closes its stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameStatus::End)
    }
}

impl From<FrameStatus> for u8 {
    fn from(status: FrameStatus) -> Self {
        match status {
            FrameStatus::Start => 0,
            FrameStatus::Middle => 1,
            FrameStatus::End => 2,
        }
    }
}

impl TryFrom<u8> for FrameStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameStatus::Start),
            1 => Ok(FrameStatus::Middle),
            2 => Ok(FrameStatus::End),
            other => Err(format!("unknown frame status {other}")),
        }
    }
}

/// One protocol-legal slice of an audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame<'a> {
    pub seq: u32,
    pub status: FrameStatus,
    pub data: &'a [u8],
}

impl AudioFrame<'_> {
    /// Base64 transport encoding of the frame payload.
    pub fn encoded(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.data)
    }

    /// Decoded payload length, which is what the envelope reports as `frame_size`.
    pub fn frame_size(&self) -> usize {
        self.data.len()
    }
}

/// Splits `audio` into frames of at most `max_frame` bytes.
///
/// Sequence numbers start at 0. The frame that exhausts the buffer is tagged
/// `End`, which takes precedence over `Start`, so a single-frame buffer yields
/// one `End` frame. An empty buffer yields no frames.
pub fn frame_audio(audio: &[u8], max_frame: usize) -> Vec<AudioFrame<'_>> {
    let max_frame = max_frame.max(1);
    let total = audio.len();
    audio
        .chunks(max_frame)
        .enumerate()
        .map(|(index, data)| {
            let offset = index * max_frame;
            let status = if offset + data.len() >= total {
                FrameStatus::End
            } else if index == 0 {
                FrameStatus::Start
            } else {
                FrameStatus::Middle
            };
            AudioFrame {
                seq: index as u32,
                status,
                data,
            }
        })
        .collect()
}
