//! Wire types for the avatar interaction service.
//!
//! This crate is pure data: the audio framing rules and the JSON envelopes
//! exchanged with the remote service. It performs no I/O.

pub mod envelope;
pub mod frame;

pub use envelope::{
    AudioFormat, AvatarEventType, AvatarParameter, ClientMessage, DecodeError, Fragment,
    InboundEnvelope, InboundEvent, StreamParameter, decode,
};
pub use frame::{AudioFrame, FrameStatus, MAX_AUDIO_FRAME_BYTES, frame_audio};
