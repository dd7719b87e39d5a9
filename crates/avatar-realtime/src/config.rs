use avatar_realtime_types::{AudioFormat, AvatarParameter};
use secrecy::SecretString;
use std::time::Duration;

pub const DEFAULT_SERVICE_URL: &str = "wss://avatar.cn-huadong-1.xf-yun.com/v1/interact";
pub const DEFAULT_PLAY_API_URL: &str = "https://rtc-api.xf-yun.com/v1/rtc/play/";

/// Everything a session needs to reach and drive the avatar service.
#[derive(Debug)]
pub struct AvatarConfig {
    /// Websocket endpoint, before request signing.
    pub service_url: String,
    pub app_id: String,
    pub api_key: SecretString,
    pub api_secret: SecretString,
    /// Voice used for synthesized speech.
    pub vcn: String,
    pub avatar: AvatarParameter,
    pub audio_format: AudioFormat,
    /// Signalling endpoint handed to players together with the stream URL.
    pub play_api_url: String,
    /// How long `start_session` waits for the stream URL.
    pub ready_timeout: Duration,
    /// Idle time after which the sender loop emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Pause after each audio frame to stay under the upstream rate limit.
    pub audio_frame_interval: Duration,
    /// How long unflushed turns of a closed session are kept.
    pub cache_ttl: Duration,
}

impl AvatarConfig {
    pub fn new(
        service_url: impl Into<String>,
        app_id: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        avatar_id: impl Into<String>,
        vcn: impl Into<String>,
    ) -> Self {
        Self {
            service_url: service_url.into(),
            app_id: app_id.into(),
            api_key: SecretString::from(api_key.into()),
            api_secret: SecretString::from(api_secret.into()),
            vcn: vcn.into(),
            avatar: AvatarParameter::new(avatar_id),
            audio_format: AudioFormat::default(),
            play_api_url: DEFAULT_PLAY_API_URL.to_string(),
            ready_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            queue_capacity: 100,
            audio_frame_interval: Duration::from_millis(40),
            cache_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_audio_frame_interval(mut self, interval: Duration) -> Self {
        self.audio_frame_interval = interval;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}
