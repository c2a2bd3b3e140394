use std::time::Duration;

pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;

const ICE_SERVERS_ENV: &str = "DRIFTWOOD_ICE_SERVERS";
const GATHER_TIMEOUT_ENV: &str = "DRIFTWOOD_GATHER_TIMEOUT_MS";

/// STUN/TURN server handed to the host transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.credential = credential.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Servers used for candidate discovery; empty means host candidates only.
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    /// Ceiling on the raw size of an outgoing image.
    pub max_image_bytes: usize,
    /// Upper bound on candidate gathering. `None` waits as long as the
    /// transport takes.
    pub gather_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::new("stun:stun.l.google.com:19302"),
                IceServer::new("stun:stun1.l.google.com:19302"),
            ],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            gather_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Defaults, overridden by `DRIFTWOOD_ICE_SERVERS` and
    /// `DRIFTWOOD_GATHER_TIMEOUT_MS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ICE_SERVERS_ENV) {
            config.ice_servers = parse_ice_servers(&raw);
        }
        if let Some(timeout) = std::env::var(GATHER_TIMEOUT_ENV)
            .ok()
            .and_then(|raw| parse_timeout_ms(&raw))
        {
            config.gather_timeout = Some(timeout);
        }
        config
    }

    /// No STUN/TURN servers; only host candidates are gathered.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = Some(timeout);
        self
    }

    pub fn with_max_image_bytes(mut self, max: usize) -> Self {
        self.max_image_bytes = max;
        self
    }

    /// Human readable image ceiling, e.g. `2MB`.
    pub fn image_limit_label(&self) -> String {
        const MIB: usize = 1024 * 1024;
        if self.max_image_bytes >= MIB && self.max_image_bytes % MIB == 0 {
            format!("{}MB", self.max_image_bytes / MIB)
        } else if self.max_image_bytes >= 1024 && self.max_image_bytes % 1024 == 0 {
            format!("{}KB", self.max_image_bytes / 1024)
        } else {
            format!("{} bytes", self.max_image_bytes)
        }
    }
}

/// Comma separated server urls; blank entries are skipped.
pub fn parse_ice_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServer::new)
        .collect()
}

fn parse_timeout_ms(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}
