use anyhow::Result;
use clap::Args;
use peer::{IceServer, MediaConstraints, PeerConfig};
use signal::MqttConfig;
use std::time::Duration;

#[derive(Args, Debug, Clone)]
pub struct MqttArgs {
    /// MQTT broker URL (mqtt://host:port)
    #[arg(short, long, default_value = "mqtt://localhost:1883")]
    pub mqtt_broker: String,

    /// MQTT username, Optional
    #[arg(long)]
    pub mqtt_username: Option<String>,

    /// MQTT password, Optional
    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Call room shared with the peer
    #[arg(long, default_value = "lobby")]
    pub room: String,

    /// Delay between reconnection attempts (seconds)
    #[arg(long, default_value = "2")]
    pub reconnect_delay: u64,
}

impl MqttArgs {
    pub fn to_config(&self) -> Result<MqttConfig> {
        let url = self.mqtt_broker.trim();
        let without_proto = url
            .strip_prefix("mqtt://")
            .ok_or_else(|| anyhow::anyhow!("Broker URL must start with mqtt://"))?;

        let (host, port) = match without_proto.split_once(':') {
            Some((host, port)) => (host, port.parse()?),
            None => (without_proto, 1883),
        };
        if host.is_empty() {
            anyhow::bail!("Invalid broker URL: {}", url);
        }
        if self.room.is_empty() || self.room.contains(['/', '+', '#']) {
            anyhow::bail!("Invalid room name: {:?}", self.room);
        }

        Ok(MqttConfig {
            broker_host: host.to_string(),
            broker_port: port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            room: self.room.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            ..Default::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// STUN server URLs (e.g., stun:stun1.l.google.com:19302), can specify multiple
    #[arg(long, default_values_t = vec![
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ])]
    pub peer_stun: Vec<String>,

    /// TURN server URLs (e.g., turn:user:pass@host:port), can specify multiple
    #[arg(long)]
    pub peer_turn: Vec<String>,

    /// Number of ICE candidates gathered ahead of negotiation
    #[arg(long, default_value = "10")]
    pub ice_pool_size: u8,

    /// Timeout for WebRTC connection (seconds)
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,
}

impl PeerArgs {
    pub fn to_config(&self) -> PeerConfig {
        let mut ice_servers: Vec<IceServer> =
            self.peer_stun.iter().map(|s| IceServer::stun(s)).collect();

        for turn_url in &self.peer_turn {
            if let Some(server) = Self::parse_turn_url(turn_url) {
                ice_servers.push(server);
            }
        }

        PeerConfig {
            ice_servers,
            ice_candidate_pool_size: self.ice_pool_size,
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    /// Parse TURN URL: turn:user:pass@host:port or turn:host:port
    fn parse_turn_url(url: &str) -> Option<IceServer> {
        let url = url.strip_prefix("turn:").unwrap_or(url);
        if url.is_empty() {
            return None;
        }

        if let Some((credentials, host)) = url.rsplit_once('@') {
            let (user, pass) = credentials.split_once(':').unwrap_or((credentials, ""));
            Some(IceServer::turn(&format!("turn:{}", host), user, pass))
        } else {
            Some(IceServer::turn(&format!("turn:{}", url), "", ""))
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CallArgs {
    /// Local participant ID for signaling
    #[arg(short, long)]
    pub local_id: String,

    /// Send audio only
    #[arg(long)]
    pub audio_only: bool,

    /// Start with the rear camera
    #[arg(long)]
    pub rear_camera: bool,
}

impl CallArgs {
    pub fn to_constraints(&self) -> MediaConstraints {
        let mut constraints = MediaConstraints { video: !self.audio_only, ..Default::default() };
        if self.rear_camera {
            constraints.facing = constraints.facing.opposite();
        }
        constraints
    }
}

pub fn init_runtime() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webrtc=off,webrtc_sctp=off,turn=error".into()),
        )
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls CryptoProvider already installed");
    }
}
