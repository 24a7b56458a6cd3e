use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub static RTC_API: Lazy<Arc<API>> = Lazy::new(|| {
    trace!("Initializing RTC API");
    let registry = Registry::new();
    let mut m = MediaEngine::default();
    if let Err(e) = m.register_default_codecs() {
        error!("Failed to register default codecs: {}", e);
    }

    match register_default_interceptors(registry, &mut m) {
        Ok(registry) => {
            let api =
                APIBuilder::new().with_media_engine(m).with_interceptor_registry(registry).build();
            Arc::new(api)
        }
        Err(e) => {
            error!("Failed to register default interceptors: {}", e);
            let registry = Registry::new();
            let api =
                APIBuilder::new().with_media_engine(m).with_interceptor_registry(registry).build();
            Arc::new(api)
        }
    }
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self { urls: vec![url.to_string()], username: None, credential: None }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    /// Longest a session may stay in `Negotiating` before it is failed.
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            ice_candidate_pool_size: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PeerConfig {
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}
