//! Builds webrtc-rs peer transports for new sessions

use crate::peer::WebRtcPeerTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use voicemesh_core::transport::TransportEventSink;
use voicemesh_core::{IceConfig, LocalAudioTrack, PeerId, PeerTransport, TransportFactory};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Transport factory backed by a shared webrtc-rs API instance
pub struct WebRtcTransportFactory {
    api: API,
    ice: IceConfig,
}

impl WebRtcTransportFactory {
    /// Register default codecs and interceptors and keep the ICE servers
    pub fn new(ice: IceConfig) -> Result<Self> {
        ice.validate()?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        info!(
            "WebRTC transport factory ready: {} STUN, {} TURN server(s)",
            ice.stun_servers.len(),
            ice.turn_servers.len()
        );
        Ok(Self { api, ice })
    }

    pub fn ice_config(&self) -> &IceConfig {
        &self.ice
    }

    /// Peer connection configuration for the configured STUN/TURN servers
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.ice.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Create a transport with a concrete return type
    #[instrument(skip(self, local_track, events), fields(peer_id = %peer_id))]
    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        local_track: Option<LocalAudioTrack>,
        events: TransportEventSink,
    ) -> Result<WebRtcPeerTransport> {
        let peer_connection = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?;

        debug!("Peer connection created (epoch {})", events.epoch());
        WebRtcPeerTransport::attach(peer_id.clone(), Arc::new(peer_connection), local_track, events)
            .await
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        local_track: Option<LocalAudioTrack>,
        events: TransportEventSink,
    ) -> voicemesh_core::Result<Box<dyn PeerTransport>> {
        let transport = self.create_transport(peer_id, local_track, events).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voicemesh_core::config::TurnServerConfig;

    #[test]
    fn test_rtc_configuration_lists_every_server() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.org:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
        };
        let factory = WebRtcTransportFactory::new(ice).unwrap();
        let config = factory.rtc_configuration();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(config.ice_servers[1].username, "user");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_rejects_invalid_ice_config() {
        let ice = IceConfig {
            stun_servers: vec!["http://stun.example.org".to_string()],
            turn_servers: Vec::new(),
        };
        let err = WebRtcTransportFactory::new(ice).err().unwrap();
        assert!(err.is_config_error());
    }
}
