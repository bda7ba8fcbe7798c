//! Engine factory: builds a fresh connection engine per matched partner.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use super::connection::{ConnectionEngine, EngineError, RtcConnectionEngine};
use crate::ice::IceServerConfig;

/// Creates connection engines.
///
/// The session asks for a new engine on every match so that no listener or
/// transceiver state leaks from one partner to the next.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> BoxFuture<'_, Result<Box<dyn ConnectionEngine>, EngineError>>;
}

/// Builds webrtc-rs engines sharing one API instance
pub struct RtcEngineFactory {
    /// WebRTC API instance (shared across all engines)
    api: Arc<API>,
    /// ICE servers configuration
    ice_servers: Vec<IceServerConfig>,
}

impl RtcEngineFactory {
    /// Create a new factory.
    ///
    /// # Arguments
    /// * `ice_servers` - List of ICE (STUN/TURN) servers
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Result<Self, EngineError> {
        // Create media engine with the default audio/video codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Create(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            EngineError::Create(format!("Failed to register interceptors: {}", e))
        })?;

        // Build API
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    /// Build RTCConfiguration from ICE servers
    fn build_rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| s.to_rtc_ice_server())
                .collect(),
            ..Default::default()
        }
    }
}

impl EngineFactory for RtcEngineFactory {
    fn create(&self) -> BoxFuture<'_, Result<Box<dyn ConnectionEngine>, EngineError>> {
        async move {
            let engine = RtcConnectionEngine::new(&self.api, self.build_rtc_config()).await?;
            Ok(Box::new(engine) as Box<dyn ConnectionEngine>)
        }
        .boxed()
    }
}
