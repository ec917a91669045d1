use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder},
    interceptor::registry::Registry,
    peer_connection::RTCPeerConnection,
    rtp_transceiver::rtp_codec::RTPCodecType,
};

use crate::{
    config::{CodecConfig, WebRTCTransportConfig},
    error::Error,
};

/// Registers the configured codecs, falling back to the platform defaults when none are configured.
pub(crate) fn register_codecs(me: &mut MediaEngine, codec: &CodecConfig) -> Result<(), Error> {
    if codec.audio.is_empty() && codec.video.is_empty() {
        me.register_default_codecs()?;
        return Ok(());
    }

    for codec in codec.audio.iter() {
        me.register_codec(codec.clone(), RTPCodecType::Audio)?;
    }

    for codec in codec.video.iter() {
        me.register_codec(codec.clone(), RTPCodecType::Video)?;
    }

    Ok(())
}

/// Builds one media-transport connection. Every connection gets its own engine and interceptor chain.
pub(crate) async fn new_peer_connection(
    transport_config: &WebRTCTransportConfig,
    codec: &CodecConfig,
) -> Result<RTCPeerConnection, Error> {
    let mut me = MediaEngine::default();
    register_codecs(&mut me, codec)?;

    let registry = register_default_interceptors(Registry::new(), &mut me)?;

    let api = APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(registry)
        .with_setting_engine(transport_config.setting_engine()?)
        .build();

    let peer_connection = api
        .new_peer_connection(transport_config.configuration())
        .await?;

    Ok(peer_connection)
}
