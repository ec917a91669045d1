use std::{sync::Arc, time::Duration};

use derivative::Derivative;
use tokio_util::sync::CancellationToken;
use webrtc::{
    peer_connection::RTCPeerConnection,
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp_transceiver::{rtp_codec::RTPCodecType, rtp_sender::RTCRtpSender},
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

/// A track received from one peer and re-sent to every other peer of the room.
///
/// Dropping the track from a room calls [`ForwardedTrack::stop`], which ends the
/// RTP relay, the keyframe requests and every RTCP drain loop bound to it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ForwardedTrack {
    pub id: String,
    pub stream_id: String,
    /// Peer that published the track.
    pub owner_id: String,
    pub kind: RTPCodecType,
    #[derivative(Debug = "ignore")]
    local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
}

impl ForwardedTrack {
    pub fn new(owner_id: String, local_track: Arc<TrackLocalStaticRTP>) -> Self {
        let kind = local_track.kind();
        Self {
            id: local_track.id().to_string(),
            stream_id: local_track.stream_id().to_string(),
            owner_id,
            kind,
            local_track,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a local track with the codec, ID and stream ID of `remote`.
    pub fn from_remote(owner_id: String, remote: &TrackRemote) -> Self {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
        ));
        Self::new(owner_id, local_track)
    }

    pub fn local_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.local_track) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Starts copying RTP from `remote` into the local track, and periodic PLIs towards the publisher.
    pub(crate) fn start_relay(
        &self,
        remote: Arc<TrackRemote>,
        publisher: Arc<RTCPeerConnection>,
        pli_interval: Duration,
    ) {
        let local_track = Arc::clone(&self.local_track);
        let cancel = self.cancel.clone();
        let media_ssrc = remote.ssrc();
        tokio::spawn(async move {
            Self::rtp_event_loop(remote, local_track, cancel).await;
        });

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            Self::pli_loop(publisher, media_ssrc, pli_interval, cancel).await;
        });
    }

    /// Reads RTCP feedback arriving on a subscriber's sender so the interceptors keep working.
    pub(crate) fn drain_rtcp(&self, rtp_sender: Arc<RTCRtpSender>) {
        let cancel = self.cancel.clone();
        let track_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = rtp_sender.read_rtcp() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!("RTCP drain loop finished for {}", track_id);
        });
    }

    async fn rtp_event_loop(
        remote: Arc<TrackRemote>,
        local_track: Arc<TrackLocalStaticRTP>,
        cancel: CancellationToken,
    ) {
        let track_id = remote.id();
        tracing::debug!(
            "RTP relay has started for {}, {}: {}",
            track_id,
            remote.payload_type(),
            remote.codec().capability.mime_type
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                res = remote.read_rtp() => {
                    match res {
                        Ok((rtp, _attr)) => {
                            tracing::trace!(
                                "relay {} ssrc={} seq={} timestamp={}",
                                track_id,
                                rtp.header.ssrc,
                                rtp.header.sequence_number,
                                rtp.header.timestamp
                            );
                            if let Err(err) = local_track.write_rtp(&rtp).await {
                                tracing::trace!("failed to write rtp to {}: {}", track_id, err);
                            }
                        }
                        Err(err) => {
                            tracing::debug!("failed to read rtp from {}: {}", track_id, err);
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("RTP relay has finished for {}", track_id);
    }

    async fn pli_loop(
        publisher: Arc<RTCPeerConnection>,
        media_ssrc: u32,
        pli_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(pli_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let pli = PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    };
                    if let Err(err) = publisher.write_rtcp(&[Box::new(pli)]).await {
                        tracing::debug!("PLI loop for ssrc={} stopped: {}", media_ssrc, err);
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for ForwardedTrack {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("ForwardedTrack {} is dropped", self.id);
    }
}
