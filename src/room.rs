use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, RwLock};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidate,
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    config::SfuConfig,
    error::{Error, RoomErrorKind},
    media_engine,
    media_track::ForwardedTrack,
    peer::PeerSession,
    signal::ServerMessage,
};

pub(crate) type RoomMap = DashMap<String, Arc<Room>>;

/// Events raised by the media-transport connection of one peer, consumed by
/// that peer's event loop in the room.
pub(crate) enum PeerEvent {
    Track(Arc<TrackRemote>),
    IceCandidate(RTCIceCandidate),
    ConnectionState(RTCPeerConnectionState),
}

/// Outcome of [`Room::remove_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRemoval {
    Removed,
    /// A newer session of the same user has taken this one's place.
    Superseded,
    NotFound,
}

#[derive(Default)]
struct RoomState {
    peers: HashMap<String, Arc<PeerSession>>,
    tracks: Vec<Arc<ForwardedTrack>>,
    retired: bool,
}

struct Departure {
    peer: Arc<PeerSession>,
    stream_ids: Vec<String>,
    tracks: Vec<Arc<ForwardedTrack>>,
    remaining: Vec<Arc<PeerSession>>,
    empty: bool,
}

/// Peers of one room and the tracks forwarded between them.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Room {
    pub id: String,
    #[derivative(Debug = "ignore")]
    state: RwLock<RoomState>,
    config: Arc<SfuConfig>,
    #[derivative(Debug = "ignore")]
    registry: Weak<RoomMap>,
}

impl Room {
    pub(crate) fn new(id: String, config: Arc<SfuConfig>, registry: Weak<RoomMap>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(RoomState::default()),
            config,
            registry,
        })
    }

    /// Creates the media-transport connection of `peer`, subscribes it to every
    /// forwarded track and sends the initial offer.
    ///
    /// On error nothing is registered and the signaling connection stays open.
    pub async fn join(self: &Arc<Self>, peer: &Arc<PeerSession>) -> Result<(), Error> {
        let connection = Arc::new(
            media_engine::new_peer_connection(&self.config.transport, &self.config.codec).await?,
        );
        if let Err(err) = Self::prepare_connection(&connection, peer).await {
            Self::discard_connection(&connection).await;
            return Err(err);
        }

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        Self::connection_hooks(&connection, event_sender);

        let (tracks, evicted) = {
            let mut state = self.state.write().await;
            if state.retired {
                drop(state);
                Self::discard_connection(&connection).await;
                return Err(Error::new_room(
                    format!("room {} is closed", self.id),
                    RoomErrorKind::RoomClosed,
                ));
            }
            let evicted = Self::take_peer(&mut state, &peer.id).await;
            state.peers.insert(peer.id.clone(), Arc::clone(peer));
            (state.tracks.clone(), evicted)
        };

        if let Some(departure) = evicted {
            tracing::info!(
                "peer {} rejoined room {}, previous session is evicted",
                peer.id,
                self.id
            );
            self.finish_departure(departure).await;
        }

        tokio::spawn(Self::peer_event_loop(
            Arc::clone(self),
            Arc::clone(peer),
            event_receiver,
        ));

        for track in tracks.iter().filter(|t| t.owner_id != peer.id) {
            if let Err(err) = Self::attach_track(&connection, track).await {
                tracing::warn!("failed to forward {} to {}: {}", track.id, peer.id, err);
            }
        }

        tracing::info!("peer {} joined room {}", peer.id, self.id);

        if let Err(err) = peer.signal().await {
            tracing::warn!("failed to send initial offer to {}: {}", peer.id, err);
        }

        Ok(())
    }

    async fn prepare_connection(
        connection: &Arc<RTCPeerConnection>,
        peer: &PeerSession,
    ) -> Result<(), Error> {
        // Receive-only slots let the client publish without waiting for another round.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        peer.attach_connection(Arc::clone(connection))
    }

    async fn discard_connection(connection: &RTCPeerConnection) {
        if let Err(err) = connection.close().await {
            tracing::warn!("failed to close discarded peer connection: {}", err);
        }
    }

    fn connection_hooks(
        connection: &RTCPeerConnection,
        event_sender: mpsc::UnboundedSender<PeerEvent>,
    ) {
        connection.on_track(Box::new(enc!((event_sender)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = event_sender.send(PeerEvent::Track(track));
                Box::pin(async {})
            }
        )));

        connection.on_ice_candidate(Box::new(enc!((event_sender)
            move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    let _ = event_sender.send(PeerEvent::IceCandidate(candidate));
                }
                Box::pin(async {})
            }
        )));

        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let _ = event_sender.send(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            },
        ));
    }

    async fn peer_event_loop(
        room: Arc<Room>,
        peer: Arc<PeerSession>,
        mut event_receiver: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = peer.closed() => break,
                event = event_receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if room.handle_event(&peer, event).await.is_break() {
                break;
            }
        }
        tracing::debug!("event loop of {} in room {} finished", peer.id, room.id);
    }

    pub(crate) async fn handle_event(
        &self,
        peer: &Arc<PeerSession>,
        event: PeerEvent,
    ) -> ControlFlow<()> {
        match event {
            PeerEvent::Track(remote) => {
                self.publish_remote_track(peer, remote).await;
            }
            PeerEvent::IceCandidate(candidate) => match candidate.to_json() {
                Ok(init) => {
                    if let Err(err) = peer.send(&ServerMessage::Candidate(init)).await {
                        tracing::debug!("failed to send candidate to {}: {}", peer.id, err);
                    }
                }
                Err(err) => tracing::error!("failed to serialize candidate: {}", err),
            },
            PeerEvent::ConnectionState(state) => {
                tracing::info!("peer {} connection state changed: {}", peer.id, state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    self.remove_session(peer).await;
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn publish_remote_track(&self, peer: &Arc<PeerSession>, remote: Arc<TrackRemote>) {
        tracing::info!(
            "Track published by {}: id={}, stream_id={}, ssrc={}",
            peer.id,
            remote.id(),
            remote.stream_id(),
            remote.ssrc()
        );
        let publisher = match peer.connection() {
            Ok(connection) => connection,
            Err(_) => return,
        };

        let track = Arc::new(ForwardedTrack::from_remote(peer.id.clone(), &remote));
        if self.publish_track(peer, Arc::clone(&track)).await {
            track.start_relay(remote, publisher, self.config.pli_interval);
        }
    }

    /// Adds `track` to the room and forwards it to every other peer, renegotiating each of them.
    ///
    /// Returns false, and stops the track, when `peer` is no longer a member.
    pub async fn publish_track(&self, peer: &Arc<PeerSession>, track: Arc<ForwardedTrack>) -> bool {
        peer.add_stream_id(track.stream_id.clone()).await;

        let subscribers: Vec<Arc<PeerSession>> = {
            let mut state = self.state.write().await;
            let is_member = state
                .peers
                .get(&peer.id)
                .map_or(false, |current| Arc::ptr_eq(current, peer));
            if !is_member {
                drop(state);
                track.stop();
                return false;
            }
            state.tracks.push(Arc::clone(&track));
            state
                .peers
                .values()
                .filter(|p| p.id != peer.id)
                .cloned()
                .collect()
        };

        for subscriber in subscribers {
            let connection = match subscriber.connection() {
                Ok(connection) => connection,
                Err(_) => continue,
            };
            if let Err(err) = Self::attach_track(&connection, &track).await {
                tracing::warn!("failed to forward {} to {}: {}", track.id, subscriber.id, err);
                continue;
            }
            if let Err(err) = subscriber.signal().await {
                tracing::warn!("failed to renegotiate with {}: {}", subscriber.id, err);
            }
        }

        true
    }

    async fn attach_track(
        connection: &RTCPeerConnection,
        track: &ForwardedTrack,
    ) -> Result<(), Error> {
        let rtp_sender = connection.add_track(track.local_track()).await?;
        track.drain_rtcp(rtp_sender);
        Ok(())
    }

    /// Removes the peer with `peer_id`. Unknown IDs are ignored and false is returned.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let departure = {
            let mut state = self.state.write().await;
            Self::take_peer(&mut state, peer_id).await
        };

        match departure {
            Some(departure) => {
                self.finish_departure(departure).await;
                true
            }
            None => false,
        }
    }

    /// Removes `peer` only if it is still the registered session of its user.
    /// `peer` is closed in every case.
    pub async fn remove_session(&self, peer: &Arc<PeerSession>) -> SessionRemoval {
        let (removal, departure) = {
            let mut state = self.state.write().await;
            let removal = match state.peers.get(&peer.id) {
                None => SessionRemoval::NotFound,
                Some(current) if Arc::ptr_eq(current, peer) => SessionRemoval::Removed,
                Some(_) => SessionRemoval::Superseded,
            };
            let departure = match removal {
                SessionRemoval::Removed => Self::take_peer(&mut state, &peer.id).await,
                _ => None,
            };
            (removal, departure)
        };

        match departure {
            Some(departure) => self.finish_departure(departure).await,
            None => peer.close().await,
        }
        removal
    }

    async fn take_peer(state: &mut RoomState, peer_id: &str) -> Option<Departure> {
        let peer = state.peers.remove(peer_id)?;
        let stream_ids = peer.stream_ids().await;

        let (tracks, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.tracks)
            .into_iter()
            .partition(|t| t.owner_id == peer.id && stream_ids.contains(&t.stream_id));
        state.tracks = kept;

        Some(Departure {
            peer,
            stream_ids,
            tracks,
            remaining: state.peers.values().cloned().collect(),
            empty: state.peers.is_empty(),
        })
    }

    async fn finish_departure(&self, departure: Departure) {
        let Departure {
            peer,
            stream_ids,
            tracks,
            remaining,
            empty,
        } = departure;

        for track in tracks.iter() {
            tracing::debug!("Track {} is removed from room {}", track.id, self.id);
            track.stop();
        }

        if empty {
            self.release().await;
        }

        peer.close().await;
        tracing::info!("peer {} left room {}", peer.id, self.id);

        for other in remaining {
            let message = ServerMessage::UserLeft {
                user_id: peer.id.clone(),
                stream_ids: stream_ids.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = other.send(&message).await {
                    tracing::warn!("failed to notify {}: {}", other.id, err);
                }
            });
        }
    }

    // Retires an empty room and drops it from the registry.
    async fn release(&self) {
        {
            let mut state = self.state.write().await;
            if !state.peers.is_empty() || state.retired {
                return;
            }
            state.retired = true;
        }

        if let Some(rooms) = self.registry.upgrade() {
            let removed = rooms.remove_if(&self.id, |_, room| std::ptr::eq(room.as_ref(), self));
            if removed.is_some() {
                tracing::info!("Room {} is removed", self.id);
            }
        }
    }

    pub async fn peer(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.state.read().await.peers.get(peer_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().await.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.peers.is_empty()
    }

    pub async fn is_retired(&self) -> bool {
        self.state.read().await.retired
    }

    /// Stream IDs of the forwarded tracks, in publication order.
    pub async fn track_stream_ids(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .tracks
            .iter()
            .map(|t| t.stream_id.clone())
            .collect()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        tracing::debug!("Room {} is dropped", self.id);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_json::Value;
    use tokio::{sync::mpsc::UnboundedReceiver, time::{sleep, timeout}};
    use webrtc::{
        api::media_engine::MIME_TYPE_VP8,
        ice_transport::ice_candidate::RTCIceCandidateInit,
        peer_connection::{
            sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        },
        rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
        rtp::{header::Header, packet::Packet},
        rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
        track::track_local::{
            track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter,
        },
    };

    use super::*;
    use crate::{
        config::{CodecConfig, WebRTCTransportConfig},
        peer::{ChannelSink, SinkFrame},
        registry::RoomRegistry,
    };

    const RENEGOTIATION_DELAY: Duration = Duration::from_millis(10);

    fn registry() -> RoomRegistry {
        RoomRegistry::new(SfuConfig {
            renegotiation_delay: RENEGOTIATION_DELAY,
            ..Default::default()
        })
    }

    struct Client {
        peer: Arc<PeerSession>,
        receiver: UnboundedReceiver<SinkFrame>,
        browser: Option<RTCPeerConnection>,
    }

    impl Client {
        async fn join(room: &Arc<Room>, id: &str) -> Client {
            let (sink, receiver) = ChannelSink::new();
            let peer = PeerSession::new(id.to_string(), Arc::new(sink));
            room.join(&peer).await.unwrap();
            Client {
                peer,
                receiver,
                browser: None,
            }
        }

        // Next message of `kind`; candidates and other messages are skipped.
        async fn expect(&mut self, kind: &str) -> Value {
            timeout(Duration::from_secs(5), async {
                loop {
                    match self.receiver.recv().await {
                        Some(SinkFrame::Text(text)) => {
                            let value: Value = serde_json::from_str(&text).unwrap();
                            if value["type"] == kind {
                                return value;
                            }
                        }
                        Some(SinkFrame::Close) => continue,
                        None => panic!("sink of {} is gone", self.peer.id),
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("{} did not receive {}", self.peer.id, kind))
        }

        // Types of the buffered messages, without candidates.
        fn drain(&mut self) -> Vec<String> {
            let mut kinds = vec![];
            while let Ok(frame) = self.receiver.try_recv() {
                match frame {
                    SinkFrame::Text(text) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        let kind = value["type"].as_str().unwrap().to_string();
                        if kind != "candidate" {
                            kinds.push(kind);
                        }
                    }
                    SinkFrame::Close => kinds.push("close".to_string()),
                }
            }
            kinds
        }

        // Answers `offer` the way a browser would and hands the answer to the session.
        async fn answer(&mut self, offer: &Value) {
            let browser = match self.browser.take() {
                Some(browser) => browser,
                None => {
                    media_engine::new_peer_connection(
                        &WebRTCTransportConfig::default(),
                        &CodecConfig::default(),
                    )
                    .await
                    .unwrap()
                }
            };
            let offer: RTCSessionDescription =
                serde_json::from_value(offer["payload"].clone()).unwrap();
            browser.set_remote_description(offer).await.unwrap();
            let answer = browser.create_answer(None).await.unwrap();
            browser.set_local_description(answer.clone()).await.unwrap();
            self.browser = Some(browser);

            self.peer
                .handle_answer(answer, RENEGOTIATION_DELAY)
                .await
                .unwrap();
        }

        async fn sent_track_ids(&self) -> Vec<String> {
            let mut ids = vec![];
            for sender in self.peer.connection().unwrap().get_senders().await {
                if let Some(track) = sender.track().await {
                    ids.push(track.id().to_string());
                }
            }
            ids
        }
    }

    fn video_track(owner: &str, id: &str, stream_id: &str) -> Arc<ForwardedTrack> {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ));
        Arc::new(ForwardedTrack::new(owner.to_string(), local_track))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_sends_initial_offer() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let mut u1 = Client::join(&room, "u1").await;

        let offer = u1.expect("offer").await;
        let sdp = offer["payload"]["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("a=recvonly"));

        assert_eq!(room.peer_ids().await, vec!["u1".to_string()]);
        assert_eq!(
            u1.peer.connection().unwrap().signaling_state(),
            RTCSignalingState::HaveLocalOffer
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deferred_offer_is_sent_once_after_answer() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let mut u1 = Client::join(&room, "u1").await;
        let offer = u1.expect("offer").await;

        u1.peer.signal().await.unwrap();
        u1.peer.signal().await.unwrap();
        assert!(u1.peer.negotiation_pending().await);
        assert!(!u1.drain().contains(&"offer".to_string()));

        u1.answer(&offer).await;
        u1.expect("offer").await;
        assert!(!u1.peer.negotiation_pending().await);

        sleep(Duration::from_millis(200)).await;
        assert!(!u1.drain().contains(&"offer".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_published_track_is_offered_to_others_only() {
        let registry = registry();
        let room = registry.get_or_create("r1");

        let mut u1 = Client::join(&room, "u1").await;
        let offer = u1.expect("offer").await;
        u1.answer(&offer).await;

        let mut u2 = Client::join(&room, "u2").await;
        let offer = u2.expect("offer").await;
        u2.answer(&offer).await;

        sleep(Duration::from_millis(100)).await;
        assert!(u1.drain().is_empty());

        assert!(room.publish_track(&u1.peer, video_track("u1", "video-u1", "stream-u1")).await);

        let offer = u2.expect("offer").await;
        assert!(offer["payload"]["sdp"]
            .as_str()
            .unwrap()
            .contains("stream-u1"));

        assert!(u2.sent_track_ids().await.contains(&"video-u1".to_string()));
        assert!(!u1.sent_track_ids().await.contains(&"video-u1".to_string()));
        assert!(u1.drain().is_empty());
        assert_eq!(room.track_stream_ids().await, vec!["stream-u1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_track_published_mid_negotiation_is_in_next_offer() {
        let registry = registry();
        let room = registry.get_or_create("r1");

        let mut u1 = Client::join(&room, "u1").await;
        let first_offer = u1.expect("offer").await;

        let mut u2 = Client::join(&room, "u2").await;
        let offer = u2.expect("offer").await;
        u2.answer(&offer).await;

        room.publish_track(&u2.peer, video_track("u2", "video-u2", "stream-u2"))
            .await;
        assert!(u1.peer.negotiation_pending().await);
        assert!(!u1.drain().contains(&"offer".to_string()));

        u1.answer(&first_offer).await;
        let offer = u1.expect("offer").await;
        assert!(offer["payload"]["sdp"]
            .as_str()
            .unwrap()
            .contains("stream-u2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_peer_receives_existing_tracks() {
        let registry = registry();
        let room = registry.get_or_create("r1");

        let u1 = Client::join(&room, "u1").await;
        room.publish_track(&u1.peer, video_track("u1", "video-u1", "stream-u1"))
            .await;

        let mut u2 = Client::join(&room, "u2").await;
        let offer = u2.expect("offer").await;
        assert!(offer["payload"]["sdp"]
            .as_str()
            .unwrap()
            .contains("stream-u1"));
        assert_eq!(u2.sent_track_ids().await, vec!["video-u1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_peer_drops_only_its_tracks() {
        let registry = registry();
        let room = registry.get_or_create("r1");

        let mut u1 = Client::join(&room, "u1").await;
        let mut u2 = Client::join(&room, "u2").await;

        let s1 = video_track("u1", "t1", "s1");
        let s2 = video_track("u1", "t2", "s2");
        let s3 = video_track("u2", "t3", "s3");
        room.publish_track(&u1.peer, Arc::clone(&s1)).await;
        room.publish_track(&u1.peer, Arc::clone(&s2)).await;
        room.publish_track(&u2.peer, Arc::clone(&s3)).await;
        assert_eq!(room.track_stream_ids().await, vec!["s1", "s2", "s3"]);

        assert!(room.remove_peer("u1").await);

        assert_eq!(room.track_stream_ids().await, vec!["s3".to_string()]);
        assert!(s1.is_stopped());
        assert!(s2.is_stopped());
        assert!(!s3.is_stopped());

        let left = u2.expect("user_left").await;
        assert_eq!(left["payload"]["user_id"], "u1");
        assert_eq!(left["payload"]["stream_ids"], serde_json::json!(["s1", "s2"]));

        assert!(u1.peer.is_closed());
        assert!(u1.drain().contains(&"close".to_string()));

        assert!(registry.get("r1").is_some());
        assert_eq!(room.peer_ids().await, vec!["u2".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_peer_is_idempotent() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let _u1 = Client::join(&room, "u1").await;
        let _u2 = Client::join(&room, "u2").await;

        assert!(room.remove_peer("u1").await);
        assert!(!room.remove_peer("u1").await);
        assert!(!room.remove_peer("nobody").await);
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_departure_removes_room() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let u1 = Client::join(&room, "u1").await;
        let u2 = Client::join(&room, "u2").await;

        room.remove_session(&u1.peer).await;
        assert!(registry.get("r1").is_some());

        assert_eq!(room.remove_session(&u2.peer).await, SessionRemoval::Removed);
        assert!(registry.get("r1").is_none());
        assert!(room.is_retired().await);

        let (sink, _receiver) = ChannelSink::new();
        let late = PeerSession::new("u3".to_string(), Arc::new(sink));
        let err = room.join(&late).await.unwrap_err();
        assert!(err.is_room_closed());

        let fresh = registry.get_or_create("r1");
        assert!(!Arc::ptr_eq(&fresh, &room));
        assert!(fresh.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejoin_evicts_previous_session() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let mut old = Client::join(&room, "u1").await;
        let mut u2 = Client::join(&room, "u2").await;
        let new = Client::join(&room, "u1").await;

        assert_eq!(room.peer_count().await, 2);
        let current = room.peer("u1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new.peer));
        assert!(old.peer.is_closed());
        assert!(old.drain().contains(&"close".to_string()));
        assert_eq!(u2.expect("user_left").await["payload"]["user_id"], "u1");

        assert_eq!(room.remove_session(&old.peer).await, SessionRemoval::Superseded);
        assert!(room.peer("u1").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_connection_removes_peer() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let u1 = Client::join(&room, "u1").await;
        let mut u2 = Client::join(&room, "u2").await;

        let flow = room
            .handle_event(
                &u1.peer,
                PeerEvent::ConnectionState(RTCPeerConnectionState::Failed),
            )
            .await;
        assert!(flow.is_break());
        assert_eq!(room.peer_ids().await, vec!["u2".to_string()]);
        assert_eq!(u2.expect("user_left").await["payload"]["user_id"], "u1");

        let flow = room
            .handle_event(
                &u2.peer,
                PeerEvent::ConnectionState(RTCPeerConnectionState::Connected),
            )
            .await;
        assert!(flow.is_continue());
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_from_departed_peer_is_rejected() {
        let registry = registry();
        let room = registry.get_or_create("r1");
        let u1 = Client::join(&room, "u1").await;
        let _u2 = Client::join(&room, "u2").await;
        room.remove_peer("u1").await;

        let track = video_track("u1", "t1", "s1");
        assert!(!room.publish_track(&u1.peer, Arc::clone(&track)).await);
        assert!(track.is_stopped());
        assert!(room.track_stream_ids().await.is_empty());
    }

    // Plays the browser side of `peer`: answers every offer and trickles candidates both ways.
    fn run_browser(
        peer: Arc<PeerSession>,
        mut receiver: UnboundedReceiver<SinkFrame>,
        browser: Arc<RTCPeerConnection>,
    ) {
        browser.on_ice_candidate(Box::new(enc!((peer)
            move |candidate: Option<RTCIceCandidate>| {
                let peer = Arc::clone(&peer);
                Box::pin(async move {
                    if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                        let _ = peer.add_ice_candidate(init).await;
                    }
                })
            }
        )));

        tokio::spawn(async move {
            while let Some(SinkFrame::Text(text)) = receiver.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                match value["type"].as_str() {
                    Some("offer") => {
                        let offer: RTCSessionDescription =
                            serde_json::from_value(value["payload"].clone()).unwrap();
                        browser.set_remote_description(offer).await.unwrap();
                        let answer = browser.create_answer(None).await.unwrap();
                        browser.set_local_description(answer.clone()).await.unwrap();
                        peer.handle_answer(answer, RENEGOTIATION_DELAY).await.unwrap();
                    }
                    Some("candidate") => {
                        let candidate: RTCIceCandidateInit =
                            serde_json::from_value(value["payload"].clone()).unwrap();
                        let _ = browser.add_ice_candidate(candidate).await;
                    }
                    _ => (),
                }
            }
        });
    }

    async fn browser() -> Arc<RTCPeerConnection> {
        Arc::new(
            media_engine::new_peer_connection(
                &WebRTCTransportConfig::default(),
                &CodecConfig::default(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_track_is_relayed_to_subscriber() {
        const PAYLOAD: [u8; 6] = [0x90, 0x90, 0x90, 0x01, 0x02, 0x03];

        let registry = registry();
        let room = registry.get_or_create("r1");

        let (payload_sender, mut payloads) = tokio::sync::mpsc::unbounded_channel();
        let subscriber = browser().await;
        subscriber.on_track(Box::new(move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            let payload_sender = payload_sender.clone();
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    if payload_sender.send(packet.payload.to_vec()).is_err() {
                        break;
                    }
                }
            });
            Box::pin(async {})
        }));
        let u2 = Client::join(&room, "u2").await;
        run_browser(Arc::clone(&u2.peer), u2.receiver, subscriber);

        let publisher = browser().await;
        let source = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video-b1".to_owned(),
            "stream-u1".to_owned(),
        ));
        let rtp_sender = publisher
            .add_track(Arc::clone(&source) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();
        let (pli_sender, mut plis) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((packets, _)) = rtp_sender.read_rtcp().await {
                let pli = packets
                    .iter()
                    .any(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some());
                if pli && pli_sender.send(()).is_err() {
                    break;
                }
            }
        });
        let u1 = Client::join(&room, "u1").await;
        run_browser(Arc::clone(&u1.peer), u1.receiver, publisher);

        let writer = tokio::spawn(async move {
            let mut sequence_number: u16 = 0;
            loop {
                sequence_number = sequence_number.wrapping_add(1);
                let packet = Packet {
                    header: Header {
                        version: 2,
                        payload_type: 96,
                        sequence_number,
                        timestamp: u32::from(sequence_number) * 3000,
                        marker: true,
                        ..Default::default()
                    },
                    payload: PAYLOAD.to_vec().into(),
                };
                let _ = source.write_rtp(&packet).await;
                sleep(Duration::from_millis(20)).await;
            }
        });

        let payload = timeout(Duration::from_secs(15), payloads.recv())
            .await
            .expect("no media reached the subscriber")
            .unwrap();
        assert_eq!(payload, PAYLOAD.to_vec());
        assert_eq!(room.track_stream_ids().await, vec!["stream-u1".to_string()]);
        assert_eq!(u1.peer.stream_ids().await, vec!["stream-u1".to_string()]);

        timeout(Duration::from_secs(5), plis.recv())
            .await
            .expect("publisher received no PLI")
            .unwrap();

        assert!(room.remove_peer("u1").await);
        assert!(room.track_stream_ids().await.is_empty());
        sleep(Duration::from_millis(300)).await;
        while payloads.try_recv().is_ok() {}
        sleep(Duration::from_millis(500)).await;
        assert!(payloads.try_recv().is_err());

        writer.abort();
    }
}
