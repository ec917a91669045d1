use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use derivative::Derivative;
use tokio::{
    sync::{mpsc, Mutex, OnceCell},
    time::sleep,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
};

use crate::{
    error::{Error, TransportErrorKind},
    signal::ServerMessage,
};

/// Outgoing half of a signaling connection.
///
/// Implementations must not block: a [`PeerSession`] writes while holding its own lock.
pub trait SignalSink: Send + Sync + Debug {
    fn send_text(&self, text: String) -> Result<(), Error>;
    /// Closes the connection. Calling it more than once is harmless.
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFrame {
    Text(String),
    Close,
}

/// [`SignalSink`] backed by an unbounded channel, for embedding the relay behind another transport.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkFrame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SignalSink for ChannelSink {
    fn send_text(&self, text: String) -> Result<(), Error> {
        self.sender.send(SinkFrame::Text(text)).map_err(|_| {
            Error::new_transport(
                "signaling channel is closed".to_string(),
                TransportErrorKind::SignalingClosed,
            )
        })
    }

    fn close(&self) {
        let _ = self.sender.send(SinkFrame::Close);
    }
}

#[derive(Debug, Default)]
struct SignalState {
    negotiation_pending: bool,
    // Offers written so far.
    offer_generation: u64,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

/// One connected participant: its signaling connection, its media-transport
/// connection and the negotiation state between them.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerSession {
    /// User ID, unique within a room.
    pub id: String,
    pub session_id: Uuid,
    sink: Arc<dyn SignalSink>,
    #[derivative(Debug = "ignore")]
    connection: OnceCell<Arc<RTCPeerConnection>>,
    // Guards signaling writes and the negotiation flag.
    state: Mutex<SignalState>,
    stream_ids: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl PeerSession {
    pub fn new(id: String, sink: Arc<dyn SignalSink>) -> Arc<Self> {
        let session_id = Uuid::new_v4();
        tracing::debug!("PeerSession {} is created for {}", session_id, id);

        Arc::new(Self {
            id,
            session_id,
            sink,
            connection: OnceCell::new(),
            state: Mutex::new(SignalState::default()),
            stream_ids: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn attach_connection(&self, connection: Arc<RTCPeerConnection>) -> Result<(), Error> {
        self.connection.set(connection).map_err(|_| {
            Error::new_transport(
                format!("PeerSession {} already has a peer connection", self.id),
                TransportErrorKind::PeerConnectionError,
            )
        })
    }

    pub fn connection(&self) -> Result<Arc<RTCPeerConnection>, Error> {
        self.connection.get().cloned().ok_or(Error::new_transport(
            "PeerConnection does not exist".to_string(),
            TransportErrorKind::PeerConnectionError,
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub async fn negotiation_pending(&self) -> bool {
        self.state.lock().await.negotiation_pending
    }

    pub async fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stream_ids.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) async fn add_stream_id(&self, stream_id: String) {
        self.stream_ids.lock().await.insert(stream_id);
    }

    /// Serializes `message` and writes it to the signaling connection.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), Error> {
        let _state = self.state.lock().await;
        self.write(message)
    }

    // Callers must hold `state`.
    fn write(&self, message: &ServerMessage) -> Result<(), Error> {
        let text = serde_json::to_string(message)?;
        tracing::trace!("send {} to {}", message.kind(), self.id);
        self.sink.send_text(text)
    }

    /// Sends a fresh offer, or marks one as pending when a negotiation is already in flight.
    pub async fn signal(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.signal_locked(&mut state).await
    }

    async fn signal_locked(&self, state: &mut SignalState) -> Result<(), Error> {
        let connection = self.connection()?;
        if self.is_closed() || connection.connection_state() == RTCPeerConnectionState::Closed {
            return Ok(());
        }

        if connection.signaling_state() != RTCSignalingState::Stable {
            tracing::debug!(
                "negotiation is in flight for {}, offer is deferred",
                self.id
            );
            state.negotiation_pending = true;
            return Ok(());
        }

        let offer = connection.create_offer(None).await?;
        connection.set_local_description(offer.clone()).await?;
        state.negotiation_pending = false;
        state.offer_generation += 1;

        tracing::info!("peer {} sending offer", self.id);
        self.write(&ServerMessage::Offer(offer))
    }

    /// Applies a client-initiated offer and replies with an answer.
    pub async fn handle_offer(&self, offer: RTCSessionDescription) -> Result<(), Error> {
        let connection = self.connection()?;
        let mut state = self.state.lock().await;

        connection.set_remote_description(offer).await?;
        Self::flush_candidates(&connection, &mut state).await;

        let answer = connection.create_answer(None).await?;
        connection.set_local_description(answer).await?;
        let answer = connection.local_description().await.ok_or(Error::new_transport(
            "Failed to set local description".to_string(),
            TransportErrorKind::LocalDescriptionError,
        ))?;

        self.write(&ServerMessage::Answer(answer))
    }

    /// Applies the client's answer to our last offer and flushes a deferred offer after `delay`.
    pub async fn handle_answer(
        self: &Arc<Self>,
        answer: RTCSessionDescription,
        delay: Duration,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let (deferred, generation) = {
            let mut state = self.state.lock().await;
            connection.set_remote_description(answer).await?;
            Self::flush_candidates(&connection, &mut state).await;
            (
                std::mem::take(&mut state.negotiation_pending),
                state.offer_generation,
            )
        };

        if deferred {
            let peer = Arc::clone(self);
            tokio::spawn(async move {
                sleep(delay).await;
                if let Err(err) = peer.signal_deferred(generation).await {
                    tracing::warn!("failed to send deferred offer to {}: {}", peer.id, err);
                }
            });
        }

        Ok(())
    }

    // An offer sent since `generation` already carries the deferred changes.
    async fn signal_deferred(&self, generation: u64) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.offer_generation != generation {
            tracing::debug!("deferred offer for {} is already covered", self.id);
            return Ok(());
        }
        self.signal_locked(&mut state).await
    }

    /// Adds a remote ICE candidate, holding it until a remote description exists.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        let connection = self.connection()?;
        let mut state = self.state.lock().await;

        if connection.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {}", self.id);
            connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {}", self.id);
            state.pending_candidates.push(candidate);
        }

        Ok(())
    }

    async fn flush_candidates(connection: &RTCPeerConnection, state: &mut SignalState) {
        for candidate in state.pending_candidates.drain(..) {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }

    /// Closes the media-transport connection, then the signaling connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        if let Some(connection) = self.connection.get() {
            if let Err(err) = connection.close().await {
                tracing::warn!("failed to close peer connection of {}: {}", self.id, err);
            }
        }
        self.sink.close();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        tracing::debug!("PeerSession {} is dropped", self.session_id);
    }
}
