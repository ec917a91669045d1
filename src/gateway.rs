//! HTTP entry point: authenticates the upgrade request and runs one
//! websocket actor per signaling connection.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use actix::{
    Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, Handler, Message, StreamHandler,
    WrapFuture,
};
use actix_web::{
    web::{self, Data, Query},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use actix_web_actors::ws;
use derivative::Derivative;
use tracing_actix_web::TracingLogger;

use crate::{
    config::Config,
    error::{AdmissionErrorKind, Error, RoomErrorKind, TransportErrorKind},
    peer::{PeerSession, SignalSink},
    presence::{self, PresenceStore},
    registry::RoomRegistry,
    room::Room,
    signal::ClientMessage,
};

const JOIN_ATTEMPTS: usize = 5;

/// Shared state of every signaling connection.
#[derive(Debug)]
pub struct GatewayState {
    pub registry: RoomRegistry,
    pub presence: Arc<dyn PresenceStore>,
    pub config: Config,
}

impl GatewayState {
    pub fn new(config: Config, presence: Arc<dyn PresenceStore>) -> Self {
        Self {
            registry: RoomRegistry::new(config.sfu.clone()),
            presence,
            config,
        }
    }
}

pub async fn run(config: Config) -> Result<(), Error> {
    let presence = presence::connect(&config.presence).await?;
    let bind_address = config.gateway.bind_address.clone();
    let signaling_path = config.gateway.signaling_path.clone();
    let state = Data::new(GatewayState::new(config, presence));

    tracing::info!(
        "signaling gateway listening on {}{}",
        bind_address,
        signaling_path
    );

    HttpServer::new(move || {
        let signaling_path = signaling_path.clone();
        App::new()
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(move |cfg| routes(cfg, &signaling_path))
    })
    .bind(bind_address)?
    .run()
    .await?;

    Ok(())
}

pub fn routes(cfg: &mut web::ServiceConfig, signaling_path: &str) {
    cfg.service(index)
        .route(signaling_path, web::get().to(socket));
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

async fn socket(
    req: HttpRequest,
    stream: web::Payload,
    state: Data<GatewayState>,
) -> Result<HttpResponse, actix_web::Error> {
    let gateway = &state.config.gateway;
    let user_id = match resolve_user_id(
        &req,
        &gateway.user_id_header,
        gateway.allow_query_user_id,
    )
    .ok_or_else(|| {
        Error::new_admission(
            format!("{} is not present", gateway.user_id_header),
            AdmissionErrorKind::MissingUserId,
        )
    }) {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::warn!("signaling request is rejected: {}", err);
            return Ok(HttpResponse::Unauthorized().body("missing user id"));
        }
    };

    let bootstrap_room = query_param(&req, "room_id");
    let socket = SignalingSocket::new(user_id, bootstrap_room, state.into_inner());
    ws::start(socket, &req, stream)
}

/// Reads the authenticated user ID from `header`, falling back to the
/// `user_id` query parameter when `allow_query` is set.
pub fn resolve_user_id(req: &HttpRequest, header: &str, allow_query: bool) -> Option<String> {
    let from_header = req
        .headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    match from_header {
        Some(user_id) => Some(user_id),
        None if allow_query => query_param(req, "user_id"),
        None => None,
    }
}

fn query_param(req: &HttpRequest, name: &str) -> Option<String> {
    Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()?
        .get(name)
        .filter(|value| !value.is_empty())
        .cloned()
}

/// Admits `user_id` into `room_id` and registers a new session there.
///
/// A user recorded in another room is rejected with [`AdmissionErrorKind::UserBusy`].
pub async fn join_room(
    state: &GatewayState,
    user_id: &str,
    room_id: &str,
    sink: Arc<dyn SignalSink>,
) -> Result<(Arc<Room>, Arc<PeerSession>), Error> {
    if let Some(current) = state.presence.is_user_busy(user_id).await? {
        if current != room_id {
            return Err(Error::new_admission(
                format!("{} is already in room {}", user_id, current),
                AdmissionErrorKind::UserBusy,
            ));
        }
    }
    state.presence.set_user_in_call(user_id, room_id).await?;

    match enter_room(&state.registry, user_id, room_id, sink).await {
        Ok(session) => Ok(session),
        Err(err) => {
            release_presence(state, user_id, room_id).await;
            Err(err)
        }
    }
}

/// Clears the presence record of `user_id`, unless a session of that user is
/// still registered in `room_id`.
pub async fn release_presence(state: &GatewayState, user_id: &str, room_id: &str) {
    if let Some(room) = state.registry.get(room_id) {
        if room.peer(user_id).await.is_some() {
            tracing::debug!("{} still has a session in {}, presence is kept", user_id, room_id);
            return;
        }
    }
    if let Err(err) = state.presence.remove_user_from_call(user_id).await {
        tracing::warn!("failed to clear presence of {}: {}", user_id, err);
    }
}

// A room can be retired between lookup and join; the next lookup creates a fresh one.
async fn enter_room(
    registry: &RoomRegistry,
    user_id: &str,
    room_id: &str,
    sink: Arc<dyn SignalSink>,
) -> Result<(Arc<Room>, Arc<PeerSession>), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let room = registry.get_or_create(room_id);
        let peer = PeerSession::new(user_id.to_string(), Arc::clone(&sink));
        match room.join(&peer).await {
            Ok(()) => return Ok((room, peer)),
            Err(err) if err.is_room_closed() && attempt < JOIN_ATTEMPTS => {
                tracing::debug!("room {} closed during join of {}, retrying", room_id, user_id);
                tokio::task::yield_now().await;
            }
            Err(err) => return Err(err),
        }
    }
}

struct SignalingSocket {
    user_id: String,
    bootstrap_room: Option<String>,
    state: Arc<GatewayState>,
    session: Option<(Arc<Room>, Arc<PeerSession>)>,
    heartbeat: Instant,
}

impl SignalingSocket {
    fn new(user_id: String, bootstrap_room: Option<String>, state: Arc<GatewayState>) -> Self {
        Self {
            user_id,
            bootstrap_room,
            state,
            session: None,
            heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.state.config.gateway.heartbeat_interval;
        let client_timeout = self.state.config.gateway.client_timeout;
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > client_timeout {
                tracing::warn!("heartbeat of {} timed out", act.user_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn join(&mut self, room_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some((room, _)) = &self.session {
            tracing::warn!("{} already joined room {}", self.user_id, room.id);
            return;
        }

        let state = Arc::clone(&self.state);
        let user_id = self.user_id.clone();
        let sink: Arc<dyn SignalSink> = Arc::new(SocketSink {
            addr: ctx.address(),
        });
        let fut = async move { join_room(&state, &user_id, &room_id, sink).await };

        ctx.wait(fut.into_actor(self).map(|res, act, ctx| match res {
            Ok(session) => act.session = Some(session),
            Err(err) if err.is_admission() => {
                tracing::info!("join of {} is rejected: {}", act.user_id, err);
                ctx.stop();
            }
            Err(err) => tracing::error!("failed to join {}: {}", act.user_id, err),
        }));
    }

    fn peer(&self) -> Result<Arc<PeerSession>, Error> {
        match &self.session {
            Some((_, peer)) => Ok(Arc::clone(peer)),
            None => Err(Error::new_room(
                format!("{} has not joined a room", self.user_id),
                RoomErrorKind::PeerNotFound,
            )),
        }
    }

    fn dispatch(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let kind = message.kind();
        if let ClientMessage::Join(payload) = message {
            self.join(payload.room_id, ctx);
            return;
        }

        let peer = match self.peer() {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!("{} from {} is dropped: {}", kind, self.user_id, err);
                return;
            }
        };
        let delay = self.state.registry.config().renegotiation_delay;

        let fut = async move {
            match message {
                ClientMessage::Offer(offer) => peer.handle_offer(offer).await,
                ClientMessage::Answer(answer) => peer.handle_answer(answer, delay).await,
                ClientMessage::Candidate(candidate) => peer.add_ice_candidate(candidate).await,
                ClientMessage::Join(_) => Ok(()),
            }
        };

        ctx.wait(fut.into_actor(self).map(move |res, act, _ctx| {
            if let Err(err) = res {
                tracing::error!("failed to handle {} from {}: {}", kind, act.user_id, err);
            }
        }));
    }
}

impl Actor for SignalingSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("signaling connection of {} is started", self.user_id);
        self.start_heartbeat(ctx);
        if let Some(room_id) = self.bootstrap_room.take() {
            self.join(room_id, ctx);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("signaling connection of {} is stopped", self.user_id);
        let Some((room, peer)) = self.session.take() else {
            return;
        };

        let state = Arc::clone(&self.state);
        actix::spawn(async move {
            room.remove_session(&peer).await;
            release_presence(&state, &peer.id, &room.id).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SignalingSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => self.heartbeat = Instant::now(),
            Ok(ws::Message::Text(text)) => {
                self.heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        tracing::debug!("received {} from {}", message.kind(), self.user_id);
                        self.dispatch(message, ctx);
                    }
                    Err(error) => {
                        tracing::warn!("invalid message from {}: {}", self.user_id, error);
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary frame from {} is ignored", self.user_id);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(error) => {
                tracing::warn!("protocol error on {}: {}", self.user_id, error);
                ctx.stop();
            }
            _ => (),
        }
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct Outbound(String);

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct CloseSocket;

impl Handler<Outbound> for SignalingSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for SignalingSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) -> Self::Result {
        ctx.close(None);
        ctx.stop();
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct SocketSink {
    #[derivative(Debug = "ignore")]
    addr: Addr<SignalingSocket>,
}

impl SignalSink for SocketSink {
    fn send_text(&self, text: String) -> Result<(), Error> {
        if !self.addr.connected() {
            return Err(Error::new_transport(
                "websocket is closed".to_string(),
                TransportErrorKind::SignalingClosed,
            ));
        }
        self.addr.do_send(Outbound(text));
        Ok(())
    }

    fn close(&self) {
        self.addr.do_send(CloseSocket);
    }
}
