use std::error::Error;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::channel::mpsc;
use futures::future::select;
use futures::pin_mut;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::sync::{oneshot, watch};
use warp::filters::ws::{Message, WebSocket};
use warp::Filter;

use cardjudge_game::model::{LobbyId, PlayerId};
use cardjudge_game::protocol::{Outcome, Rejection, Request, Response};
use cardjudge_game::server::{ClientSender, Core, Notifications};
use cardjudge_game::store::Store;

use crate::settings;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Execute the entire life-cycle of the lobby server.
pub async fn run(
    server: settings::Server,
    game: cardjudge_game::server::Settings,
    store: Arc<dyn Store>,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<Stats, BoxError> {
    // Channel to indicate that all client tasks have terminated.
    let (terminated_tx, mut terminated_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Keep track of some basic statistics.
    let total_accepted_connections = Arc::new(AtomicUsize::new(0));

    // Start the HTTP & WebSocket server.
    start_server(
        server,
        Core::new(game, store),
        shutdown_rx,
        terminated_tx,
        total_accepted_connections.clone(),
    )
    .await?;

    // Handle graceful shutdown.
    info!("waiting for client tasks to terminate");
    terminated_rx.recv().await;

    Ok(Stats {
        total_accepted_connections: total_accepted_connections.load(Ordering::Acquire),
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stats {
    pub total_accepted_connections: usize,
}

async fn start_server(
    server: settings::Server,
    core: Core,
    shutdown_rx: oneshot::Receiver<()>,
    terminated_tx: tokio::sync::mpsc::Sender<()>,
    total_accepted_connections: Arc<AtomicUsize>,
) -> Result<(), BoxError> {
    // Client tasks watch this to learn about shutdown.
    let (stop_tx, stop_rx) = watch::channel(false);

    // Create the global state.
    let (guard, weak_guard) = make_guard(core, stop_rx.clone(), terminated_tx);

    // * Accept websocket connections, one lobby seat per socket
    let lobby_server = warp::path!("lobby" / u32 / "player" / u32)
        .and(warp::ws())
        .and(warp::addr::remote())
        .map(
            move |lobby: u32, player: u32, ws: warp::ws::Ws, addr: Option<SocketAddr>| {
                let handle = weak_guard.upgrade().map(|guard| guard.new_client());
                let total_accepted_connections = total_accepted_connections.clone();
                ws.on_upgrade(move |stream| async move {
                    match (handle, addr) {
                        (Some(handle), Some(addr)) => {
                            total_accepted_connections.fetch_add(1, Ordering::Release);
                            info!("accepted connection from {}", addr);
                            let seat = (LobbyId(lobby), PlayerId(player));
                            handle_client(handle, stream, addr, seat).await;
                        }
                        (None, _) => debug!("refusing connection during shutdown"),
                        (_, None) => error!("no address for incoming connection"),
                    }
                })
            },
        );

    // Determine bind address
    let bind_addr = server
        .bind_addr
        .to_socket_addrs()?
        .next()
        .ok_or("no usable bind address")?;

    // Start the server!
    let mut server_stop = stop_rx;
    let (addr, server) =
        warp::serve(lobby_server).try_bind_with_graceful_shutdown(bind_addr, async move {
            let _ = server_stop.changed().await;
            info!("received shutdown notice");
        })?;
    info!("running on {}", addr);
    tokio::spawn(async move {
        // Wait for the server to stop.
        server.await;
        info!("web server stopped");
    });

    // Wait for shutdown, then begin graceful termination. A dropped sender
    // counts as a shutdown request too.
    let _ = shutdown_rx.await;
    let _ = stop_tx.send(true);
    drop(guard);
    Ok(())
}

// The limit of pending replies waiting to be sent to a particular client.
// Replies are one per request, so this only needs to cover requests in flight.
const RESPONSE_CAPACITY: usize = 4;

// The limit of pending requests from a particular client.
const REQUEST_CAPACITY: usize = 2;

async fn handle_client(
    handle: ClientHandle,
    mut stream: WebSocket,
    addr: SocketAddr,
    (lobby, player): (LobbyId, PlayerId),
) {
    let (state, shutdown_rx, terminated_tx) = handle.split();
    // join the lobby; a refusal is the only thing the client hears
    let client = match state.core().connect(lobby, player).await {
        Ok(client) => client,
        Err(e) => {
            info!("refused {} in {} for {}: {}", player, lobby, addr, e);
            let refusal = Response::from(Outcome::from(Rejection::from(&e)));
            send_response(&refusal, &mut stream, &addr).await;
            let _ = stream.close().await;
            drop(terminated_tx);
            return;
        }
    };
    let (sender, notices) = client.split();
    // setup communication channels
    let (response_tx, response_rx) = mpsc::channel(RESPONSE_CAPACITY);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_CAPACITY);
    // setup task loops
    let connection = process_connection(
        shutdown_rx.clone(),
        stream,
        addr,
        response_rx,
        notices,
        request_tx,
    );
    let request = handle_requests(sender, shutdown_rx, addr, request_rx, response_tx);
    pin_mut!(connection, request);
    // run task loops interleaved, and wait for both to finish.
    select(connection, request).await.factor_first().1.await;
    if state.stopping() {
        debug!("{} closed by shutdown", addr);
    }
    info!("finished handling {}", addr);
    // notify main task that we're done.
    drop(terminated_tx);
}

async fn process_connection(
    mut shutdown_rx: watch::Receiver<bool>,
    mut stream: WebSocket,
    addr: SocketAddr,
    mut response_rx: mpsc::Receiver<Response>,
    mut notices: Notifications,
    mut request_tx: mpsc::Sender<Request>,
) {
    debug!("starting connection processing loop for {}", addr);
    loop {
        tokio::select! {
            // Server shutting down
            _ = shutdown_rx.changed() => {
                break
            },
            // Write out reply to socket
            Some(resp) = response_rx.next() =>
                send_response(&resp, &mut stream, &addr).await,
            // Forward lobby notices; the stream ends when the hub drops us
            notice = notices.next() => match notice {
                Some(notice) => send_response(&notice.into(), &mut stream, &addr).await,
                None => {
                    info!("{} was dropped by its lobby", addr);
                    break;
                }
            },
            // Receive request from socket
            msg = stream.next() =>
                if forward_request(msg, &mut request_tx, &addr).await {
                    break;
                }
        }
    }
    let _ = stream.close().await;
}

async fn send_response(resp: &Response, stream: &mut WebSocket, addr: &SocketAddr) {
    match bincode::serialize(&resp) {
        Ok(data) => {
            if let Err(e) = stream.send(Message::binary(data)).await {
                error!("while sending response to {}: {}", addr, e);
            }
        }
        Err(e) => error!("while serializing response to {}: {}", addr, e),
    }
}

// Returns true once the connection should close.
async fn forward_request(
    msg: Option<Result<Message, warp::Error>>,
    request_tx: &mut mpsc::Sender<Request>,
    addr: &SocketAddr,
) -> bool {
    let msg = match msg {
        Some(msg) => msg,
        None => return true,
    };
    match msg {
        Ok(msg) => {
            if msg.is_close() {
                return true;
            }
            if !msg.is_binary() {
                return false;
            }
            match bincode::deserialize(msg.as_bytes()) {
                Ok(req) => {
                    if request_tx.send(req).await.is_err() {
                        return true;
                    }
                }
                Err(e) => error!("deserializing request from {}: {}", addr, e),
            }
        }
        Err(e) => {
            error!("reading from {}: {}", addr, e);
            return true;
        }
    }
    false
}

async fn handle_requests(
    sender: ClientSender,
    mut shutdown_rx: watch::Receiver<bool>,
    addr: SocketAddr,
    mut request_rx: mpsc::Receiver<Request>,
    mut response_tx: mpsc::Sender<Response>,
) {
    debug!("starting request handling loop for {}", addr);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("received notification to stop handling {}", addr);
                break;
            },
            opt_request = request_rx.next() => match opt_request {
                Some(req) => {
                    let (response, gone) = execute(&sender, req).await;
                    if response_tx.send(response).await.is_err() || gone {
                        debug!("stopped handling requests of {}", addr);
                        break;
                    }
                }
                None => {
                    debug!("apparent death of sibling task for {}", addr);
                    break;
                },
            }
        }
    }
}

// Run one request through the lobby. The flag is set when the lobby no
// longer knows this client.
async fn execute(sender: &ClientSender, req: Request) -> (Response, bool) {
    let result = match req {
        Request::Act(action) => sender.send(action).await.map(Response::from),
        Request::Sync => sender.snapshot().await.map(Response::from),
    };
    match result {
        Ok(response) => (response, false),
        Err(e) => (Outcome::from(Rejection::from(&e)).into(), true),
    }
}

/// The global state of the whole server.
pub struct State {
    stopping: AtomicBool,
    core: Arc<Core>,
}

impl State {
    /// Create a new server state around a lobby core.
    fn new(core: Core) -> Self {
        State {
            stopping: AtomicBool::new(false),
            core: Arc::new(core),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Inquire whether the server is in the process of shutting down.
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Create a new server state, and return a guard for it.
pub fn make_guard(
    core: Core,
    shutdown_rx: watch::Receiver<bool>,
    terminated_tx: tokio::sync::mpsc::Sender<()>,
) -> (Arc<Guard>, Weak<Guard>) {
    let state = Arc::new(State::new(core));
    let guard = Guard {
        state,
        shutdown_rx,
        terminated_tx,
    };
    let guard = Arc::new(guard);
    let weak_guard = Arc::downgrade(&guard);
    (guard, weak_guard)
}

/// Ensures that client tasks receive notification of server shutdown.
///
/// Client tasks each hold a clone of the termination sender; once the guard
/// and every client task are gone, `run` knows the shutdown is complete.
pub struct Guard {
    state: Arc<State>,
    shutdown_rx: watch::Receiver<bool>,
    terminated_tx: tokio::sync::mpsc::Sender<()>,
}

impl Guard {
    /// Create a handle for a new incoming client.
    pub fn new_client(&self) -> ClientHandle {
        ClientHandle {
            state: self.state.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            terminated_tx: self.terminated_tx.clone(),
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        debug!("dropping guard");
        self.state.stopping.store(true, Ordering::Release);
    }
}

/// A handle to the state and shutdown notifications for new clients.
#[derive(Clone)]
pub struct ClientHandle {
    state: Arc<State>,
    shutdown_rx: watch::Receiver<bool>,
    terminated_tx: tokio::sync::mpsc::Sender<()>,
}

impl ClientHandle {
    /// Consume the handle to acquire its members.
    pub fn split(
        self,
    ) -> (
        Arc<State>,
        watch::Receiver<bool>,
        tokio::sync::mpsc::Sender<()>,
    ) {
        (self.state, self.shutdown_rx, self.terminated_tx)
    }
}
