use std::sync::Arc;
use std::time::Duration;

use futures::stream::futures_unordered::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use cardjudge_game::error::ErrorKind;
use cardjudge_game::memory::MemoryStore;
use cardjudge_game::model::{CardKind, LobbyConfig, LobbyId};
use cardjudge_game::protocol::{Action, Outcome, Reply, Request, Response};
use cardjudge_game::server;
use cardjudge_server::{run, settings};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn seeded_store(lobbies: u32) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let deck = store.create_deck("stress").await;
    for i in 0..40 {
        store
            .add_card(deck, CardKind::Prompt, format!("prompt {}", i))
            .await;
    }
    for i in 0..2000 {
        store
            .add_card(deck, CardKind::Response, format!("response {}", i))
            .await;
    }
    for lobby in 0..lobbies {
        let id = LobbyId(lobby);
        store
            .insert_lobby(id, LobbyConfig::new(format!("lobby {}", lobby)))
            .await;
        store
            .add_deck_to_lobby(id, deck)
            .await
            .expect("lobby to exist");
    }
    store
}

async fn request(stream: &mut Socket, req: &Request) -> Response {
    let bytes = bincode::serialize(req).expect("serialization to work");
    stream
        .send(Message::binary(bytes))
        .await
        .expect("server to be up");
    // skip lobby notices until the answer arrives
    loop {
        let data = stream
            .next()
            .await
            .expect("server to respond")
            .expect("response to be successful")
            .into_data();
        let response: Response = bincode::deserialize(&data).expect("serialization to work");
        match response {
            Response::Notice(_) => continue,
            response => return response,
        }
    }
}

// Ensure that:
//
// - a server can be started.
// - many clients can join lobbies and get their actions through.
// - joining an unknown lobby is refused over the socket.
// - the server receives the shutdown notification.
// - all client tasks stop.
// - the server shuts down gracefully.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn graceful_shutdown() {
    flexi_logger::Logger::try_with_env_or_str("warn")
        .expect("log spec to parse")
        .format(flexi_logger::with_thread)
        .start()
        .expect("logger to start");
    // Spawn server.
    const NUM_LOBBIES: u32 = 10;
    let bind_addr = "127.0.0.1:8080";
    let settings = settings::Server {
        bind_addr: bind_addr.into(),
        seed_path: None,
    };
    let game = server::Settings {
        outbound_capacity: 256,
        ..server::Settings::default()
    };
    let store = seeded_store(NUM_LOBBIES).await;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(async move { run(settings, game, store, shutdown_rx).await.ok() });

    // Hack: wait a bit for the server to be ready.
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Spawn many clients in parallel, spread over the lobbies.
    const NUM_CLIENTS: u32 = 200;
    let mut connections = FuturesUnordered::new();
    for id in 0..NUM_CLIENTS {
        let url = format!(
            "ws://{}/lobby/{}/player/{}",
            bind_addr,
            id % NUM_LOBBIES,
            id
        );
        connections.push(tokio::spawn(async move {
            let (mut stream, _) = tokio_tungstenite::connect_async(url).await?;
            let response = request(&mut stream, &Request::Act(Action::Draw)).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>((stream, response))
        }));
    }

    // Wait for all clients to get a request through.
    let mut clients = Vec::with_capacity(NUM_CLIENTS as usize);
    while let Some(client_task) = connections.next().await {
        let client = client_task.expect("client");
        clients.push(client);
    }

    // Ensure every client got a full hand.
    for client in clients.iter() {
        let (_, response) = client.as_ref().expect("clients to succeed");
        match response {
            Response::Outcome(Outcome::Accepted(Reply::Hand { cards })) => {
                assert_eq!(cards.len(), 8)
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    // A lobby nobody seeded is refused.
    let url = format!("ws://{}/lobby/999/player/1", bind_addr);
    let (mut stranger, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("upgrade to succeed");
    let data = stranger
        .next()
        .await
        .expect("server to respond")
        .expect("response to be successful")
        .into_data();
    match bincode::deserialize(&data).expect("serialization to work") {
        Response::Outcome(Outcome::Rejected(rejection)) => {
            assert_eq!(rejection.kind, ErrorKind::UnknownLobby)
        }
        other => panic!("unexpected response {:?}", other),
    }

    // Tell server to shutdown.
    shutdown_tx.send(()).expect("server still running");
    let stats = server
        .await
        .expect("server shutdown smoothly")
        .expect("server shutdown smoothly");

    // Ensure the server agrees with us.
    assert_eq!(stats.total_accepted_connections, NUM_CLIENTS as usize + 1);
    drop(clients);
}
