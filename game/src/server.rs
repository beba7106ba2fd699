//! The process-wide entry point to the lobby engine.
use std::collections::BTreeMap;
use std::default::Default;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::lock::{Mutex, MutexGuard};
use futures::StreamExt;
use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::hub::{self, Event, HubHandle};
use crate::model::{ConnectionId, LobbyId, PlayerId};
use crate::protocol::{Action, LobbyView, Notification, Outcome};
use crate::store::{LobbyStore, Store};

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Notices a client may have queued before the hub drops it.
    pub outbound_capacity: usize,
    /// Seated players needed before a round starts (never fewer than 2).
    pub min_players: usize,
    /// Fixed seed for shuffling and random winners; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outbound_capacity: 16,
            min_players: 2,
            rng_seed: None,
        }
    }
}

/// Maps each active lobby to its hub. At most one hub per lobby exists at
/// any time; the hub removes itself once its last client is gone.
#[derive(Default)]
pub struct LobbyRegistry {
    next_serial: AtomicU64,
    lobbies: Mutex<BTreeMap<LobbyId, HubHandle>>,
}

impl LobbyRegistry {
    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, BTreeMap<LobbyId, HubHandle>> {
        self.lobbies.lock().await
    }

    /// Remove the hub with `serial`, if it still serves `lobby`.
    pub(crate) async fn forget(&self, lobby: LobbyId, serial: u64) {
        let mut lobbies = self.lobbies.lock().await;
        if lobbies
            .get(&lobby)
            .map_or(false, |handle| handle.serial() == serial)
        {
            lobbies.remove(&lobby);
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.lobbies.lock().await.is_empty()
    }

    pub async fn contains(&self, lobby: LobbyId) -> bool {
        self.lobbies.lock().await.contains_key(&lobby)
    }
}

pub struct Core {
    settings: Settings,
    store: Arc<dyn Store>,
    registry: Arc<LobbyRegistry>,
    next_connection: AtomicU64,
}

impl Core {
    /// Create a new server core with no active lobbies.
    pub fn new(settings: Settings, store: Arc<dyn Store>) -> Self {
        Core {
            settings,
            store,
            registry: Arc::new(LobbyRegistry::default()),
            next_connection: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &LobbyRegistry {
        &self.registry
    }

    /// Join `player` to `lobby`, starting the lobby's hub if this is its
    /// first client.
    ///
    /// The returned client carries the player's notifications. Dropping it
    /// (and every half obtained from `Client::split`) unregisters the
    /// connection.
    pub async fn connect(&self, lobby: LobbyId, player: PlayerId) -> Result<Client> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_capacity);
        let (ack_tx, ack_rx) = oneshot::channel();
        let register = Event::Register {
            id,
            player,
            outbound: outbound_tx,
            ack: ack_tx,
        };
        let hub = {
            let mut lobbies = self.registry.lock().await;
            let hub = lobbies
                .entry(lobby)
                .or_insert_with(|| {
                    hub::spawn(
                        LobbyStore::new(lobby, self.store.clone()),
                        self.settings,
                        self.registry.clone(),
                    )
                })
                .clone();
            hub.send(register)
                .map_err(|_| Error::ClientUnreachable { player })?;
            hub
        };
        ack_rx
            .await
            .map_err(|_| Error::ClientUnreachable { player })??;
        debug!("{}: {} connected as {}", lobby, player, id);
        Ok(Client {
            link: Arc::new(Link {
                id,
                lobby,
                player,
                hub,
            }),
            notices: outbound_rx,
        })
    }
}

/// Lobby notices for one connection.
pub type Notifications = mpsc::Receiver<Notification>;

// The registration of one connection with its hub.
struct Link {
    id: ConnectionId,
    lobby: LobbyId,
    player: PlayerId,
    hub: HubHandle,
}

impl Link {
    fn unreachable(&self) -> Error {
        Error::ClientUnreachable {
            player: self.player,
        }
    }

    async fn submit(&self, action: Action) -> Result<Outcome> {
        let (reply, outcome) = oneshot::channel();
        let event = Event::Submit {
            id: self.id,
            player: self.player,
            action,
            reply,
        };
        self.hub.send(event).map_err(|_| self.unreachable())?;
        outcome.await.map_err(|_| self.unreachable())?
    }

    async fn snapshot(&self) -> Result<LobbyView> {
        let (reply, view) = oneshot::channel();
        let event = Event::Snapshot {
            id: self.id,
            player: self.player,
            reply,
        };
        self.hub.send(event).map_err(|_| self.unreachable())?;
        view.await.map_err(|_| self.unreachable())?
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // The hub may already be gone; nothing left to clean up then.
        let _ = self.hub.send(Event::Unregister { id: self.id });
    }
}

/// A registered connection to a lobby.
pub struct Client {
    link: Arc<Link>,
    notices: Notifications,
}

impl Client {
    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub fn lobby(&self) -> LobbyId {
        self.link.lobby
    }

    pub fn player(&self) -> PlayerId {
        self.link.player
    }

    /// Submit an action and wait for the hub's answer. Validation failures
    /// come back as `Outcome::Rejected`; `Err` means the hub dropped this
    /// connection.
    pub async fn send(&self, action: Action) -> Result<Outcome> {
        self.link.submit(action).await
    }

    pub async fn snapshot(&self) -> Result<LobbyView> {
        self.link.snapshot().await
    }

    /// The next lobby notice, or `None` once the hub dropped this client.
    pub async fn receive(&mut self) -> Option<Notification> {
        self.notices.next().await
    }

    /// Separate the request half from the notice stream, so both can be
    /// driven from different tasks.
    pub fn split(self) -> (ClientSender, Notifications) {
        (ClientSender { link: self.link }, self.notices)
    }
}

/// The request half of a split `Client`.
#[derive(Clone)]
pub struct ClientSender {
    link: Arc<Link>,
}

impl ClientSender {
    pub fn player(&self) -> PlayerId {
        self.link.player
    }

    pub async fn send(&self, action: Action) -> Result<Outcome> {
        self.link.submit(action).await
    }

    pub async fn snapshot(&self) -> Result<LobbyView> {
        self.link.snapshot().await
    }
}
