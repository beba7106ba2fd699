//! The Lobby Session Hub: one task per active lobby.
//!
//! Every client of the lobby talks to the hub through its unbounded inbox,
//! so registration, departures and game actions are handled strictly one
//! after another. Broadcasts never wait on a slow client: a connection whose
//! outbound queue is full is dropped instead.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{ConnectionId, LobbyId, PlayerId};
use crate::protocol::{Action, LobbyView, Notification, Outcome};
use crate::server::{LobbyRegistry, Settings};
use crate::store::LobbyStore;
use crate::table::{Effects, Table};

pub(crate) enum Event {
    Register {
        id: ConnectionId,
        player: PlayerId,
        outbound: mpsc::Sender<Notification>,
        ack: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Submit {
        id: ConnectionId,
        player: PlayerId,
        action: Action,
        reply: oneshot::Sender<Result<Outcome>>,
    },
    Snapshot {
        id: ConnectionId,
        player: PlayerId,
        reply: oneshot::Sender<Result<LobbyView>>,
    },
}

impl Event {
    // Answer an event the hub cannot serve.
    fn refuse(self, e: &Error) {
        match self {
            Event::Register { ack, .. } => {
                let _ = ack.send(Err(e.clone()));
            }
            Event::Submit { reply, .. } => {
                let _ = reply.send(Err(e.clone()));
            }
            Event::Snapshot { reply, .. } => {
                let _ = reply.send(Err(e.clone()));
            }
            Event::Unregister { .. } => {}
        }
    }
}

/// The registry's handle on a running hub.
#[derive(Clone)]
pub(crate) struct HubHandle {
    serial: u64,
    inbox: mpsc::UnboundedSender<Event>,
}

impl HubHandle {
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Hand an event to the hub. Gives the event back if the hub is gone.
    pub(crate) fn send(&self, event: Event) -> std::result::Result<(), Event> {
        self.inbox
            .unbounded_send(event)
            .map_err(|e| e.into_inner())
    }
}

/// Start the hub task for `lobby`. It loads the lobby from the store before
/// serving its first event.
pub(crate) fn spawn(
    store: LobbyStore,
    settings: Settings,
    registry: Arc<LobbyRegistry>,
) -> HubHandle {
    let serial = registry.next_serial();
    let (inbox_tx, inbox_rx) = mpsc::unbounded();
    info!("{}: starting hub", store.lobby());
    tokio::spawn(run(store, settings, registry, serial, inbox_rx));
    HubHandle {
        serial,
        inbox: inbox_tx,
    }
}

async fn run(
    store: LobbyStore,
    settings: Settings,
    registry: Arc<LobbyRegistry>,
    serial: u64,
    mut inbox: mpsc::UnboundedReceiver<Event>,
) {
    let lobby = store.lobby();
    let table = match Table::load(store, &settings).await {
        Ok(table) => table,
        Err(e) => {
            error!("{}: could not load lobby: {}", lobby, e);
            registry.forget(lobby, serial).await;
            inbox.close();
            while let Some(event) = inbox.next().await {
                event.refuse(&e);
            }
            return;
        }
    };
    let mut hub = Hub {
        lobby,
        serial,
        table,
        members: BTreeMap::new(),
        outbox: VecDeque::new(),
        registry,
        inbox,
        pending: None,
    };
    loop {
        let event = match hub.pending.take() {
            Some(event) => event,
            None => match hub.inbox.next().await {
                Some(event) => event,
                None => break,
            },
        };
        hub.handle(event).await;
        if hub.members.is_empty() && hub.retire().await {
            break;
        }
    }
    info!("{}: hub stopped", lobby);
}

struct Member {
    player: PlayerId,
    outbound: mpsc::Sender<Notification>,
}

struct Hub {
    lobby: LobbyId,
    serial: u64,
    table: Table,
    members: BTreeMap<ConnectionId, Member>,
    // Notices waiting to be broadcast.
    outbox: VecDeque<Notification>,
    registry: Arc<LobbyRegistry>,
    inbox: mpsc::UnboundedReceiver<Event>,
    // An event that raced with teardown.
    pending: Option<Event>,
}

impl Hub {
    async fn handle(&mut self, event: Event) {
        match event {
            Event::Register {
                id,
                player,
                outbound,
                ack,
            } => self.register(id, player, outbound, ack).await,
            Event::Unregister { id } => {
                if let Some(member) = self.members.remove(&id) {
                    debug!("{}: {} unregistered {}", self.lobby, member.player, id);
                    let effects = self.depart(member.player).await;
                    self.absorb(effects).await;
                }
            }
            Event::Submit {
                id,
                player,
                action,
                reply,
            } => {
                if !self.members.contains_key(&id) {
                    let _ = reply.send(Err(Error::ClientUnreachable { player }));
                    return;
                }
                let effects = match self.table.apply(player, action).await {
                    Ok((accepted, effects)) => {
                        let _ = reply.send(Ok(Outcome::Accepted(accepted)));
                        effects
                    }
                    Err(e) => {
                        debug!("{}: rejected action of {}: {}", self.lobby, player, e);
                        let mut effects = Effects {
                            changed: true,
                            ..Effects::default()
                        };
                        effects.alerts.extend(Notification::for_error(&e));
                        let _ = reply.send(Ok(Outcome::from(Err(e))));
                        effects
                    }
                };
                self.absorb(effects).await;
            }
            Event::Snapshot { id, player, reply } => {
                let view = if self.members.contains_key(&id) {
                    Ok(self.table.view(player))
                } else {
                    Err(Error::ClientUnreachable { player })
                };
                let _ = reply.send(view);
            }
        }
        self.flush().await;
    }

    async fn register(
        &mut self,
        id: ConnectionId,
        player: PlayerId,
        outbound: mpsc::Sender<Notification>,
        ack: oneshot::Sender<Result<()>>,
    ) {
        match self.table.seat(player).await {
            Ok(first) => {
                self.members.insert(id, Member { player, outbound });
                info!("{}: {} registered {}", self.lobby, player, id);
                let _ = ack.send(Ok(()));
                let mut effects = Effects {
                    changed: true,
                    ..Effects::default()
                };
                if first {
                    effects.alerts.push(Notification::PlayerJoined { player });
                }
                self.absorb(effects).await;
            }
            Err(e) => {
                warn!("{}: could not seat {}: {}", self.lobby, player, e);
                let mut effects = Effects::default();
                effects.alerts.extend(Notification::for_error(&e));
                let _ = ack.send(Err(e));
                self.absorb(effects).await;
            }
        }
    }

    // Unseat `player` if that was their last connection.
    async fn depart(&mut self, player: PlayerId) -> Effects {
        if self.members.values().any(|member| member.player == player) {
            return Effects::default();
        }
        info!("{}: {} left", self.lobby, player);
        let mut effects = self.table.unseat(player).await;
        effects.alerts.insert(0, Notification::PlayerLeft { player });
        effects
    }

    // Close every connection of a kicked player, then unseat them.
    async fn expel(&mut self, player: PlayerId) -> Effects {
        let ids: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|(_, member)| member.player == player)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(mut member) = self.members.remove(&id) {
                let _ = member
                    .outbound
                    .try_send(Notification::PlayerKicked { player });
                member.outbound.close_channel();
            }
        }
        info!("{}: {} was kicked", self.lobby, player);
        let mut effects = self.depart(player).await;
        effects.alerts.insert(0, Notification::PlayerKicked { player });
        effects
    }

    // Let the table move on, then queue everything the lobby should hear.
    async fn absorb(&mut self, mut effects: Effects) {
        for player in std::mem::take(&mut effects.kicked) {
            let expelled = self.expel(player).await;
            effects.changed |= expelled.changed;
            effects.alerts.extend(expelled.alerts);
        }
        let advanced = self.table.advance().await;
        effects.changed |= advanced.changed;
        for notice in effects.alerts.into_iter().chain(advanced.alerts) {
            self.notify(notice);
        }
        if effects.changed {
            self.notify(Notification::StateChanged);
        }
    }

    fn notify(&mut self, notice: Notification) {
        if !self.outbox.contains(&notice) {
            self.outbox.push_back(notice);
        }
    }

    /// Broadcast queued notices, dropping every client that cannot keep up.
    async fn flush(&mut self) {
        while let Some(notice) = self.outbox.pop_front() {
            let mut dropped = vec![];
            for (id, member) in self.members.iter_mut() {
                if let Err(e) = member.outbound.try_send(notice.clone()) {
                    if e.is_full() {
                        warn!(
                            "{}: dropping {} of {}, outbound queue is full",
                            self.lobby, id, member.player
                        );
                    } else {
                        debug!("{}: {} of {} went away", self.lobby, id, member.player);
                    }
                    dropped.push(*id);
                }
            }
            for id in dropped {
                if let Some(member) = self.members.remove(&id) {
                    let effects = self.depart(member.player).await;
                    self.absorb(effects).await;
                }
            }
        }
    }

    /// Close the hub unless a client slipped in meanwhile.
    ///
    /// Runs under the registry lock, so no connect can hand this hub a new
    /// client between the last check of the inbox and the removal.
    async fn retire(&mut self) -> bool {
        if let Err(e) = self.table.release().await {
            warn!("{}: could not release memberships: {}", self.lobby, e);
        }
        let mut lobbies = self.registry.lock().await;
        match self.inbox.try_next() {
            Ok(Some(event)) => {
                self.pending = Some(event);
                false
            }
            Ok(None) | Err(_) => {
                if lobbies
                    .get(&self.lobby)
                    .map_or(false, |handle| handle.serial == self.serial)
                {
                    lobbies.remove(&self.lobby);
                }
                info!("{}: last client left, closing", self.lobby);
                true
            }
        }
    }
}
