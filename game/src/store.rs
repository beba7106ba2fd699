//! The persistence collaborator.
//!
//! The engine treats the store as a transactional fact source: every
//! `commit_*` call is atomic from the store's point of view, and the hub
//! only mutates its in-memory copy of a lobby after the matching commit
//! succeeded. Multi-statement atomicity (draw, then play, then judge) comes
//! from the hub serializing actions, not from the store.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::error::{PoolUnavailableSnafu, Result};
use crate::model::{Card, CardId, CardKind, LobbyConfig, LobbyId, PlayerId};

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store is unreachable"))]
    Unreachable,

    #[snafu(display("{} is not known to the store", lobby))]
    MissingLobby { lobby: LobbyId },

    #[snafu(display("conflicting write: {}", detail))]
    Conflict { detail: String },
}

/// A card held in a player's hand.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HeldCard {
    pub card: CardId,
    pub locked: bool,
}

/// The persisted header of the lobby's current round.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct RoundRecord {
    pub number: u32,
    pub judge: Option<PlayerId>,
    pub prompt: Option<CardId>,
    /// The judge of the last cleared round, used for rotation.
    pub last_judge: Option<PlayerId>,
    pub skipped: Vec<PlayerId>,
    pub winner: Option<PlayerId>,
}

/// Everything the engine needs to rebuild a lobby's game state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LobbyState {
    pub config: LobbyConfig,
    /// Every card that belongs to the lobby, wherever it currently is.
    pub cards: Vec<Card>,
    pub pool: Vec<CardId>,
    pub hands: BTreeMap<PlayerId, Vec<HeldCard>>,
    pub board: BTreeMap<PlayerId, CardId>,
    /// Discards and replaced prompts, out of play until the round clears.
    pub spent: Vec<CardId>,
    pub round: RoundRecord,
    /// Players with a persisted membership row.
    pub players: Vec<PlayerId>,
    pub wins: BTreeMap<PlayerId, u32>,
}

impl LobbyState {
    /// Number of cards of `kind` currently available in the pool.
    pub fn pool_count(&self, kind: CardKind) -> usize {
        self.pool
            .iter()
            .filter(|id| {
                self.cards
                    .iter()
                    .any(|card| &card.id == *id && card.kind == kind)
            })
            .count()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum EventKind {
    Play,
    Win,
    Draw,
    Discard,
    Skip,
}

/// One leaderboard fact.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub lobby: LobbyId,
    pub player: PlayerId,
    pub card: Option<CardId>,
    pub category: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_lobby_state(&self, lobby: LobbyId) -> Result<LobbyState, StoreError>;

    /// Move `cards` from the pool into `player`'s hand.
    async fn commit_draw(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        cards: &[CardId],
    ) -> Result<(), StoreError>;

    /// Assign the round's judge and move `prompt` from the pool to the judge.
    async fn commit_judge(
        &self,
        lobby: LobbyId,
        round: u32,
        judge: PlayerId,
        prompt: CardId,
    ) -> Result<(), StoreError>;

    /// Swap the judge's prompt for `prompt`; the old one becomes spent.
    async fn commit_replace_prompt(&self, lobby: LobbyId, prompt: CardId)
        -> Result<(), StoreError>;

    /// Move `card` from `player`'s hand to the board.
    async fn commit_play(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        card: CardId,
    ) -> Result<(), StoreError>;

    /// Move `player`'s board entry back into their hand.
    async fn commit_withdraw(&self, lobby: LobbyId, player: PlayerId) -> Result<(), StoreError>;

    /// Move `cards` from `player`'s hand to the spent pile.
    async fn commit_discard(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        cards: &[CardId],
    ) -> Result<(), StoreError>;

    async fn commit_lock(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        card: CardId,
        locked: bool,
    ) -> Result<(), StoreError>;

    async fn commit_skip(&self, lobby: LobbyId, player: PlayerId) -> Result<(), StoreError>;

    async fn commit_judge_select(&self, lobby: LobbyId, winner: PlayerId)
        -> Result<(), StoreError>;

    /// Move `cards` from the board, judge slot or spent pile back to the pool.
    /// Cards already in the pool are left alone.
    async fn commit_return(&self, lobby: LobbyId, cards: &[CardId]) -> Result<(), StoreError>;

    /// Reset the round header for round `number`.
    async fn commit_clear_round(
        &self,
        lobby: LobbyId,
        number: u32,
        last_judge: Option<PlayerId>,
    ) -> Result<(), StoreError>;

    /// Change the lobby's hand-size target.
    async fn commit_hand_size(&self, lobby: LobbyId, hand_size: usize)
        -> Result<(), StoreError>;

    async fn record_event(&self, event: Event) -> Result<(), StoreError>;

    async fn add_player_to_lobby(&self, lobby: LobbyId, player: PlayerId)
        -> Result<(), StoreError>;

    async fn remove_player_from_lobby(
        &self,
        lobby: LobbyId,
        player: PlayerId,
    ) -> Result<(), StoreError>;

    /// Drop every remaining membership row of the lobby.
    async fn release_lobby(&self, lobby: LobbyId) -> Result<(), StoreError>;
}

/// A store handle scoped to one lobby.
///
/// Commits map store failures to `Error::PoolUnavailable`. Events are
/// best-effort: a failed write is logged and otherwise ignored.
#[derive(Clone)]
pub struct LobbyStore {
    lobby: LobbyId,
    store: Arc<dyn Store>,
}

impl LobbyStore {
    pub fn new(lobby: LobbyId, store: Arc<dyn Store>) -> Self {
        LobbyStore { lobby, store }
    }

    pub fn lobby(&self) -> LobbyId {
        self.lobby
    }

    pub async fn load(&self) -> Result<LobbyState, StoreError> {
        self.store.load_lobby_state(self.lobby).await
    }

    pub async fn draw(&self, player: PlayerId, cards: &[CardId]) -> Result<()> {
        self.store
            .commit_draw(self.lobby, player, cards)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn judge(&self, round: u32, judge: PlayerId, prompt: CardId) -> Result<()> {
        self.store
            .commit_judge(self.lobby, round, judge, prompt)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn replace_prompt(&self, prompt: CardId) -> Result<()> {
        self.store
            .commit_replace_prompt(self.lobby, prompt)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn play(&self, player: PlayerId, card: CardId) -> Result<()> {
        self.store
            .commit_play(self.lobby, player, card)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn withdraw(&self, player: PlayerId) -> Result<()> {
        self.store
            .commit_withdraw(self.lobby, player)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn discard(&self, player: PlayerId, cards: &[CardId]) -> Result<()> {
        self.store
            .commit_discard(self.lobby, player, cards)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn lock(&self, player: PlayerId, card: CardId, locked: bool) -> Result<()> {
        self.store
            .commit_lock(self.lobby, player, card, locked)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn skip(&self, player: PlayerId) -> Result<()> {
        self.store
            .commit_skip(self.lobby, player)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn judge_select(&self, winner: PlayerId) -> Result<()> {
        self.store
            .commit_judge_select(self.lobby, winner)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn return_cards(&self, cards: &[CardId]) -> Result<()> {
        self.store
            .commit_return(self.lobby, cards)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn clear_round(&self, number: u32, last_judge: Option<PlayerId>) -> Result<()> {
        self.store
            .commit_clear_round(self.lobby, number, last_judge)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn set_hand_size(&self, hand_size: usize) -> Result<()> {
        self.store
            .commit_hand_size(self.lobby, hand_size)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn record(&self, kind: EventKind, player: PlayerId, card: Option<&Card>) {
        let event = Event {
            kind,
            lobby: self.lobby,
            player,
            card: card.map(|c| c.id),
            category: card.and_then(|c| c.category.clone()),
        };
        if let Err(e) = self.store.record_event(event).await {
            warn!("{}: dropped {:?} event for {}: {}", self.lobby, kind, player, e);
        }
    }

    pub async fn add_player(&self, player: PlayerId) -> Result<()> {
        self.store
            .add_player_to_lobby(self.lobby, player)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn remove_player(&self, player: PlayerId) -> Result<()> {
        self.store
            .remove_player_from_lobby(self.lobby, player)
            .await
            .context(PoolUnavailableSnafu)
    }

    pub async fn release(&self) -> Result<()> {
        self.store
            .release_lobby(self.lobby)
            .await
            .context(PoolUnavailableSnafu)
    }
}
