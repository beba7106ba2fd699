//! An in-process `Store`.
//!
//! Holds decks, lobbies and the event log behind one async mutex, so each
//! commit is validated and applied as a unit. The server binary seeds it
//! from a file; tests build their fixtures through the same API.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::lock::Mutex;
use snafu::{ensure, OptionExt};

use crate::model::{Card, CardId, CardKind, DeckId, LobbyConfig, LobbyId, PlayerId};
use crate::store::{
    ConflictSnafu, Event, EventKind, HeldCard, LobbyState, MissingLobbySnafu, RoundRecord, Store,
    StoreError, UnreachableSnafu,
};

pub struct MemoryStore {
    reachable: AtomicBool,
    next_id: AtomicU32,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    cards: BTreeMap<CardId, Card>,
    decks: BTreeMap<DeckId, String>,
    lobbies: BTreeMap<LobbyId, LobbyRecord>,
    events: Vec<Event>,
}

struct LobbyRecord {
    config: LobbyConfig,
    cards: BTreeSet<CardId>,
    pool: BTreeSet<CardId>,
    hands: BTreeMap<PlayerId, BTreeMap<CardId, bool>>,
    board: BTreeMap<PlayerId, CardId>,
    spent: BTreeSet<CardId>,
    round: RoundRecord,
    players: BTreeSet<PlayerId>,
    wins: BTreeMap<PlayerId, u32>,
}

impl LobbyRecord {
    fn new(config: LobbyConfig) -> Self {
        LobbyRecord {
            config,
            cards: BTreeSet::new(),
            pool: BTreeSet::new(),
            hands: BTreeMap::new(),
            board: BTreeMap::new(),
            spent: BTreeSet::new(),
            round: RoundRecord::default(),
            players: BTreeSet::new(),
            wins: BTreeMap::new(),
        }
    }

    fn holds(&self, player: PlayerId, card: CardId) -> bool {
        self.hands
            .get(&player)
            .map_or(false, |hand| hand.contains_key(&card))
    }

    fn in_any_hand(&self, card: CardId) -> bool {
        self.hands.values().any(|hand| hand.contains_key(&card))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            reachable: AtomicBool::new(true),
            next_id: AtomicU32::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        ensure!(self.reachable.load(Ordering::Acquire), UnreachableSnafu);
        Ok(())
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn create_deck(&self, name: impl Into<String>) -> DeckId {
        let id = DeckId(self.next_id());
        self.inner.lock().await.decks.insert(id, name.into());
        id
    }

    pub async fn add_card(&self, deck: DeckId, kind: CardKind, text: impl Into<String>) -> CardId {
        self.add_special_card(deck, kind, text, None).await
    }

    pub async fn add_special_card(
        &self,
        deck: DeckId,
        kind: CardKind,
        text: impl Into<String>,
        category: Option<String>,
    ) -> CardId {
        let id = CardId(self.next_id());
        let card = Card {
            id,
            deck,
            kind,
            text: text.into(),
            category,
        };
        self.inner.lock().await.cards.insert(id, card);
        id
    }

    pub async fn create_lobby(&self, config: LobbyConfig) -> LobbyId {
        let id = LobbyId(self.next_id());
        self.insert_lobby(id, config).await;
        id
    }

    /// Create a lobby under a caller-chosen id, replacing any previous one.
    pub async fn insert_lobby(&self, id: LobbyId, config: LobbyConfig) {
        self.inner
            .lock()
            .await
            .lobbies
            .insert(id, LobbyRecord::new(config));
    }

    /// Put every card of `deck` into the lobby's pool.
    pub async fn add_deck_to_lobby(&self, lobby: LobbyId, deck: DeckId) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.decks.contains_key(&deck) {
            return Err(conflict(format!("{} does not exist", deck)));
        }
        let Inner { cards, lobbies, .. } = &mut *inner;
        let record = lobbies.get_mut(&lobby).context(MissingLobbySnafu { lobby })?;
        let mut added = 0;
        for card in cards.values().filter(|card| card.deck == deck) {
            if record.cards.insert(card.id) {
                record.pool.insert(card.id);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Recorded events of a lobby, oldest first.
    pub async fn events(&self, lobby: LobbyId) -> Vec<Event> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.lobby == lobby)
            .cloned()
            .collect()
    }

    /// Players with at least one win, by descending win count.
    pub async fn leaderboard(&self, lobby: LobbyId) -> Vec<(PlayerId, u32)> {
        let inner = self.inner.lock().await;
        let mut wins = BTreeMap::new();
        let won = inner
            .events
            .iter()
            .filter(|e| e.lobby == lobby && e.kind == EventKind::Win);
        for event in won {
            *wins.entry(event.player).or_insert(0) += 1;
        }
        let mut board: Vec<_> = wins.into_iter().collect();
        board.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        board
    }

    pub async fn members(&self, lobby: LobbyId) -> Vec<PlayerId> {
        self.inner
            .lock()
            .await
            .lobbies
            .get(&lobby)
            .map(|record| record.players.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn with_lobby<T>(
        &self,
        lobby: LobbyId,
        f: impl FnOnce(&mut LobbyRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        let record = inner
            .lobbies
            .get_mut(&lobby)
            .context(MissingLobbySnafu { lobby })?;
        f(record)
    }
}

fn conflict(detail: impl Into<String>) -> StoreError {
    StoreError::Conflict {
        detail: detail.into(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_lobby_state(&self, lobby: LobbyId) -> Result<LobbyState, StoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().await;
        let record = inner
            .lobbies
            .get(&lobby)
            .context(MissingLobbySnafu { lobby })?;
        Ok(LobbyState {
            config: record.config.clone(),
            cards: record
                .cards
                .iter()
                .filter_map(|id| inner.cards.get(id).cloned())
                .collect(),
            pool: record.pool.iter().copied().collect(),
            hands: record
                .hands
                .iter()
                .map(|(player, hand)| {
                    let held = hand
                        .iter()
                        .map(|(&card, &locked)| HeldCard { card, locked })
                        .collect();
                    (*player, held)
                })
                .collect(),
            board: record.board.clone(),
            spent: record.spent.iter().copied().collect(),
            round: record.round.clone(),
            players: record.players.iter().copied().collect(),
            wins: record.wins.clone(),
        })
    }

    async fn commit_draw(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        cards: &[CardId],
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if let Some(card) = cards.iter().find(|card| !record.pool.contains(*card)) {
                return Err(conflict(format!("{} is not in the pool", card)));
            }
            let hand = record.hands.entry(player).or_default();
            for card in cards {
                record.pool.remove(card);
                hand.insert(*card, false);
            }
            Ok(())
        })
        .await
    }

    async fn commit_judge(
        &self,
        lobby: LobbyId,
        round: u32,
        judge: PlayerId,
        prompt: CardId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if record.round.judge.is_some() {
                return Err(conflict("round already has a judge"));
            }
            if !record.pool.remove(&prompt) {
                return Err(conflict(format!("{} is not in the pool", prompt)));
            }
            record.round.number = round;
            record.round.judge = Some(judge);
            record.round.prompt = Some(prompt);
            Ok(())
        })
        .await
    }

    async fn commit_replace_prompt(
        &self,
        lobby: LobbyId,
        prompt: CardId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            let old = record
                .round
                .prompt
                .ok_or_else(|| conflict("round has no prompt"))?;
            if !record.pool.remove(&prompt) {
                return Err(conflict(format!("{} is not in the pool", prompt)));
            }
            record.spent.insert(old);
            record.round.prompt = Some(prompt);
            Ok(())
        })
        .await
    }

    async fn commit_play(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        card: CardId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if record.board.contains_key(&player) {
                return Err(conflict(format!("{} already played", player)));
            }
            if !record.holds(player, card) {
                return Err(conflict(format!("{} does not hold {}", player, card)));
            }
            if let Some(hand) = record.hands.get_mut(&player) {
                hand.remove(&card);
            }
            record.board.insert(player, card);
            Ok(())
        })
        .await
    }

    async fn commit_withdraw(&self, lobby: LobbyId, player: PlayerId) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            let card = record
                .board
                .remove(&player)
                .ok_or_else(|| conflict(format!("{} has nothing on the board", player)))?;
            record.hands.entry(player).or_default().insert(card, false);
            Ok(())
        })
        .await
    }

    async fn commit_discard(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        cards: &[CardId],
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if let Some(card) = cards.iter().find(|card| !record.holds(player, **card)) {
                return Err(conflict(format!("{} does not hold {}", player, card)));
            }
            if let Some(hand) = record.hands.get_mut(&player) {
                for card in cards {
                    hand.remove(card);
                    record.spent.insert(*card);
                }
            }
            Ok(())
        })
        .await
    }

    async fn commit_lock(
        &self,
        lobby: LobbyId,
        player: PlayerId,
        card: CardId,
        locked: bool,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            let slot = record
                .hands
                .get_mut(&player)
                .and_then(|hand| hand.get_mut(&card))
                .ok_or_else(|| conflict(format!("{} does not hold {}", player, card)))?;
            *slot = locked;
            Ok(())
        })
        .await
    }

    async fn commit_skip(&self, lobby: LobbyId, player: PlayerId) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if !record.round.skipped.contains(&player) {
                record.round.skipped.push(player);
            }
            Ok(())
        })
        .await
    }

    async fn commit_judge_select(
        &self,
        lobby: LobbyId,
        winner: PlayerId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            if !record.board.contains_key(&winner) {
                return Err(conflict(format!("{} has nothing on the board", winner)));
            }
            if record.round.winner.is_some() {
                return Err(conflict("round already has a winner"));
            }
            record.round.winner = Some(winner);
            *record.wins.entry(winner).or_insert(0) += 1;
            Ok(())
        })
        .await
    }

    async fn commit_return(&self, lobby: LobbyId, cards: &[CardId]) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            for card in cards {
                if !record.cards.contains(card) {
                    return Err(conflict(format!("{} does not belong to the lobby", card)));
                }
                if record.in_any_hand(*card) {
                    return Err(conflict(format!("{} is still held", card)));
                }
            }
            for card in cards {
                if record.pool.contains(card) {
                    continue;
                }
                record.board.retain(|_, played| played != card);
                record.spent.remove(card);
                if record.round.prompt == Some(*card) {
                    record.round.prompt = None;
                }
                record.pool.insert(*card);
            }
            Ok(())
        })
        .await
    }

    async fn commit_clear_round(
        &self,
        lobby: LobbyId,
        number: u32,
        last_judge: Option<PlayerId>,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            ensure!(
                record.board.is_empty() && record.round.prompt.is_none(),
                ConflictSnafu {
                    detail: "cards still in play",
                }
            );
            record.round = RoundRecord {
                number,
                last_judge,
                ..RoundRecord::default()
            };
            Ok(())
        })
        .await
    }

    async fn commit_hand_size(&self, lobby: LobbyId, hand_size: usize) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            let oversized = record.hands.values().any(|hand| hand.len() > hand_size);
            ensure!(
                !oversized,
                ConflictSnafu {
                    detail: "a hand holds more cards than the new size",
                }
            );
            record.config.hand_size = hand_size;
            Ok(())
        })
        .await
    }

    async fn record_event(&self, event: Event) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.inner.lock().await.events.push(event);
        Ok(())
    }

    async fn add_player_to_lobby(
        &self,
        lobby: LobbyId,
        player: PlayerId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            record.players.insert(player);
            Ok(())
        })
        .await
    }

    async fn remove_player_from_lobby(
        &self,
        lobby: LobbyId,
        player: PlayerId,
    ) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            record.players.remove(&player);
            Ok(())
        })
        .await
    }

    async fn release_lobby(&self, lobby: LobbyId) -> Result<(), StoreError> {
        self.with_lobby(lobby, |record| {
            record.players.clear();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (MemoryStore, LobbyId, Vec<CardId>) {
        let store = MemoryStore::new();
        let deck = store.create_deck("basics").await;
        let mut cards = vec![];
        for i in 0..3 {
            cards.push(store.add_card(deck, CardKind::Response, format!("r{}", i)).await);
        }
        let lobby = store.create_lobby(LobbyConfig::new("test")).await;
        store.add_deck_to_lobby(lobby, deck).await.unwrap();
        (store, lobby, cards)
    }

    #[tokio::test]
    async fn draw_is_all_or_nothing() {
        let (store, lobby, cards) = fixture().await;
        let p = PlayerId(100);
        store.commit_draw(lobby, p, &cards[..1]).await.unwrap();
        // the first card is no longer in the pool, so the whole draw fails
        let err = store.commit_draw(lobby, p, &cards).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let state = store.load_lobby_state(lobby).await.unwrap();
        assert_eq!(state.pool, cards[1..].to_vec());
        assert_eq!(state.hands[&p].len(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_rejects_commits() {
        let (store, lobby, cards) = fixture().await;
        store.set_reachable(false);
        let err = store
            .commit_draw(lobby, PlayerId(1), &cards[..1])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unreachable));
        store.set_reachable(true);
        assert_eq!(store.load_lobby_state(lobby).await.unwrap().pool.len(), 3);
    }

    #[tokio::test]
    async fn return_is_idempotent() {
        let (store, lobby, cards) = fixture().await;
        let p = PlayerId(7);
        store.commit_draw(lobby, p, &cards[..2]).await.unwrap();
        store.commit_play(lobby, p, cards[0]).await.unwrap();
        store.commit_discard(lobby, p, &cards[1..2]).await.unwrap();
        store.commit_return(lobby, &cards[..2]).await.unwrap();
        store.commit_return(lobby, &cards[..2]).await.unwrap();
        let state = store.load_lobby_state(lobby).await.unwrap();
        assert_eq!(state.pool.len(), 3);
        assert!(state.board.is_empty());
        assert!(state.spent.is_empty());
    }

    #[tokio::test]
    async fn unknown_deck_is_a_conflict() {
        let (store, lobby, _) = fixture().await;
        let err = store
            .add_deck_to_lobby(lobby, DeckId(9999))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn hand_size_cannot_undercut_a_hand() {
        let (store, lobby, cards) = fixture().await;
        store.commit_draw(lobby, PlayerId(1), &cards).await.unwrap();
        let err = store.commit_hand_size(lobby, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        store.commit_hand_size(lobby, 12).await.unwrap();
        let state = store.load_lobby_state(lobby).await.unwrap();
        assert_eq!(state.config.hand_size, 12);
    }

    #[tokio::test]
    async fn leaderboard_orders_by_wins() {
        let (store, lobby, _) = fixture().await;
        for (player, kind) in &[
            (PlayerId(1), EventKind::Play),
            (PlayerId(2), EventKind::Win),
            (PlayerId(2), EventKind::Win),
            (PlayerId(1), EventKind::Win),
        ] {
            store
                .record_event(Event {
                    kind: *kind,
                    lobby,
                    player: *player,
                    card: None,
                    category: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(
            store.leaderboard(lobby).await,
            vec![(PlayerId(2), 2), (PlayerId(1), 1)]
        );
    }
}
