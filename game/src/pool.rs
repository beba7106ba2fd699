//! The lobby's card pool: which cards are available to be dealt.
use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;

use crate::error::Result;
use crate::model::{Card, CardId, CardKind, PlayerId};
use crate::store::LobbyStore;

/// Outcome of a draw. Fewer cards than requested means the pool ran dry
/// for that kind; that is reported, not treated as a failure.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Drawn {
    pub cards: Vec<CardId>,
    pub exhausted: bool,
}

pub struct CardPool {
    catalog: BTreeMap<CardId, Card>,
    available: BTreeSet<CardId>,
    // Out of play until the round clears: discards and replaced prompts.
    spent: BTreeSet<CardId>,
    rng: StdRng,
}

impl CardPool {
    pub fn new(
        cards: impl IntoIterator<Item = Card>,
        available: impl IntoIterator<Item = CardId>,
        spent: impl IntoIterator<Item = CardId>,
        rng: StdRng,
    ) -> Self {
        CardPool {
            catalog: cards.into_iter().map(|card| (card.id, card)).collect(),
            available: available.into_iter().collect(),
            spent: spent.into_iter().collect(),
            rng,
        }
    }

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.catalog.get(&id)
    }

    pub fn kind_of(&self, id: CardId) -> Option<CardKind> {
        self.catalog.get(&id).map(|card| card.kind)
    }

    pub fn is_available(&self, id: CardId) -> bool {
        self.available.contains(&id)
    }

    pub fn is_spent(&self, id: CardId) -> bool {
        self.spent.contains(&id)
    }

    /// Number of available cards of `kind`.
    pub fn count(&self, kind: CardKind) -> usize {
        self.available
            .iter()
            .filter(|id| self.kind_of(**id) == Some(kind))
            .count()
    }

    pub fn total(&self) -> usize {
        self.catalog.len()
    }

    pub fn spent(&self) -> impl Iterator<Item = CardId> + '_ {
        self.spent.iter().copied()
    }

    fn select(&mut self, kind: CardKind, count: usize) -> Vec<CardId> {
        let catalog = &self.catalog;
        self.available
            .iter()
            .copied()
            .filter(|id| catalog.get(id).map(|card| card.kind) == Some(kind))
            .choose_multiple(&mut self.rng, count)
    }

    /// Deal up to `count` cards of `kind` to `player`.
    ///
    /// The selection is committed to the store before the in-memory pool
    /// changes, so a failed commit leaves both untouched. The caller is
    /// responsible for putting the returned cards wherever they go (a hand
    /// or the judge slot).
    pub async fn draw(
        &mut self,
        store: &LobbyStore,
        player: PlayerId,
        count: usize,
        kind: CardKind,
    ) -> Result<Drawn> {
        if count == 0 {
            return Ok(Drawn::default());
        }
        let cards = self.select(kind, count);
        if !cards.is_empty() {
            store.draw(player, &cards).await?;
        }
        for card in &cards {
            self.available.remove(card);
        }
        let exhausted = cards.len() < count;
        if exhausted {
            debug!(
                "{}: {} wanted {} {} cards, pool had {}",
                store.lobby(),
                player,
                count,
                kind,
                cards.len()
            );
        }
        Ok(Drawn { cards, exhausted })
    }

    /// Pick one prompt card without committing it anywhere yet.
    pub fn peek_prompt(&mut self) -> Option<CardId> {
        self.select(CardKind::Prompt, 1).pop()
    }

    /// Mark a card taken out of the pool by a commit other than `draw`.
    pub(crate) fn take(&mut self, card: CardId) {
        self.available.remove(&card);
    }

    /// Park cards until the round clears.
    pub(crate) fn retire(&mut self, cards: impl IntoIterator<Item = CardId>) {
        self.spent.extend(cards);
    }

    /// Make `cards` available again.
    ///
    /// Cards that are already available are skipped, so returning the same
    /// set twice never duplicates anything. Returns how many cards moved.
    pub async fn return_to_pool(&mut self, store: &LobbyStore, cards: &[CardId]) -> Result<usize> {
        let returning = self.returning(cards);
        if returning.is_empty() {
            return Ok(0);
        }
        store.return_cards(&returning).await?;
        self.restore(&returning);
        Ok(returning.len())
    }

    /// The lobby cards among `cards` that are not available yet.
    pub(crate) fn returning(&self, cards: &[CardId]) -> Vec<CardId> {
        cards
            .iter()
            .copied()
            .filter(|id| self.catalog.contains_key(id) && !self.available.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Mark cards available after their return was committed.
    pub(crate) fn restore(&mut self, cards: &[CardId]) {
        for card in cards {
            self.spent.remove(card);
            self.available.insert(*card);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::LobbyConfig;
    use crate::store::Store;

    async fn fixture(responses: usize, prompts: usize) -> (Arc<MemoryStore>, LobbyStore, CardPool) {
        let memory = Arc::new(MemoryStore::new());
        let deck = memory.create_deck("test").await;
        for i in 0..responses {
            memory
                .add_card(deck, CardKind::Response, format!("response {}", i))
                .await;
        }
        for i in 0..prompts {
            memory
                .add_card(deck, CardKind::Prompt, format!("prompt {}", i))
                .await;
        }
        let lobby = memory.create_lobby(LobbyConfig::new("pool")).await;
        memory.add_deck_to_lobby(lobby, deck).await.unwrap();
        let state = memory.load_lobby_state(lobby).await.unwrap();
        let pool = CardPool::new(
            state.cards,
            state.pool,
            state.spent,
            StdRng::seed_from_u64(7),
        );
        (memory.clone(), LobbyStore::new(lobby, memory), pool)
    }

    #[tokio::test]
    async fn draw_only_takes_requested_kind() {
        let (_, store, mut pool) = fixture(5, 3).await;
        let drawn = pool
            .draw(&store, PlayerId(1), 4, CardKind::Prompt)
            .await
            .unwrap();
        assert_eq!(drawn.cards.len(), 3);
        assert!(drawn.exhausted);
        for card in &drawn.cards {
            assert_eq!(pool.kind_of(*card), Some(CardKind::Prompt));
        }
        assert_eq!(pool.count(CardKind::Prompt), 0);
        assert_eq!(pool.count(CardKind::Response), 5);
    }

    #[tokio::test]
    async fn draws_never_overlap() {
        let (_, store, mut pool) = fixture(10, 0).await;
        let a = pool
            .draw(&store, PlayerId(1), 6, CardKind::Response)
            .await
            .unwrap();
        let b = pool
            .draw(&store, PlayerId(2), 6, CardKind::Response)
            .await
            .unwrap();
        assert_eq!(a.cards.len(), 6);
        assert_eq!(b.cards.len(), 4);
        assert!(b.exhausted);
        assert!(a.cards.iter().all(|card| !b.cards.contains(card)));
    }

    #[tokio::test]
    async fn failed_commit_leaves_pool_untouched() {
        let (memory, store, mut pool) = fixture(4, 0).await;
        memory.set_reachable(false);
        let err = pool
            .draw(&store, PlayerId(1), 2, CardKind::Response)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PoolUnavailable);
        assert_eq!(pool.count(CardKind::Response), 4);
    }

    #[tokio::test]
    async fn returning_twice_does_not_duplicate() {
        let (memory, store, mut pool) = fixture(4, 0).await;
        let drawn = pool
            .draw(&store, PlayerId(1), 2, CardKind::Response)
            .await
            .unwrap();
        memory
            .commit_discard(store.lobby(), PlayerId(1), &drawn.cards)
            .await
            .unwrap();
        pool.retire(drawn.cards.iter().copied());
        assert_eq!(pool.return_to_pool(&store, &drawn.cards).await.unwrap(), 2);
        assert_eq!(pool.return_to_pool(&store, &drawn.cards).await.unwrap(), 0);
        assert_eq!(pool.count(CardKind::Response), 4);
        assert_eq!(pool.spent().count(), 0);
    }
}
