//! Player hands: no duplicates, never more than the lobby's target size.
use std::collections::BTreeMap;

use log::debug;
use snafu::ensure;

use crate::error::{CardNotInHandSnafu, InvalidRoundTransitionSnafu, Result};
use crate::model::{CardId, CardKind, PlayerId};
use crate::pool::CardPool;
use crate::round::Round;
use crate::store::{EventKind, HeldCard, LobbyStore};

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Hand {
    // card -> locked
    cards: BTreeMap<CardId, bool>,
}

impl Hand {
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn contains(&self, card: CardId) -> bool {
        self.cards.contains_key(&card)
    }

    pub fn is_locked(&self, card: CardId) -> bool {
        self.cards.get(&card).copied().unwrap_or(false)
    }

    pub fn cards(&self) -> impl Iterator<Item = CardId> + '_ {
        self.cards.keys().copied()
    }

    pub fn held(&self) -> impl Iterator<Item = HeldCard> + '_ {
        self.cards
            .iter()
            .map(|(&card, &locked)| HeldCard { card, locked })
    }

    fn unlocked(&self) -> Vec<CardId> {
        self.cards
            .iter()
            .filter(|(_, locked)| !**locked)
            .map(|(card, _)| *card)
            .collect()
    }
}

/// Result of topping up a hand.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Refill {
    pub hand: Vec<CardId>,
    pub drawn: usize,
    /// The pool could not cover the whole deficit.
    pub exhausted: bool,
}

pub struct HandManager {
    target: usize,
    hands: BTreeMap<PlayerId, Hand>,
}

impl HandManager {
    pub fn new(target: usize, hands: BTreeMap<PlayerId, Vec<HeldCard>>) -> Self {
        let hands = hands
            .into_iter()
            .map(|(player, held)| {
                let cards = held.into_iter().map(|h| (h.card, h.locked)).collect();
                (player, Hand { cards })
            })
            .collect();
        HandManager { target, hands }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: usize) {
        self.target = target;
    }

    pub fn hand(&self, player: PlayerId) -> Option<&Hand> {
        self.hands.get(&player)
    }

    pub fn hands(&self) -> impl Iterator<Item = (PlayerId, &Hand)> + '_ {
        self.hands.iter().map(|(player, hand)| (*player, hand))
    }

    fn hand_mut(&mut self, player: PlayerId) -> &mut Hand {
        self.hands.entry(player).or_default()
    }

    fn ensure_holds(&self, player: PlayerId, card: CardId) -> Result<()> {
        let holds = self.hand(player).map_or(false, |hand| hand.contains(card));
        ensure!(holds, CardNotInHandSnafu { player, card });
        Ok(())
    }

    fn cards_of(&self, player: PlayerId) -> Vec<CardId> {
        self.hand(player)
            .map(|hand| hand.cards().collect())
            .unwrap_or_default()
    }

    /// Draw response cards until the hand reaches the target size.
    pub async fn ensure_hand_size(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        player: PlayerId,
    ) -> Result<Refill> {
        let held = self.hand_mut(player).len();
        let deficit = self.target.saturating_sub(held);
        let drawn = pool
            .draw(store, player, deficit, CardKind::Response)
            .await?;
        let hand = self.hand_mut(player);
        for card in &drawn.cards {
            hand.cards.insert(*card, false);
        }
        for card in &drawn.cards {
            store.record(EventKind::Draw, player, pool.card(*card)).await;
        }
        Ok(Refill {
            hand: self.cards_of(player),
            drawn: drawn.cards.len(),
            exhausted: drawn.exhausted,
        })
    }

    /// Move a card from the hand to the board. No replenishment happens
    /// until the round clears.
    pub async fn play(
        &mut self,
        round: &mut Round,
        pool: &CardPool,
        store: &LobbyStore,
        player: PlayerId,
        card: CardId,
    ) -> Result<()> {
        self.ensure_holds(player, card)?;
        round.check_play(player)?;
        store.play(player, card).await?;
        self.hand_mut(player).cards.remove(&card);
        round.place(player, card);
        store.record(EventKind::Play, player, pool.card(card)).await;
        debug!("{}: {} played {}", store.lobby(), player, card);
        Ok(())
    }

    /// Take a board entry back into the hand. Refused once the hand was
    /// topped up again, since the card would not fit.
    pub async fn withdraw(
        &mut self,
        round: &mut Round,
        store: &LobbyStore,
        player: PlayerId,
    ) -> Result<Vec<CardId>> {
        round.check_withdraw(player)?;
        let held = self.hand(player).map_or(0, Hand::len);
        ensure!(
            held < self.target,
            InvalidRoundTransitionSnafu {
                action: "withdraw into a full hand",
                phase: round.phase(),
            }
        );
        store.withdraw(player).await?;
        if let Some(card) = round.unplace(player) {
            self.hand_mut(player).cards.insert(card, false);
        }
        Ok(self.cards_of(player))
    }

    /// Throw one card away and draw a replacement.
    pub async fn discard(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        player: PlayerId,
        card: CardId,
    ) -> Result<Refill> {
        self.ensure_holds(player, card)?;
        self.throw_away(pool, store, player, vec![card]).await?;
        self.ensure_hand_size(pool, store, player).await
    }

    /// Throw away every unlocked card and draw back up to the target.
    pub async fn discard_all(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        player: PlayerId,
    ) -> Result<Refill> {
        let cards = self
            .hand(player)
            .map(Hand::unlocked)
            .unwrap_or_default();
        if !cards.is_empty() {
            self.throw_away(pool, store, player, cards).await?;
        }
        self.ensure_hand_size(pool, store, player).await
    }

    /// Shrink every hand to at most `target` cards. Unlocked cards go first;
    /// the surplus is spent like a discard. Returns how many cards went.
    pub async fn trim_to(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        target: usize,
    ) -> Result<usize> {
        let surplus: Vec<(PlayerId, Vec<CardId>)> = self
            .hands
            .iter()
            .filter(|(_, hand)| hand.len() > target)
            .map(|(player, hand)| {
                let extra = hand.len() - target;
                let locked = hand.cards().filter(|card| hand.is_locked(*card));
                let cards = hand.unlocked().into_iter().chain(locked).take(extra).collect();
                (*player, cards)
            })
            .collect();
        let mut trimmed = 0;
        for (player, cards) in surplus {
            trimmed += cards.len();
            self.throw_away(pool, store, player, cards).await?;
        }
        Ok(trimmed)
    }

    async fn throw_away(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        player: PlayerId,
        cards: Vec<CardId>,
    ) -> Result<()> {
        store.discard(player, &cards).await?;
        let hand = self.hand_mut(player);
        for card in &cards {
            hand.cards.remove(card);
        }
        for card in &cards {
            store.record(EventKind::Discard, player, pool.card(*card)).await;
        }
        pool.retire(cards);
        Ok(())
    }

    /// Locked cards survive `discard_all`.
    pub async fn lock(
        &mut self,
        store: &LobbyStore,
        player: PlayerId,
        card: CardId,
        locked: bool,
    ) -> Result<Vec<CardId>> {
        self.ensure_holds(player, card)?;
        store.lock(player, card, locked).await?;
        self.hand_mut(player).cards.insert(card, locked);
        Ok(self.cards_of(player))
    }
}
