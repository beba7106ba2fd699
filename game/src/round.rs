//! Judge rotation and the per-round state machine.
//!
//! ```text
//! AwaitingJudge ──▶ AwaitingPlays ──▶ AwaitingJudgment ──▶ Resolved
//!       ▲                 │                                   │
//!       └──── abort ──────┴────────────── clear ──────────────┘
//! ```
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

use crate::error::{DeckExhaustedSnafu, InvalidRoundTransitionSnafu, Result};
use crate::model::{CardId, CardKind, PlayerId};
use crate::pool::CardPool;
use crate::store::{EventKind, LobbyStore, RoundRecord};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Phase {
    AwaitingJudge,
    AwaitingPlays,
    AwaitingJudgment,
    Resolved,
}

/// Players currently seated, in the order they first sat down.
///
/// The order survives players leaving so the judge rotation keeps its
/// place when someone drops out and comes back.
#[derive(Debug, Default, Clone)]
pub struct Seating {
    order: Vec<PlayerId>,
    present: BTreeSet<PlayerId>,
}

impl Seating {
    /// Returns true if the player was not seated before.
    pub fn sit(&mut self, player: PlayerId) -> bool {
        if !self.order.contains(&player) {
            self.order.push(player);
        }
        self.present.insert(player)
    }

    /// Returns true if the player was seated.
    pub fn leave(&mut self, player: PlayerId) -> bool {
        self.present.remove(&player)
    }

    pub fn is_seated(&self, player: PlayerId) -> bool {
        self.present.contains(&player)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn seated(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.order
            .iter()
            .copied()
            .filter(move |p| self.present.contains(p))
    }

    /// Seated players in judging order, starting after `last`.
    pub fn rotation_after(&self, last: Option<PlayerId>) -> Vec<PlayerId> {
        let start = last
            .and_then(|last| self.order.iter().position(|p| *p == last))
            .map_or(0, |i| i + 1);
        let n = self.order.len();
        (0..n)
            .map(|offset| self.order[(start + offset) % n])
            .filter(|p| self.present.contains(p))
            .collect()
    }

    /// The next judge after `last`, round-robin over seated players.
    pub fn next_after(&self, last: Option<PlayerId>) -> Option<PlayerId> {
        self.rotation_after(last).into_iter().next()
    }
}

/// What a round needs after plays, skips or departures were applied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Settled {
    /// Nothing changed phase.
    Unchanged,
    /// Every seated non-judge player has played or been skipped.
    ReadyForJudgment,
    /// Nobody is left to play; the round has to be aborted.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct Round {
    number: u32,
    phase: Phase,
    judge: Option<PlayerId>,
    prompt: Option<CardId>,
    last_judge: Option<PlayerId>,
    board: BTreeMap<PlayerId, CardId>,
    skipped: BTreeSet<PlayerId>,
    // Judge-side marks on board entries; not persisted, a reload aborts
    // the round anyway.
    revealed: BTreeSet<PlayerId>,
    ruled_out: BTreeSet<PlayerId>,
    winner: Option<PlayerId>,
}

impl Default for Round {
    fn default() -> Self {
        Round {
            number: 0,
            phase: Phase::AwaitingJudge,
            judge: None,
            prompt: None,
            last_judge: None,
            board: BTreeMap::new(),
            skipped: BTreeSet::new(),
            revealed: BTreeSet::new(),
            ruled_out: BTreeSet::new(),
            winner: None,
        }
    }
}

impl Round {
    /// Rebuild a round from its persisted pieces.
    pub fn restore(record: RoundRecord, board: BTreeMap<PlayerId, CardId>) -> Self {
        let phase = match (record.judge, record.winner) {
            (None, _) => Phase::AwaitingJudge,
            (Some(_), Some(_)) => Phase::Resolved,
            (Some(_), None) => Phase::AwaitingPlays,
        };
        Round {
            number: record.number,
            phase,
            judge: record.judge,
            prompt: record.prompt,
            last_judge: record.last_judge,
            board,
            skipped: record.skipped.into_iter().collect(),
            revealed: BTreeSet::new(),
            ruled_out: BTreeSet::new(),
            winner: record.winner,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn judge(&self) -> Option<PlayerId> {
        self.judge
    }

    pub fn last_judge(&self) -> Option<PlayerId> {
        self.last_judge
    }

    pub fn prompt(&self) -> Option<CardId> {
        self.prompt
    }

    pub fn winner(&self) -> Option<PlayerId> {
        self.winner
    }

    pub fn board(&self) -> &BTreeMap<PlayerId, CardId> {
        &self.board
    }

    pub fn entry(&self, player: PlayerId) -> Option<CardId> {
        self.board.get(&player).copied()
    }

    pub fn skipped(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.skipped.iter().copied()
    }

    pub fn is_revealed(&self, player: PlayerId) -> bool {
        self.revealed.contains(&player)
    }

    pub fn is_ruled_out(&self, player: PlayerId) -> bool {
        self.ruled_out.contains(&player)
    }

    /// Board entries the judge may still pick.
    pub fn contenders(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.board
            .keys()
            .copied()
            .filter(move |p| !self.ruled_out.contains(p))
    }

    pub fn is_judge(&self, player: PlayerId) -> bool {
        self.judge == Some(player)
    }

    /// A judge has been assigned and no winner picked yet.
    pub fn in_progress(&self) -> bool {
        matches!(self.phase, Phase::AwaitingPlays | Phase::AwaitingJudgment)
    }

    fn expect_phase(&self, phase: Phase, action: &'static str) -> Result<()> {
        ensure!(
            self.phase == phase,
            InvalidRoundTransitionSnafu {
                action,
                phase: self.phase,
            }
        );
        Ok(())
    }

    fn expect_judge(&self, player: PlayerId, action: &'static str) -> Result<()> {
        ensure!(
            self.is_judge(player),
            InvalidRoundTransitionSnafu {
                action,
                phase: self.phase,
            }
        );
        Ok(())
    }

    /// AwaitingJudge → AwaitingPlays: rotate the judge and deal them a prompt.
    ///
    /// Returns `Ok(false)` without doing anything when fewer than
    /// `min_players` are seated.
    pub async fn start(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        seating: &Seating,
        min_players: usize,
    ) -> Result<bool> {
        self.expect_phase(Phase::AwaitingJudge, "start a round")?;
        if seating.len() < min_players.max(2) {
            return Ok(false);
        }
        let judge = match seating.next_after(self.last_judge) {
            Some(judge) => judge,
            None => return Ok(false),
        };
        let prompt = pool.peek_prompt().context(DeckExhaustedSnafu {
            kind: CardKind::Prompt,
        })?;
        let number = self.number + 1;
        store.judge(number, judge, prompt).await?;
        pool.take(prompt);
        self.number = number;
        self.judge = Some(judge);
        self.prompt = Some(prompt);
        self.phase = Phase::AwaitingPlays;
        info!("{}: round {} judged by {}", store.lobby(), number, judge);
        Ok(true)
    }

    /// Validate that `player` may put a card on the board right now.
    pub fn check_play(&self, player: PlayerId) -> Result<()> {
        self.expect_phase(Phase::AwaitingPlays, "play a card")?;
        let allowed = !self.is_judge(player)
            && !self.board.contains_key(&player)
            && !self.skipped.contains(&player);
        ensure!(
            allowed,
            InvalidRoundTransitionSnafu {
                action: "play another card",
                phase: self.phase,
            }
        );
        Ok(())
    }

    pub(crate) fn place(&mut self, player: PlayerId, card: CardId) {
        self.board.insert(player, card);
    }

    /// Validate that `player` may take their board entry back.
    pub fn check_withdraw(&self, player: PlayerId) -> Result<CardId> {
        self.expect_phase(Phase::AwaitingPlays, "withdraw a card")?;
        self.entry(player).context(InvalidRoundTransitionSnafu {
            action: "withdraw without a board entry",
            phase: self.phase,
        })
    }

    pub(crate) fn unplace(&mut self, player: PlayerId) -> Option<CardId> {
        self.board.remove(&player)
    }

    /// Mark `player` as passed for this round. The judge or the player
    /// themself may ask for it.
    pub async fn skip(
        &mut self,
        store: &LobbyStore,
        seating: &Seating,
        by: PlayerId,
        player: PlayerId,
    ) -> Result<()> {
        self.expect_phase(Phase::AwaitingPlays, "skip a player")?;
        let allowed = (by == player || self.is_judge(by))
            && !self.is_judge(player)
            && !self.board.contains_key(&player)
            && seating.is_seated(player);
        ensure!(
            allowed,
            InvalidRoundTransitionSnafu {
                action: "skip that player",
                phase: self.phase,
            }
        );
        self.mark_skipped(store, player).await
    }

    /// Skip bookkeeping without the permission checks, for departures.
    pub(crate) async fn mark_skipped(&mut self, store: &LobbyStore, player: PlayerId) -> Result<()> {
        if self.board.contains_key(&player) || !self.skipped.insert(player) {
            return Ok(());
        }
        if let Err(e) = store.skip(player).await {
            self.skipped.remove(&player);
            return Err(e);
        }
        store.record(EventKind::Skip, player, None).await;
        debug!("{}: {} skipped in round {}", store.lobby(), player, self.number);
        Ok(())
    }

    /// Advance to AwaitingJudgment once every seated non-judge player has
    /// a board entry or was skipped.
    pub fn settle(&mut self, seating: &Seating) -> Settled {
        if self.phase != Phase::AwaitingPlays {
            return Settled::Unchanged;
        }
        let waiting = seating.seated().any(|p| {
            !self.is_judge(p) && !self.board.contains_key(&p) && !self.skipped.contains(&p)
        });
        if waiting {
            Settled::Unchanged
        } else if self.board.is_empty() {
            Settled::Abandoned
        } else {
            self.phase = Phase::AwaitingJudgment;
            Settled::ReadyForJudgment
        }
    }

    /// AwaitingJudgment → Resolved. Returns the winning card.
    pub async fn select_winner(
        &mut self,
        pool: &CardPool,
        store: &LobbyStore,
        by: PlayerId,
        winner: PlayerId,
    ) -> Result<CardId> {
        self.expect_phase(Phase::AwaitingJudgment, "pick a winner")?;
        self.expect_judge(by, "pick a winner without being the judge")?;
        let card = self.entry(winner).context(InvalidRoundTransitionSnafu {
            action: "pick a player without a board entry",
            phase: self.phase,
        })?;
        ensure!(
            !self.ruled_out.contains(&winner),
            InvalidRoundTransitionSnafu {
                action: "pick a ruled out entry",
                phase: self.phase,
            }
        );
        store.judge_select(winner).await?;
        self.winner = Some(winner);
        self.phase = Phase::Resolved;
        store.record(EventKind::Win, winner, pool.card(card)).await;
        info!(
            "{}: {} won round {} with {}",
            store.lobby(),
            winner,
            self.number,
            card
        );
        Ok(card)
    }

    /// Show `player`'s entry to the whole lobby while judging.
    pub fn reveal(&mut self, by: PlayerId, player: PlayerId) -> Result<bool> {
        self.check_mark(by, player, "reveal an entry")?;
        Ok(self.revealed.insert(player))
    }

    /// Flip whether `player`'s entry is still in the running. Returns the
    /// new state.
    pub fn toggle_rule_out(&mut self, by: PlayerId, player: PlayerId) -> Result<bool> {
        self.check_mark(by, player, "rule out an entry")?;
        if self.ruled_out.remove(&player) {
            Ok(false)
        } else {
            self.ruled_out.insert(player);
            Ok(true)
        }
    }

    fn check_mark(&self, by: PlayerId, player: PlayerId, action: &'static str) -> Result<()> {
        self.expect_phase(Phase::AwaitingJudgment, action)?;
        self.expect_judge(by, action)?;
        ensure!(
            self.board.contains_key(&player),
            InvalidRoundTransitionSnafu {
                action,
                phase: self.phase,
            }
        );
        Ok(())
    }

    /// Swap the prompt for a fresh one while the board is still empty.
    /// The old prompt stays out of play until the round clears.
    pub async fn replace_prompt(
        &mut self,
        pool: &mut CardPool,
        store: &LobbyStore,
        by: PlayerId,
    ) -> Result<CardId> {
        self.expect_phase(Phase::AwaitingPlays, "skip the prompt")?;
        self.expect_judge(by, "skip the prompt without being the judge")?;
        ensure!(
            self.board.is_empty(),
            InvalidRoundTransitionSnafu {
                action: "skip the prompt after cards were played",
                phase: self.phase,
            }
        );
        let prompt = pool.peek_prompt().context(DeckExhaustedSnafu {
            kind: CardKind::Prompt,
        })?;
        store.replace_prompt(prompt).await?;
        pool.take(prompt);
        pool.retire(self.prompt.replace(prompt));
        Ok(prompt)
    }

    /// Resolved → AwaitingJudge: every card in play goes back to the pool.
    ///
    /// Clearing a round that is not resolved does nothing, so a repeated
    /// clear never returns cards twice. Returns how many cards moved.
    pub async fn clear(&mut self, pool: &mut CardPool, store: &LobbyStore) -> Result<usize> {
        if self.phase != Phase::Resolved {
            return Ok(0);
        }
        self.reset(pool, store).await
    }

    /// End an in-progress round without a winner.
    pub async fn abort(&mut self, pool: &mut CardPool, store: &LobbyStore) -> Result<usize> {
        if !self.in_progress() {
            return Ok(0);
        }
        info!("{}: round {} aborted", store.lobby(), self.number);
        self.reset(pool, store).await
    }

    // Both commits land before anything changes here. A failed clear leaves
    // the round as it was; returning cards again is a no-op in the store.
    async fn reset(&mut self, pool: &mut CardPool, store: &LobbyStore) -> Result<usize> {
        let cards: Vec<CardId> = self
            .board
            .values()
            .copied()
            .chain(self.prompt)
            .chain(pool.spent())
            .collect();
        let returning = pool.returning(&cards);
        if !returning.is_empty() {
            store.return_cards(&returning).await?;
        }
        store.clear_round(self.number, self.judge).await?;
        pool.restore(&returning);
        self.board.clear();
        self.prompt = None;
        self.last_judge = self.judge.take();
        self.skipped.clear();
        self.revealed.clear();
        self.ruled_out.clear();
        self.winner = None;
        self.phase = Phase::AwaitingJudge;
        Ok(returning.len())
    }
}
