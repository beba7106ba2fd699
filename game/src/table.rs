//! The game state of one lobby, owned by its hub task.
//!
//! `Table` glues the card pool, the hands, the seating and the current round
//! together and turns client actions into store commits. It is never shared:
//! the hub applies one action at a time, which is what keeps draws, plays
//! and round transitions from interleaving.
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use snafu::{ensure, OptionExt};

use crate::error::{Error, InvalidRoundTransitionSnafu, NotSeatedSnafu, Result};
use crate::hand::{HandManager, Refill};
use crate::model::{CardKind, LobbyConfig, PlayerId, MAX_HAND_SIZE, MIN_HAND_SIZE};
use crate::pool::CardPool;
use crate::protocol::{Action, BoardEntry, HandCard, LobbyView, Notification, Reply};
use crate::round::{Phase, Round, Seating, Settled};
use crate::server::Settings;
use crate::store::{LobbyStore, StoreError};

/// What happened to the lobby as a side effect of an event.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Effects {
    /// Something observable changed.
    pub changed: bool,
    /// Lobby-wide notices, without duplicates.
    pub alerts: Vec<Notification>,
    /// Players voted out; the hub closes their connections.
    pub kicked: Vec<PlayerId>,
}

impl Effects {
    fn alert(&mut self, notice: Notification) {
        if !self.alerts.contains(&notice) {
            self.alerts.push(notice);
        }
    }

    fn fail(&mut self, e: &Error) {
        if let Some(notice) = Notification::for_error(e) {
            self.alert(notice);
        }
    }
}

pub struct Table {
    store: LobbyStore,
    config: LobbyConfig,
    pool: CardPool,
    hands: HandManager,
    round: Round,
    seating: Seating,
    wins: BTreeMap<PlayerId, u32>,
    last_winner: Option<PlayerId>,
    // Who voted to kick whom. Only seated players show up on either side.
    kick_votes: BTreeMap<PlayerId, BTreeSet<PlayerId>>,
    min_players: usize,
    rng: StdRng,
    // No prompt was left the last time a round tried to start.
    starved: bool,
}

impl Table {
    /// Rebuild the lobby from the store.
    ///
    /// Nobody is seated in a freshly loaded table, so a round left in
    /// progress by an earlier session is aborted and its cards returned.
    pub async fn load(store: LobbyStore, settings: &Settings) -> Result<Self> {
        let state = store.load().await.map_err(|e| match e {
            StoreError::MissingLobby { lobby } => Error::UnknownLobby { lobby },
            source => Error::PoolUnavailable { source },
        })?;
        let mut rng = match settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pool = CardPool::new(
            state.cards,
            state.pool,
            state.spent,
            StdRng::seed_from_u64(rng.gen()),
        );
        let mut table = Table {
            hands: HandManager::new(state.config.hand_size, state.hands),
            round: Round::restore(state.round, state.board),
            config: state.config,
            pool,
            seating: Seating::default(),
            wins: state.wins,
            last_winner: None,
            kick_votes: BTreeMap::new(),
            min_players: settings.min_players,
            rng,
            starved: false,
            store,
        };
        if table.round.phase() == Phase::Resolved {
            table.round.clear(&mut table.pool, &table.store).await?;
        } else {
            table.round.abort(&mut table.pool, &table.store).await?;
        }
        debug!(
            "{}: loaded {} cards, round {}",
            table.store.lobby(),
            table.pool.total(),
            table.round.number()
        );
        Ok(table)
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.round.phase()
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn seating(&self) -> &Seating {
        &self.seating
    }

    pub fn hands(&self) -> &HandManager {
        &self.hands
    }

    pub fn pool(&self) -> &CardPool {
        &self.pool
    }

    pub fn is_seated(&self, player: PlayerId) -> bool {
        self.seating.is_seated(player)
    }

    /// Persist the player's membership and seat them. Returns true if they
    /// were not seated before.
    pub async fn seat(&mut self, player: PlayerId) -> Result<bool> {
        if self.seating.is_seated(player) {
            return Ok(false);
        }
        self.store.add_player(player).await?;
        Ok(self.seating.sit(player))
    }

    /// Remove a player whose last connection went away.
    ///
    /// A departing judge aborts the round. Any other player who has not
    /// played yet counts as skipped.
    pub async fn unseat(&mut self, player: PlayerId) -> Effects {
        let mut effects = Effects::default();
        if !self.seating.leave(player) {
            return effects;
        }
        effects.changed = true;
        self.forget_votes(player);
        if let Err(e) = self.store.remove_player(player).await {
            warn!(
                "{}: could not drop membership of {}: {}",
                self.store.lobby(),
                player,
                e
            );
        }
        if !self.round.in_progress() {
            return effects;
        }
        if self.round.is_judge(player) {
            self.abort_round(&mut effects).await;
            return effects;
        }
        if self.round.phase() == Phase::AwaitingPlays && self.round.entry(player).is_none() {
            if let Err(e) = self.round.mark_skipped(&self.store, player).await {
                warn!("{}: could not skip {}: {}", self.store.lobby(), player, e);
                effects.fail(&e);
            }
        }
        self.settle(&mut effects).await;
        effects
    }

    /// Apply one client action on behalf of `player`.
    pub async fn apply(&mut self, player: PlayerId, action: Action) -> Result<(Reply, Effects)> {
        ensure!(self.seating.is_seated(player), NotSeatedSnafu { player });
        let mut effects = Effects {
            changed: true,
            ..Effects::default()
        };
        let reply = match action {
            Action::Draw => {
                let refill = self
                    .hands
                    .ensure_hand_size(&mut self.pool, &self.store, player)
                    .await?;
                refilled(refill, &mut effects)
            }
            Action::Play { card } => {
                self.hands
                    .play(&mut self.round, &self.pool, &self.store, player, card)
                    .await?;
                self.settle(&mut effects).await;
                self.hand_of(player)
            }
            Action::Withdraw => {
                let cards = self
                    .hands
                    .withdraw(&mut self.round, &self.store, player)
                    .await?;
                Reply::Hand { cards }
            }
            Action::Discard { card } => {
                let refill = self
                    .hands
                    .discard(&mut self.pool, &self.store, player, card)
                    .await?;
                refilled(refill, &mut effects)
            }
            Action::DiscardAll => {
                let refill = self
                    .hands
                    .discard_all(&mut self.pool, &self.store, player)
                    .await?;
                refilled(refill, &mut effects)
            }
            Action::Lock { card, locked } => {
                let cards = self.hands.lock(&self.store, player, card, locked).await?;
                Reply::Hand { cards }
            }
            Action::JudgeSelect { winner } => self.judge(player, winner, &mut effects).await?,
            Action::PickRandomWinner => {
                let winner = self
                    .round
                    .contenders()
                    .choose(&mut self.rng)
                    .context(InvalidRoundTransitionSnafu {
                        action: "pick a random winner",
                        phase: self.round.phase(),
                    })?;
                self.judge(player, winner, &mut effects).await?
            }
            Action::Skip { player: skipped } => {
                self.round
                    .skip(&self.store, &self.seating, player, skipped)
                    .await?;
                self.settle(&mut effects).await;
                Reply::Done
            }
            Action::SkipPrompt => {
                self.round
                    .replace_prompt(&mut self.pool, &self.store, player)
                    .await?;
                Reply::Done
            }
            Action::Reveal { player: owner } => {
                effects.changed = self.round.reveal(player, owner)?;
                Reply::Done
            }
            Action::ToggleRuleOut { player: owner } => {
                let ruled_out = self.round.toggle_rule_out(player, owner)?;
                Reply::RuledOut {
                    player: owner,
                    ruled_out,
                }
            }
            Action::VoteToKick { player: subject } => {
                self.vote_to_kick(player, subject, &mut effects)?
            }
            Action::VoteToKickUndo { player: subject } => {
                if let Some(voters) = self.kick_votes.get_mut(&subject) {
                    voters.remove(&player);
                    if voters.is_empty() {
                        self.kick_votes.remove(&subject);
                    }
                }
                Reply::Votes {
                    player: subject,
                    votes: self.votes_against(subject),
                    needed: self.votes_needed(),
                }
            }
            Action::SetHandSize { size } => {
                let size = size.clamp(MIN_HAND_SIZE, MAX_HAND_SIZE);
                self.resize_hands(size).await?;
                Reply::HandSize { size }
            }
        };
        Ok((reply, effects))
    }

    /// Move the round along on its own: clear a resolved round, abort one
    /// whose judge is gone or whose players all passed, and start a new one
    /// when enough players sit.
    pub async fn advance(&mut self) -> Effects {
        let mut effects = Effects::default();
        match self.round.phase() {
            Phase::Resolved => self.clear_round(&mut effects).await,
            phase @ Phase::AwaitingPlays | phase @ Phase::AwaitingJudgment => {
                let judge_gone = self
                    .round
                    .judge()
                    .map_or(false, |judge| !self.seating.is_seated(judge));
                if judge_gone {
                    self.abort_round(&mut effects).await;
                } else if phase == Phase::AwaitingPlays {
                    // Retries an abort that failed earlier.
                    self.settle(&mut effects).await;
                }
            }
            Phase::AwaitingJudge => {}
        }
        if self.round.phase() != Phase::AwaitingJudge {
            return effects;
        }
        let started = self
            .round
            .start(&mut self.pool, &self.store, &self.seating, self.min_players)
            .await;
        match started {
            Ok(true) => {
                self.starved = false;
                effects.changed = true;
            }
            Ok(false) => {}
            Err(e @ Error::DeckExhausted { .. }) => {
                if !self.starved {
                    warn!("{}: cannot start a round: {}", self.store.lobby(), e);
                    self.starved = true;
                    effects.fail(&e);
                }
            }
            Err(e) => {
                error!("{}: cannot start a round: {}", self.store.lobby(), e);
                effects.fail(&e);
            }
        }
        effects
    }

    /// The lobby as `player` is allowed to see it.
    ///
    /// Board cards show to their owner, to the judge once judging starts,
    /// and to everyone once revealed or after the round is decided.
    pub fn view(&self, player: PlayerId) -> LobbyView {
        let judging = self.round.phase() == Phase::AwaitingJudgment && self.round.is_judge(player);
        let decided = self.round.phase() == Phase::Resolved;
        let board = self
            .round
            .board()
            .iter()
            .map(|(&owner, &card)| {
                let revealed = self.round.is_revealed(owner);
                let visible = decided || judging || revealed || owner == player;
                BoardEntry {
                    player: owner,
                    card: if visible {
                        self.pool.card(card).cloned()
                    } else {
                        None
                    },
                    revealed,
                    ruled_out: self.round.is_ruled_out(owner),
                }
            })
            .collect();
        let hand = self
            .hands
            .hand(player)
            .map(|hand| {
                hand.held()
                    .filter_map(|held| {
                        self.pool.card(held.card).map(|card| HandCard {
                            card: card.clone(),
                            locked: held.locked,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut wins: Vec<(PlayerId, u32)> = self.wins.iter().map(|(p, w)| (*p, *w)).collect();
        wins.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        LobbyView {
            lobby: self.store.lobby(),
            name: self.config.name.clone(),
            hand_size: self.hands.target(),
            player,
            round: self.round.number(),
            phase: self.round.phase(),
            judge: self.round.judge(),
            prompt: self
                .round
                .prompt()
                .and_then(|card| self.pool.card(card))
                .cloned(),
            board,
            skipped: self.round.skipped().collect(),
            last_winner: self.last_winner,
            hand,
            players: self.seating.seated().collect(),
            upcoming_judges: self
                .seating
                .rotation_after(self.round.judge().or_else(|| self.round.last_judge())),
            prompt_count: self.pool.count(CardKind::Prompt),
            response_count: self.pool.count(CardKind::Response),
            wins,
            kick_votes: self
                .kick_votes
                .keys()
                .map(|subject| (*subject, self.votes_against(*subject)))
                .collect(),
        }
    }

    /// Drop every membership row; called when the last client left.
    pub async fn release(&self) -> Result<()> {
        self.store.release().await
    }

    fn hand_of(&self, player: PlayerId) -> Reply {
        let cards = self
            .hands
            .hand(player)
            .map(|hand| hand.cards().collect())
            .unwrap_or_default();
        Reply::Hand { cards }
    }

    async fn judge(
        &mut self,
        by: PlayerId,
        winner: PlayerId,
        effects: &mut Effects,
    ) -> Result<Reply> {
        let card = self
            .round
            .select_winner(&self.pool, &self.store, by, winner)
            .await?;
        *self.wins.entry(winner).or_insert(0) += 1;
        self.last_winner = Some(winner);
        self.clear_round(effects).await;
        Ok(Reply::Winner {
            player: winner,
            card,
        })
    }

    fn vote_to_kick(
        &mut self,
        voter: PlayerId,
        subject: PlayerId,
        effects: &mut Effects,
    ) -> Result<Reply> {
        ensure!(
            voter != subject,
            InvalidRoundTransitionSnafu {
                action: "vote to kick yourself",
                phase: self.round.phase(),
            }
        );
        ensure!(
            self.seating.is_seated(subject),
            NotSeatedSnafu { player: subject }
        );
        self.kick_votes.entry(subject).or_default().insert(voter);
        let votes = self.votes_against(subject);
        let needed = self.votes_needed();
        if votes >= needed {
            info!(
                "{}: {} voted out with {} of {} votes",
                self.store.lobby(),
                subject,
                votes,
                needed
            );
            self.kick_votes.remove(&subject);
            effects.kicked.push(subject);
        }
        Ok(Reply::Votes {
            player: subject,
            votes,
            needed,
        })
    }

    fn votes_against(&self, subject: PlayerId) -> usize {
        self.kick_votes.get(&subject).map_or(0, BTreeSet::len)
    }

    /// A strict majority of the seated players other than the subject.
    fn votes_needed(&self) -> usize {
        self.seating.len().saturating_sub(1) / 2 + 1
    }

    fn forget_votes(&mut self, player: PlayerId) {
        self.kick_votes.remove(&player);
        for voters in self.kick_votes.values_mut() {
            voters.remove(&player);
        }
        self.kick_votes.retain(|_, voters| !voters.is_empty());
    }

    /// Shrink oversized hands first, then store the new size. Growing hands
    /// fill up on the next draw.
    async fn resize_hands(&mut self, size: usize) -> Result<()> {
        let trimmed = self
            .hands
            .trim_to(&mut self.pool, &self.store, size)
            .await?;
        self.store.set_hand_size(size).await?;
        self.hands.set_target(size);
        self.config.hand_size = size;
        info!(
            "{}: hand size is now {}, {} cards trimmed",
            self.store.lobby(),
            size,
            trimmed
        );
        Ok(())
    }

    async fn settle(&mut self, effects: &mut Effects) {
        match self.round.settle(&self.seating) {
            Settled::Unchanged => {}
            Settled::ReadyForJudgment => effects.changed = true,
            Settled::Abandoned => self.abort_round(effects).await,
        }
    }

    async fn clear_round(&mut self, effects: &mut Effects) {
        effects.changed = true;
        match self.round.clear(&mut self.pool, &self.store).await {
            Ok(_) => self.replenish(effects).await,
            // Stays resolved; the next `advance` retries.
            Err(e) => {
                error!("{}: round clear failed: {}", self.store.lobby(), e);
                effects.fail(&e);
            }
        }
    }

    async fn abort_round(&mut self, effects: &mut Effects) {
        effects.changed = true;
        match self.round.abort(&mut self.pool, &self.store).await {
            Ok(_) => self.replenish(effects).await,
            Err(e) => {
                error!("{}: round abort failed: {}", self.store.lobby(), e);
                effects.fail(&e);
            }
        }
    }

    /// Top up every seated player's hand.
    async fn replenish(&mut self, effects: &mut Effects) {
        let players: Vec<PlayerId> = self.seating.seated().collect();
        for player in players {
            let refill = self
                .hands
                .ensure_hand_size(&mut self.pool, &self.store, player)
                .await;
            match refill {
                Ok(refill) => {
                    refilled(refill, effects);
                }
                Err(e) => {
                    warn!("{}: could not refill {}: {}", self.store.lobby(), player, e);
                    effects.fail(&e);
                    return;
                }
            }
        }
    }
}

fn refilled(refill: Refill, effects: &mut Effects) -> Reply {
    if refill.exhausted {
        effects.alert(Notification::DeckExhausted {
            kind: CardKind::Response,
        });
    }
    Reply::Hand { cards: refill.hand }
}
