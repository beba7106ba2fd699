use std::convert::From;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::model::{Card, CardId, CardKind, LobbyId, PlayerId};
use crate::round::Phase;

/// Every possible kind of request that a client may send.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Request {
    /// Submit a game-mutating action to the lobby.
    Act(Action),
    /// Ask for the current state of the lobby as seen by this player.
    Sync,
}

/// Every possible kind of response that a server may send.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Response {
    Notice(Notification),
    Outcome(Outcome),
    View(LobbyView),
}

// Auxillary macro for converting inner request/response types into their
// outermost counterparts.

macro_rules! derive_from {
    ($to:ident, $ty:ident, $r:ident) => {
        impl From<$r> for $to {
            fn from(r: $r) -> Self {
                $to::$ty(r)
            }
        }
    };
}

/// Game-mutating operations. The hub applies them one at a time, in
/// arrival order, for the whole lobby.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Action {
    /// Top the hand up to the lobby's hand size.
    Draw,
    /// Put a card from the hand on the board for this round.
    Play { card: CardId },
    /// Take this round's board entry back into the hand.
    Withdraw,
    /// Throw one card away and draw a replacement.
    Discard { card: CardId },
    /// Throw away every unlocked card and draw a fresh hand.
    DiscardAll,
    /// Lock or unlock a card; locked cards survive `DiscardAll`.
    Lock { card: CardId, locked: bool },
    /// Judge only: pick the winning board entry.
    JudgeSelect { winner: PlayerId },
    /// Judge only: let chance pick the winning board entry.
    PickRandomWinner,
    /// Pass `player` for this round. Sent by the judge or the player.
    Skip { player: PlayerId },
    /// Judge only: swap the prompt while the board is empty.
    SkipPrompt,
    /// Judge only, while judging: show an entry to the whole lobby.
    Reveal { player: PlayerId },
    /// Judge only, while judging: take an entry out of the running, or put
    /// it back.
    ToggleRuleOut { player: PlayerId },
    /// Vote `player` out of the lobby. A majority of the other seated
    /// players kicks them.
    VoteToKick { player: PlayerId },
    VoteToKickUndo { player: PlayerId },
    /// Change the lobby's hand size, clamped to 6..=16.
    SetHandSize { size: usize },
}

derive_from!(Request, Act, Action);

/// Pushed to every client of a lobby. These are hints to re-synchronize,
/// not state payloads.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Notification {
    StateChanged,
    PlayerJoined { player: PlayerId },
    PlayerLeft { player: PlayerId },
    /// Sent to the lobby, and to the kicked player before their connections
    /// are closed.
    PlayerKicked { player: PlayerId },
    DeckExhausted { kind: CardKind },
    PoolUnavailable,
}

derive_from!(Response, Notice, Notification);

impl Notification {
    /// The lobby-wide notice for an error, if the error is lobby-wide.
    pub fn for_error(e: &Error) -> Option<Self> {
        match e {
            Error::DeckExhausted { kind } => Some(Notification::DeckExhausted { kind: *kind }),
            Error::PoolUnavailable { .. } => Some(Notification::PoolUnavailable),
            _ => None,
        }
    }
}

/// The answer to one submitted action, sent only to its submitter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Outcome {
    Accepted(Reply),
    Rejected(Rejection),
}

derive_from!(Response, Outcome, Outcome);

impl From<Result<Reply, Error>> for Outcome {
    fn from(r: Result<Reply, Error>) -> Self {
        match r {
            Ok(reply) => Outcome::Accepted(reply),
            Err(e) => Outcome::Rejected(Rejection::from(&e)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Reply {
    /// The player's hand after the action.
    Hand { cards: Vec<CardId> },
    Done,
    Winner { player: PlayerId, card: CardId },
    RuledOut { player: PlayerId, ruled_out: bool },
    /// Standing of a kick vote after the action.
    Votes {
        player: PlayerId,
        votes: usize,
        needed: usize,
    },
    HandSize { size: usize },
}

derive_from!(Outcome, Accepted, Reply);

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
}

derive_from!(Outcome, Rejected, Rejection);

impl<'a> From<&'a Error> for Rejection {
    fn from(e: &'a Error) -> Self {
        Rejection {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HandCard {
    pub card: Card,
    pub locked: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BoardEntry {
    pub player: PlayerId,
    /// Hidden from everyone but its owner and the judge until revealed.
    pub card: Option<Card>,
    pub revealed: bool,
    pub ruled_out: bool,
}

/// One player's picture of a lobby.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LobbyView {
    pub lobby: LobbyId,
    pub name: String,
    pub hand_size: usize,
    pub player: PlayerId,
    pub round: u32,
    pub phase: Phase,
    pub judge: Option<PlayerId>,
    pub prompt: Option<Card>,
    pub board: Vec<BoardEntry>,
    pub skipped: Vec<PlayerId>,
    /// Winner of the most recently judged round.
    pub last_winner: Option<PlayerId>,
    pub hand: Vec<HandCard>,
    /// Seated players in the order they sat down.
    pub players: Vec<PlayerId>,
    /// Seated players in the order they will judge.
    pub upcoming_judges: Vec<PlayerId>,
    pub prompt_count: usize,
    pub response_count: usize,
    /// Win counts, most wins first.
    pub wins: Vec<(PlayerId, u32)>,
    /// Open kick votes per seated player.
    pub kick_votes: Vec<(PlayerId, usize)>,
}

derive_from!(Response, View, LobbyView);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_lobby_wide() {
        let e = Error::CardNotInHand {
            player: PlayerId(1),
            card: CardId(2),
        };
        assert_eq!(Notification::for_error(&e), None);
        let outcome = Outcome::from(Err(e));
        match outcome {
            Outcome::Rejected(r) => {
                assert_eq!(r.kind, ErrorKind::CardNotInHand);
                assert!(r.message.contains("card#2"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn exhaustion_is_broadcast() {
        let e = Error::DeckExhausted {
            kind: CardKind::Response,
        };
        assert_eq!(
            Notification::for_error(&e),
            Some(Notification::DeckExhausted {
                kind: CardKind::Response
            })
        );
    }
}
