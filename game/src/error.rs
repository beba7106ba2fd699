use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::model::{CardId, CardKind, LobbyId, PlayerId};
use crate::round::Phase;
use crate::store::StoreError;

/// Everything that can go wrong while driving a lobby.
///
/// Validation failures (`CardNotInHand`, `InvalidRoundTransition`,
/// `NotSeated`) only ever reach the caller that submitted the action.
/// `PoolUnavailable` and `DeckExhausted` block the round for everybody and
/// are additionally broadcast by the hub.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("card store unavailable: {}", source))]
    PoolUnavailable { source: StoreError },

    #[snafu(display("{} does not hold {}", player, card))]
    CardNotInHand { player: PlayerId, card: CardId },

    #[snafu(display("no {} cards left in the pool", kind))]
    DeckExhausted { kind: CardKind },

    #[snafu(display("cannot {} while the round is {:?}", action, phase))]
    InvalidRoundTransition { action: &'static str, phase: Phase },

    #[snafu(display("{} is no longer connected to the lobby", player))]
    ClientUnreachable { player: PlayerId },

    #[snafu(display("{} is not seated in the lobby", player))]
    NotSeated { player: PlayerId },

    #[snafu(display("{} does not exist", lobby))]
    UnknownLobby { lobby: LobbyId },
}

/// Wire-friendly classification of an `Error`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum ErrorKind {
    PoolUnavailable,
    CardNotInHand,
    DeckExhausted,
    InvalidRoundTransition,
    ClientUnreachable,
    NotSeated,
    UnknownLobby,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PoolUnavailable { .. } => ErrorKind::PoolUnavailable,
            Error::CardNotInHand { .. } => ErrorKind::CardNotInHand,
            Error::DeckExhausted { .. } => ErrorKind::DeckExhausted,
            Error::InvalidRoundTransition { .. } => ErrorKind::InvalidRoundTransition,
            Error::ClientUnreachable { .. } => ErrorKind::ClientUnreachable,
            Error::NotSeated { .. } => ErrorKind::NotSeated,
            Error::UnknownLobby { .. } => ErrorKind::UnknownLobby,
        }
    }

    /// Whether the whole lobby should hear about this failure.
    pub fn is_lobby_wide(&self) -> bool {
        matches!(
            self,
            Error::PoolUnavailable { .. } | Error::DeckExhausted { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
