use std::fmt;

use serde::{Deserialize, Serialize};

/// Hand-size target used when a lobby does not configure one.
pub const DEFAULT_HAND_SIZE: usize = 8;

/// Bounds for hand sizes chosen from inside a lobby.
pub const MIN_HAND_SIZE: usize = 6;
pub const MAX_HAND_SIZE: usize = 16;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(
            Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
        )]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(LobbyId, "lobby");
id_type!(PlayerId, "player");
id_type!(CardId, "card");
id_type!(DeckId, "deck");

/// Identifies one live connection; a player may hold several.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Distinguishes judge cards from the cards players answer with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum CardKind {
    /// Drawn by the judge at the start of each round.
    Prompt,
    /// Dealt into player hands and played to the board.
    Response,
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardKind::Prompt => f.write_str("prompt"),
            CardKind::Response => f.write_str("response"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Card {
    pub id: CardId,
    pub deck: DeckId,
    pub kind: CardKind,
    pub text: String,
    /// Open-ended tag for special cards; carried into leaderboard events.
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct LobbyConfig {
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default = "default_hand_size")]
    pub hand_size: usize,
}

fn default_hand_size() -> usize {
    DEFAULT_HAND_SIZE
}

impl LobbyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        LobbyConfig {
            name: name.into(),
            password_hash: None,
            hand_size: DEFAULT_HAND_SIZE,
        }
    }

    pub fn with_hand_size(mut self, hand_size: usize) -> Self {
        self.hand_size = hand_size;
        self
    }
}
