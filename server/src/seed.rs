//! Startup content for the in-memory store: decks and the lobbies that use
//! them.
use std::collections::BTreeMap;

use config::{Config, ConfigError, File};
use log::info;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

use cardjudge_game::memory::MemoryStore;
use cardjudge_game::model::{CardKind, DeckId, LobbyConfig, LobbyId};
use cardjudge_game::store::StoreError;

#[derive(Debug, Snafu)]
pub enum SeedError {
    #[snafu(display("could not read seed file {}: {}", path, source))]
    Read { path: String, source: ConfigError },

    #[snafu(display("lobby {} uses unknown deck {:?}", lobby, deck))]
    UnknownDeck { lobby: LobbyId, deck: String },

    #[snafu(display("could not store lobby {}: {}", lobby, source))]
    Store { lobby: LobbyId, source: StoreError },
}

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub decks: Vec<DeckSeed>,
    #[serde(default)]
    pub lobbies: Vec<LobbySeed>,
}

#[derive(Debug, Deserialize)]
pub struct DeckSeed {
    pub name: String,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub specials: Vec<SpecialSeed>,
}

/// A card carrying a category tag.
#[derive(Debug, Deserialize)]
pub struct SpecialSeed {
    pub kind: CardKind,
    pub text: String,
    pub category: String,
}

#[derive(Debug, Deserialize)]
pub struct LobbySeed {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub hand_size: Option<usize>,
    pub decks: Vec<String>,
}

pub fn load(path: &str) -> Result<Seed, SeedError> {
    Config::builder()
        .add_source(File::with_name(path))
        .build()
        .and_then(|config| config.try_deserialize())
        .context(ReadSnafu { path })
}

impl Seed {
    /// Create every deck and lobby in `store`.
    pub async fn populate(&self, store: &MemoryStore) -> Result<(), SeedError> {
        let mut decks: BTreeMap<&str, DeckId> = BTreeMap::new();
        for deck in &self.decks {
            let id = store.create_deck(deck.name.as_str()).await;
            for text in &deck.prompts {
                store.add_card(id, CardKind::Prompt, text.as_str()).await;
            }
            for text in &deck.responses {
                store.add_card(id, CardKind::Response, text.as_str()).await;
            }
            for special in &deck.specials {
                store
                    .add_special_card(
                        id,
                        special.kind,
                        special.text.as_str(),
                        Some(special.category.clone()),
                    )
                    .await;
            }
            decks.insert(deck.name.as_str(), id);
        }
        for lobby in &self.lobbies {
            let id = LobbyId(lobby.id);
            let mut config = LobbyConfig::new(lobby.name.as_str());
            config.password_hash = lobby.password_hash.clone();
            if let Some(hand_size) = lobby.hand_size {
                config = config.with_hand_size(hand_size);
            }
            store.insert_lobby(id, config).await;
            for name in &lobby.decks {
                let deck = decks.get(name.as_str()).context(UnknownDeckSnafu {
                    lobby: id,
                    deck: name.as_str(),
                })?;
                let added = store
                    .add_deck_to_lobby(id, *deck)
                    .await
                    .context(StoreSnafu { lobby: id })?;
                info!("{}: added {} cards from {:?}", id, added, name);
            }
        }
        Ok(())
    }
}
