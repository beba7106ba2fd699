use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::{sleep, timeout};

use cardjudge_game::memory::MemoryStore;
use cardjudge_game::model::{CardId, CardKind, LobbyConfig, LobbyId, PlayerId};
use cardjudge_game::protocol::{Action, Notification, Outcome, Reply};
use cardjudge_game::round::Phase;
use cardjudge_game::server::{Client, Core, Settings};
use cardjudge_game::store::Store;
use cardjudge_game::ErrorKind;

async fn lobby(memory: &MemoryStore, prompts: usize, responses: usize) -> LobbyId {
    let deck = memory.create_deck("party").await;
    for i in 0..prompts {
        memory
            .add_card(deck, CardKind::Prompt, format!("prompt {}", i))
            .await;
    }
    for i in 0..responses {
        memory
            .add_card(deck, CardKind::Response, format!("response {}", i))
            .await;
    }
    let lobby = memory.create_lobby(LobbyConfig::new("party")).await;
    memory
        .add_deck_to_lobby(lobby, deck)
        .await
        .expect("lobby to exist");
    lobby
}

fn start_core(memory: &Arc<MemoryStore>, outbound_capacity: usize) -> Core {
    let settings = Settings {
        outbound_capacity,
        rng_seed: Some(11),
        ..Settings::default()
    };
    Core::new(settings, memory.clone())
}

async fn connect(core: &Core, lobby: LobbyId, player: u32) -> Client {
    core.connect(lobby, PlayerId(player))
        .await
        .expect("connect to succeed")
}

async fn act(client: &Client, action: Action) -> Reply {
    match client.send(action).await.expect("hub to answer") {
        Outcome::Accepted(reply) => reply,
        Outcome::Rejected(rejection) => panic!("rejected: {:?}", rejection),
    }
}

fn hand(reply: Reply) -> Vec<CardId> {
    match reply {
        Reply::Hand { cards } => cards,
        other => panic!("expected a hand, got {:?}", other),
    }
}

async fn next_notice(client: &mut Client) -> Notification {
    timeout(Duration::from_secs(5), client.receive())
        .await
        .expect("a notice in time")
        .expect("client to be registered")
}

async fn wait_for(client: &mut Client, wanted: Notification) {
    while next_notice(client).await != wanted {}
}

// Every notice already queued for `client`, after a round trip through the
// hub made sure nothing is still on its way.
async fn drain(client: &mut Client) -> Vec<Notification> {
    client.snapshot().await.expect("snapshot");
    let mut notices = vec![];
    while let Some(Some(notice)) = client.receive().now_or_never() {
        notices.push(notice);
    }
    notices
}

// Every card of the lobby is in exactly one place.
async fn audit(memory: &MemoryStore, lobby: LobbyId) {
    let state = memory
        .load_lobby_state(lobby)
        .await
        .expect("state to load");
    let mut seen = BTreeSet::new();
    let located = state
        .pool
        .iter()
        .copied()
        .chain(state.hands.values().flatten().map(|held| held.card))
        .chain(state.board.values().copied())
        .chain(state.round.prompt)
        .chain(state.spent.iter().copied());
    for card in located {
        assert!(seen.insert(card), "{} is in two places", card);
    }
    assert_eq!(seen.len(), state.cards.len());
    for held in state.hands.values() {
        assert!(held.len() <= state.config.hand_size);
    }
}

#[tokio::test]
async fn second_player_gets_what_is_left() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 1, 10).await;
    let core = start_core(&memory, 64);
    let mut a = connect(&core, lobby, 1).await;
    let mut b = connect(&core, lobby, 2).await;

    assert_eq!(hand(act(&a, Action::Draw).await).len(), 8);
    assert_eq!(hand(act(&b, Action::Draw).await).len(), 2);

    let exhausted = Notification::DeckExhausted {
        kind: CardKind::Response,
    };
    wait_for(&mut a, exhausted.clone()).await;
    wait_for(&mut b, exhausted).await;
    audit(&memory, lobby).await;
}

#[tokio::test]
async fn disconnect_counts_as_skip() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 60).await;
    let core = start_core(&memory, 64);
    let judge = connect(&core, lobby, 1).await;
    let two = connect(&core, lobby, 2).await;
    let three = connect(&core, lobby, 3).await;
    let four = connect(&core, lobby, 4).await;

    let view = judge.snapshot().await.expect("snapshot");
    assert_eq!(view.phase, Phase::AwaitingPlays);
    assert_eq!(view.judge, Some(PlayerId(1)));

    for player in &[&two, &three] {
        let cards = hand(act(player, Action::Draw).await);
        act(player, Action::Play { card: cards[0] }).await;
    }
    act(&four, Action::Draw).await;
    drop(four);

    let view = judge.snapshot().await.expect("snapshot");
    assert_eq!(view.phase, Phase::AwaitingJudgment);
    assert_eq!(view.board.len(), 2);
    assert_eq!(view.skipped, vec![PlayerId(4)]);
    assert!(view.board.iter().all(|entry| entry.card.is_some()));
    audit(&memory, lobby).await;
}

#[tokio::test]
async fn full_round_rotates_the_judge() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 60).await;
    let core = start_core(&memory, 64);
    let mut judge = connect(&core, lobby, 1).await;
    let two = connect(&core, lobby, 2).await;
    let three = connect(&core, lobby, 3).await;

    let mut winning = None;
    for player in &[&two, &three] {
        let cards = hand(act(player, Action::Draw).await);
        act(player, Action::Play { card: cards[0] }).await;
        winning.get_or_insert(cards[0]);
    }
    drain(&mut judge).await;

    let reply = act(
        &judge,
        Action::JudgeSelect {
            winner: PlayerId(2),
        },
    )
    .await;
    assert_eq!(
        reply,
        Reply::Winner {
            player: PlayerId(2),
            card: winning.expect("a card was played"),
        }
    );
    wait_for(&mut judge, Notification::StateChanged).await;

    let view = three.snapshot().await.expect("snapshot");
    assert_eq!(view.round, 2);
    assert_eq!(view.judge, Some(PlayerId(2)));
    assert_eq!(view.phase, Phase::AwaitingPlays);
    assert_eq!(view.last_winner, Some(PlayerId(2)));
    assert_eq!(view.wins, vec![(PlayerId(2), 1)]);
    assert_eq!(view.hand.len(), 8);
    audit(&memory, lobby).await;
}

#[tokio::test]
async fn rejections_are_answered_privately() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 30).await;
    let core = start_core(&memory, 64);
    let a = connect(&core, lobby, 1).await;
    let mut b = connect(&core, lobby, 2).await;
    drain(&mut b).await;

    let outcome = a
        .send(Action::Discard { card: CardId(4242) })
        .await
        .expect("hub to answer");
    match outcome {
        Outcome::Rejected(rejection) => assert_eq!(rejection.kind, ErrorKind::CardNotInHand),
        other => panic!("unexpected outcome {:?}", other),
    }
    // the others only hear that something may have changed
    assert_eq!(drain(&mut b).await, vec![Notification::StateChanged]);
}

#[tokio::test]
async fn kicked_player_is_disconnected() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 60).await;
    let core = start_core(&memory, 64);
    let one = connect(&core, lobby, 1).await;
    let mut two = connect(&core, lobby, 2).await;
    let mut three = connect(&core, lobby, 3).await;
    act(&three, Action::Draw).await;
    drain(&mut two).await;

    let reply = act(
        &one,
        Action::VoteToKick {
            player: PlayerId(3),
        },
    )
    .await;
    assert_eq!(
        reply,
        Reply::Votes {
            player: PlayerId(3),
            votes: 1,
            needed: 2,
        }
    );
    let reply = act(
        &two,
        Action::VoteToKick {
            player: PlayerId(3),
        },
    )
    .await;
    assert_eq!(
        reply,
        Reply::Votes {
            player: PlayerId(3),
            votes: 2,
            needed: 2,
        }
    );

    let kicked = Notification::PlayerKicked {
        player: PlayerId(3),
    };
    wait_for(&mut three, kicked.clone()).await;
    while three.receive().await.is_some() {}
    wait_for(&mut two, kicked).await;
    wait_for(
        &mut two,
        Notification::PlayerLeft {
            player: PlayerId(3),
        },
    )
    .await;

    let err = three
        .send(Action::Draw)
        .await
        .err()
        .expect("kicked client to be gone");
    assert_eq!(err.kind(), ErrorKind::ClientUnreachable);
    let view = one.snapshot().await.expect("snapshot");
    assert_eq!(view.players, vec![PlayerId(1), PlayerId(2)]);
    assert!(view.kick_votes.is_empty());
    assert_eq!(view.phase, Phase::AwaitingPlays);
    audit(&memory, lobby).await;

    // no ban: the kicked player may come back
    let back = connect(&core, lobby, 3).await;
    assert_eq!(back.snapshot().await.expect("snapshot").players.len(), 3);
}

#[tokio::test]
async fn last_disconnect_tears_the_lobby_down() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 30).await;
    let core = start_core(&memory, 64);
    let a = connect(&core, lobby, 1).await;
    let b = connect(&core, lobby, 2).await;
    assert!(core.registry().contains(lobby).await);
    assert_eq!(memory.members(lobby).await.len(), 2);

    drop(a);
    drop(b);
    for _ in 0..100 {
        if core.registry().is_empty().await {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(core.registry().is_empty().await);
    assert!(memory.members(lobby).await.is_empty());
    audit(&memory, lobby).await;

    // a fresh hub picks the lobby up again
    let again = connect(&core, lobby, 1).await;
    assert!(core.registry().contains(lobby).await);
    let view = again.snapshot().await.expect("snapshot");
    assert_eq!(view.players, vec![PlayerId(1)]);
    assert_eq!(view.phase, Phase::AwaitingJudge);
}

#[tokio::test]
async fn unknown_lobby_is_refused() {
    let memory = Arc::new(MemoryStore::new());
    let core = start_core(&memory, 64);
    let err = core
        .connect(LobbyId(404), PlayerId(1))
        .await
        .err()
        .expect("connect to fail");
    assert_eq!(err.kind(), ErrorKind::UnknownLobby);
    assert!(core.registry().is_empty().await);
}

#[tokio::test]
async fn second_connection_shares_the_seat() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 30).await;
    let core = start_core(&memory, 64);
    let mut watcher = connect(&core, lobby, 9).await;
    let first = connect(&core, lobby, 1).await;
    let second = connect(&core, lobby, 1).await;

    let joined: Vec<_> = drain(&mut watcher)
        .await
        .into_iter()
        .filter(|notice| *notice == Notification::PlayerJoined { player: PlayerId(1) })
        .collect();
    assert_eq!(joined.len(), 1);

    drop(first);
    let notices = drain(&mut watcher).await;
    assert!(!notices.contains(&Notification::PlayerLeft { player: PlayerId(1) }));
    assert!(second.snapshot().await.is_ok());

    drop(second);
    wait_for(&mut watcher, Notification::PlayerLeft { player: PlayerId(1) }).await;
}

#[tokio::test]
async fn stalled_client_is_dropped() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 3, 30).await;
    let core = start_core(&memory, 8);
    let mut active = connect(&core, lobby, 1).await;
    let mut stalled = connect(&core, lobby, 2).await;

    let card = hand(act(&active, Action::Draw).await)[0];
    let mut dropped = false;
    for i in 0..64 {
        act(
            &active,
            Action::Lock {
                card,
                locked: i % 2 == 0,
            },
        )
        .await;
        loop {
            match next_notice(&mut active).await {
                Notification::StateChanged => break,
                Notification::PlayerLeft { player } if player == PlayerId(2) => dropped = true,
                _ => {}
            }
        }
        if dropped {
            break;
        }
    }
    assert!(dropped);

    let err = stalled
        .send(Action::Draw)
        .await
        .err()
        .expect("stalled client to be gone");
    assert_eq!(err.kind(), ErrorKind::ClientUnreachable);
    while stalled.receive().await.is_some() {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_actions_keep_cards_unique() {
    let memory = Arc::new(MemoryStore::new());
    let lobby = lobby(&memory, 5, 200).await;
    let core = start_core(&memory, 1024);
    let mut clients = vec![];
    for player in 1..=6 {
        clients.push(connect(&core, lobby, player).await);
    }
    let wins = Arc::new(AtomicU32::new(0));

    // The judge picks winners while everyone else keeps playing, taking
    // cards back and reshuffling their hands.
    let tasks = clients.into_iter().map(|mut client| {
        let wins = wins.clone();
        tokio::spawn(async move {
            let me = client.player();
            for i in 0..2000u32 {
                if wins.load(Ordering::SeqCst) >= 2 {
                    break;
                }
                while let Some(Some(_)) = client.receive().now_or_never() {}
                let view = match client.snapshot().await {
                    Ok(view) => view,
                    Err(_) => break,
                };
                if view.judge == Some(me) {
                    if view.phase == Phase::AwaitingJudgment {
                        let action = match view.board.first() {
                            Some(entry) if i % 2 == 0 => Action::JudgeSelect {
                                winner: entry.player,
                            },
                            _ => Action::PickRandomWinner,
                        };
                        if let Ok(Outcome::Accepted(Reply::Winner { .. })) =
                            client.send(action).await
                        {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                } else if view.phase == Phase::AwaitingPlays
                    && !view.skipped.contains(&me)
                    && view.board.iter().all(|entry| entry.player != me)
                {
                    let cards = match client.send(Action::Draw).await {
                        Ok(Outcome::Accepted(Reply::Hand { cards })) => cards,
                        _ => vec![],
                    };
                    if i % 3 == 0 {
                        if let Some(card) = cards.last() {
                            let _ = client.send(Action::Discard { card: *card }).await;
                        }
                    }
                    if let Some(card) = cards.first() {
                        let _ = client.send(Action::Play { card: *card }).await;
                        if i % 4 == 0 {
                            let _ = client.send(Action::Withdraw).await;
                            let _ = client.send(Action::Play { card: *card }).await;
                        }
                    }
                } else if let Some(held) = view.hand.first() {
                    let _ = client
                        .send(Action::Lock {
                            card: held.card.id,
                            locked: i % 2 == 0,
                        })
                        .await;
                }
                sleep(Duration::from_millis(1)).await;
            }
            client
        })
    });
    let clients: Vec<Client> = join_all(tasks)
        .await
        .into_iter()
        .map(|task| task.expect("client task"))
        .collect();

    assert!(wins.load(Ordering::SeqCst) >= 2);
    audit(&memory, lobby).await;
    let view = clients[0].snapshot().await.expect("snapshot");
    assert_eq!(view.players.len(), 6);
    assert_eq!(view.wins.iter().map(|(_, won)| won).sum::<u32>(), wins.load(Ordering::SeqCst));
}
