//! Scripted player for poking at a running server.
//!
//! Joins a session, optionally starts it, and whenever it is leader at the
//! start of a round submits the configured fragment.

use clap::Parser;
use env_logger::Env;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::{
    Envelope, ErrorMessage, GameOver, JoinGame, LetterReveal, NewClient, ParticipantSnapshot,
    PlayerInput, RoundFinished, SessionSnapshot, StartGame, ERROR, GAME_OVER, JOIN_GAME,
    NEW_CLIENT, PLAYER_INPUT, PLAYER_STATE, ROUND_ATAMA, ROUND_FINISHED, ROUND_OSHIRI,
    ROUND_START, START_GAME,
};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Session to join; a new one is created when omitted
    #[arg(long)]
    session: Option<String>,

    /// Display name
    #[arg(short, long, default_value = "bot")]
    username: String,

    /// Reuse a token from an earlier connection
    #[arg(short, long, default_value = "")]
    token: String,

    /// Middle letters to submit on our turn
    #[arg(short, long, default_value = "")]
    input: String,

    /// Send START_GAME after joining, and ROUND_START whenever it is our turn
    #[arg(long)]
    start: bool,
}

#[derive(Deserialize)]
struct CreatedSession {
    id: String,
}

fn frame<T: Serialize>(kind: &str, data: &T) -> Result<Message, Box<dyn std::error::Error>> {
    Ok(Message::text(Envelope::new(kind, data)?.to_json()?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let session_id = match &args.session {
        Some(id) => id.clone(),
        None => {
            let created: CreatedSession = reqwest::get(format!("http://{}/creategame", args.server))
                .await?
                .json()
                .await?;
            info!("Created session {}", created.id);
            created.id
        }
    };

    let url = format!("ws://{}/ws?token={}", args.server, args.token);
    info!("Connecting to {}", url);
    let (socket, _) = connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    let mut leader = false;
    let mut turn_pending = false;
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let envelope = match Envelope::from_json(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Unreadable message: {}", e);
                continue;
            }
        };

        match envelope.kind.as_str() {
            NEW_CLIENT => {
                let hello: NewClient = envelope.payload()?;
                info!("Connected as {}", hello.token);
                let join = JoinGame {
                    session_id: session_id.clone(),
                    username: args.username.clone(),
                    token: hello.token.clone(),
                };
                sink.send(frame(JOIN_GAME, &join)?).await?;
                if args.start {
                    let start = StartGame {
                        session_id: session_id.clone(),
                        token: hello.token,
                    };
                    sink.send(frame(START_GAME, &start)?).await?;
                }
            }
            PLAYER_STATE => {
                let me: ParticipantSnapshot = envelope.payload()?;
                leader = me.is_leader;
                info!("{}: {} points{}", me.username, me.score, if leader { ", leader" } else { "" });
                if turn_pending {
                    turn_pending = false;
                    if leader {
                        sink.send(Message::text(Envelope::bare(ROUND_START).to_json()?))
                            .await?;
                    }
                }
            }
            ROUND_ATAMA | ROUND_OSHIRI => {
                let reveal: LetterReveal = envelope.payload()?;
                info!("{} {}", envelope.kind, reveal.letter);
            }
            ROUND_START => {
                let state: SessionSnapshot = envelope.payload()?;
                info!(
                    "Round {}/{}: {}..{}",
                    state.current_round, state.max_rounds, state.head_letter, state.tail_letter
                );
                if leader && !args.input.is_empty() {
                    let input = PlayerInput {
                        session_id: session_id.clone(),
                        token: String::new(),
                        input: args.input.clone(),
                    };
                    sink.send(frame(PLAYER_INPUT, &input)?).await?;
                }
            }
            ROUND_FINISHED => {
                let finished: RoundFinished = envelope.payload()?;
                info!(
                    "{:?} was {}; best: {}",
                    finished.submitted_word,
                    if finished.was_valid { "valid" } else { "invalid" },
                    finished.top_matches.join(", ")
                );
                // Our PLAYER_STATE for the new rotation follows
                turn_pending = args.start;
            }
            GAME_OVER => {
                let over: GameOver = envelope.payload()?;
                for standing in over.standings {
                    info!("#{} {} ({})", standing.rank, standing.username, standing.score);
                }
                break;
            }
            ERROR => {
                let error: ErrorMessage = envelope.payload()?;
                warn!("Server rejected a message: {}", error.message);
            }
            _ => {}
        }
    }

    info!("Bot finished");
    Ok(())
}
