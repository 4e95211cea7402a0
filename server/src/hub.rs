//! Process-wide registry of connections and sessions, and the inbound message
//! dispatcher.
//!
//! The hub never touches session state itself. It resolves which session a
//! message is for and forwards it through that session's [`SessionHandle`].

use crate::client_manager::{ClientManager, Connection};
use crate::config::ServerConfig;
use crate::error::{GameError, GameResult};
use crate::lexicon::Lexicon;
use crate::reconnect;
use crate::session::{spawn_session, SessionHandle};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use shared::{
    Envelope, ErrorMessage, GameOptions, JoinGame, PlayerInput, StartGame, ERROR, JOIN_GAME,
    LEAVE_GAME, MAX_USERNAME_LEN, NEXT_ROUND, PLAYER_INPUT, RESET_LOBBY, ROUND_START, START_GAME,
    UPDATE_GAME_OPTIONS,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const ADJECTIVES: &[&str] = &[
    "autumn", "hidden", "bitter", "misty", "silent", "empty", "dry", "dark", "summer", "icy",
    "quiet", "white", "cool", "spring", "winter", "patient", "twilight", "dawn", "crimson",
    "wispy", "weathered", "blue", "billowing", "broken", "cold", "damp", "falling", "frosty",
    "green", "long", "late", "bold", "little", "morning", "muddy", "old", "red", "rough", "still",
    "small", "sparkling", "shy", "wandering", "withered", "wild", "black", "young", "holy",
    "solitary", "fragrant", "aged", "snowy", "proud", "floral", "restless", "divine", "polished",
    "ancient", "purple", "lively", "nameless",
];

const NOUNS: &[&str] = &[
    "waterfall", "river", "breeze", "moon", "rain", "wind", "sea", "morning", "snow", "lake",
    "sunset", "pine", "shadow", "leaf", "dawn", "glitter", "forest", "hill", "cloud", "meadow",
    "sun", "glade", "bird", "brook", "butterfly", "bush", "dew", "dust", "field", "fire",
    "flower", "firefly", "feather", "grass", "haze", "mountain", "night", "pond", "darkness",
    "snowflake", "silence", "sound", "sky", "shape", "surf", "thunder", "violet", "water",
    "wildflower", "wave", "resonance", "wood", "dream", "cherry", "tree", "fog", "frost", "voice",
    "paper", "frog", "smoke", "star",
];

/// Random `adjective-noun` session name.
pub fn session_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("river");
    format!("{}-{}", adjective, noun)
}

pub struct Hub {
    clients: RwLock<ClientManager>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    config: ServerConfig,
    lexicon: Arc<dyn Lexicon>,
}

impl Hub {
    pub fn new(config: ServerConfig, lexicon: Arc<dyn Lexicon>) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(ClientManager::new()),
            sessions: RwLock::new(HashMap::new()),
            config,
            lexicon,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Adds a connection to the directory. An older live connection with the
    /// same token is closed.
    pub async fn register(&self, connection: Arc<Connection>) {
        let previous = self.clients.write().await.add_client(connection);
        if let Some(previous) = previous {
            info!("Closing superseded connection for {}", previous.token);
            previous.close();
        }
    }

    /// Removes a connection that went away. If it was playing, a reconnection
    /// monitor keeps its seat open for the grace window.
    pub async fn unregister(self: &Arc<Self>, connection: &Arc<Connection>) {
        let removed = self.clients.write().await.remove_client(connection);
        if !removed {
            debug!("Connection for {} was already replaced", connection.token);
        }

        let Some(session_id) = connection.session_id() else {
            return;
        };
        connection.unbind_session();
        let Some(session) = self.session(&session_id).await else {
            return;
        };
        reconnect::spawn_monitor(Arc::clone(self), connection.token.clone(), session);
    }

    pub async fn connection(&self, token: &str) -> Option<Arc<Connection>> {
        self.clients.read().await.get(token)
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Allocates a fresh session with the server's default options and starts
    /// its task. Whenever that task stops (last player gone, join deadline
    /// passed, shutdown) the session is dropped from the directory.
    pub async fn create_session(self: &Arc<Self>) -> String {
        let mut sessions = self.sessions.write().await;
        let mut id = session_name();
        while sessions.contains_key(&id) {
            id = format!("{}-{}", session_name(), sessions.len());
        }

        let (handle, task) = spawn_session(
            &id,
            self.config.defaults,
            Arc::clone(&self.lexicon),
            self.config.timing.clone(),
        );
        sessions.insert(id.clone(), handle.clone());
        info!("Created session {} ({} open)", id, sessions.len());

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!("Session {} task failed: {}", handle.id(), e);
            }
            hub.remove_session(&handle).await;
        });
        id
    }

    pub async fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops a session from the directory and stops its task. Does nothing if
    /// the id now belongs to a different session.
    pub async fn remove_session(&self, session: &SessionHandle) {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(session.id())
            .is_some_and(|listed| listed.same_session(session));
        if !current {
            return;
        }
        sessions.remove(session.id());
        session.shutdown();
        info!("Removed session {} ({} open)", session.id(), sessions.len());
    }

    /// Handles one inbound text frame. Errors are logged and, unless the frame
    /// was unreadable, reported back to the sender as `ERROR`.
    pub async fn handle_text(&self, connection: &Arc<Connection>, text: &str) {
        let result = match Envelope::from_json(text) {
            Ok(envelope) => self.dispatch(connection, envelope).await,
            Err(e) => Err(GameError::from(e)),
        };

        let Err(err) = result else {
            return;
        };
        warn!("Rejected message from {}: {}", connection.token, err);
        if !err.notify_client() {
            return;
        }
        let message = ErrorMessage {
            message: err.to_string(),
        };
        match Envelope::new(ERROR, &message) {
            Ok(envelope) => {
                connection.send_envelope(&envelope);
            }
            Err(e) => warn!("Failed to build error envelope: {}", e),
        }
    }

    pub async fn dispatch(&self, connection: &Arc<Connection>, envelope: Envelope) -> GameResult<()> {
        debug!("{} from {}", envelope.kind, connection.token);
        match envelope.kind.as_str() {
            JOIN_GAME => self.join(connection, envelope.payload()?).await,
            START_GAME => self.start_game(connection, envelope.payload()?).await,
            ROUND_START => {
                let session = self.bound_session(connection).await?;
                session.start_round(&connection.token).await
            }
            NEXT_ROUND => {
                let session = self.bound_session(connection).await?;
                session.next_round(&connection.token).await
            }
            PLAYER_INPUT => self.player_input(connection, envelope.payload()?).await,
            UPDATE_GAME_OPTIONS => {
                let options: GameOptions = envelope.payload()?;
                let session = self.bound_session(connection).await?;
                session.update_options(&connection.token, options).await
            }
            RESET_LOBBY => {
                let session = self.bound_session(connection).await?;
                session.reset_lobby(&connection.token).await
            }
            LEAVE_GAME => self.leave(connection).await,
            other => Err(GameError::UnsupportedMessageType(other.to_string())),
        }
    }

    async fn join(&self, connection: &Arc<Connection>, join: JoinGame) -> GameResult<()> {
        let len = join.username.chars().count();
        if len > MAX_USERNAME_LEN {
            return Err(GameError::UsernameTooLong {
                len,
                max: MAX_USERNAME_LEN,
            });
        }
        check_token(connection, &join.token)?;

        let session = self
            .session(&join.session_id)
            .await
            .ok_or_else(|| GameError::SessionNotFound(join.session_id.clone()))?;
        let previous = connection
            .session_id()
            .filter(|current| *current != join.session_id);

        session
            .join(&connection.token, &join.username, Arc::clone(connection))
            .await?;
        info!("{} joined session {} as {}", connection.token, join.session_id, join.username);

        // The seat in the old session is only given up once the new one is taken
        if let Some(previous) = previous {
            if let Some(old) = self.session(&previous).await {
                self.depart(&connection.token, &old).await?;
            }
        }
        Ok(())
    }

    async fn start_game(&self, connection: &Arc<Connection>, start: StartGame) -> GameResult<()> {
        check_token(connection, &start.token)?;
        let session = self
            .session(&start.session_id)
            .await
            .ok_or_else(|| GameError::SessionNotFound(start.session_id.clone()))?;
        session.start_game(&connection.token).await
    }

    async fn player_input(&self, connection: &Arc<Connection>, input: PlayerInput) -> GameResult<()> {
        check_token(connection, &input.token)?;
        let session = if input.session_id.is_empty() {
            self.bound_session(connection).await?
        } else {
            self.session(&input.session_id)
                .await
                .ok_or_else(|| GameError::SessionNotFound(input.session_id.clone()))?
        };
        session.submit_input(&connection.token, &input.input).await
    }

    /// Permanent departure from the bound session.
    async fn leave(&self, connection: &Arc<Connection>) -> GameResult<()> {
        let session = self.bound_session(connection).await?;
        self.depart(&connection.token, &session).await?;
        connection.unbind_session();
        Ok(())
    }

    /// Removes `token` from `session`, and the session from the directory if
    /// that emptied it. An emptied session refuses joins still queued behind
    /// the departure, so nobody ends up bound to a removed session.
    pub async fn depart(&self, token: &str, session: &SessionHandle) -> GameResult<usize> {
        let remaining = session.leave(token).await?;
        info!("{} left session {} ({} left)", token, session.id(), remaining);
        if remaining == 0 {
            self.remove_session(session).await;
        }
        Ok(remaining)
    }

    async fn bound_session(&self, connection: &Connection) -> GameResult<SessionHandle> {
        let id = connection.session_id().ok_or(GameError::NotInSession)?;
        self.session(&id)
            .await
            .ok_or_else(|| GameError::SessionNotFound(id.clone()))
    }
}

fn check_token(connection: &Connection, token: &str) -> GameResult<()> {
    if token.is_empty() || token == connection.token {
        Ok(())
    } else {
        Err(GameError::TokenMismatch)
    }
}
