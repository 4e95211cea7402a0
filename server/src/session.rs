//! The per-session actor.
//!
//! Each session runs as one tokio task that owns its [`GameState`] outright.
//! Everything else (the hub, reconnection monitors, the round countdown) only
//! ever sends a [`SessionEvent`] and, when it needs an answer, waits on a
//! oneshot reply. Events are handled strictly one at a time, which is what
//! keeps joins, leaves, inputs and timer steps from interleaving.

use crate::client_manager::Connection;
use crate::config::Timing;
use crate::error::{GameError, GameResult};
use crate::game::{CycleOutcome, GameState, Participant};
use crate::lexicon::Lexicon;
use crate::round::{RoundEvent, RoundPhase, RoundTimer};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use shared::{
    Envelope, GameOptions, GameOver, LetterReveal, RoundFinished, SessionSnapshot, GAME_OVER,
    GAME_STATE, NEXT_ROUND, PLAYER_STATE, ROUND_ATAMA, ROUND_FINISHED, ROUND_OSHIRI, ROUND_START,
    START_GAME,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

type Reply<T> = oneshot::Sender<T>;

/// Everything a session can be asked to do.
#[derive(Debug)]
pub enum SessionEvent {
    Join {
        token: String,
        username: String,
        connection: Arc<Connection>,
        reply: Reply<GameResult<()>>,
    },
    /// A returning connection takes over an existing participant.
    Reattach {
        connection: Arc<Connection>,
        reply: Reply<bool>,
    },
    /// Permanent departure. Replies with the number of participants left.
    Leave {
        token: String,
        reply: Reply<usize>,
    },
    StartGame {
        token: String,
        reply: Reply<GameResult<()>>,
    },
    StartRound {
        token: String,
        reply: Reply<GameResult<()>>,
    },
    NextRound {
        token: String,
        reply: Reply<GameResult<()>>,
    },
    SubmitInput {
        token: String,
        input: String,
        reply: Reply<GameResult<()>>,
    },
    UpdateOptions {
        token: String,
        options: GameOptions,
        reply: Reply<GameResult<()>>,
    },
    ResetLobby {
        token: String,
        reply: Reply<GameResult<()>>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Round(RoundEvent),
    Shutdown,
}

impl From<RoundEvent> for SessionEvent {
    fn from(event: RoundEvent) -> Self {
        SessionEvent::Round(event)
    }
}

/// Cheap, cloneable way to talk to a session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// True when both handles reach the same task, even if a later session
    /// reused the id.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.events.same_channel(&other.events)
    }

    async fn request<T>(&self, event: impl FnOnce(Reply<T>) -> SessionEvent) -> GameResult<T> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(event(reply))
            .map_err(|_| GameError::SessionClosed(self.id.to_string()))?;
        response
            .await
            .map_err(|_| GameError::SessionClosed(self.id.to_string()))
    }

    pub async fn join(
        &self,
        token: &str,
        username: &str,
        connection: Arc<Connection>,
    ) -> GameResult<()> {
        self.request(|reply| SessionEvent::Join {
            token: token.to_string(),
            username: username.to_string(),
            connection,
            reply,
        })
        .await?
    }

    pub async fn reattach(&self, connection: Arc<Connection>) -> GameResult<bool> {
        self.request(|reply| SessionEvent::Reattach { connection, reply })
            .await
    }

    pub async fn leave(&self, token: &str) -> GameResult<usize> {
        self.request(|reply| SessionEvent::Leave {
            token: token.to_string(),
            reply,
        })
        .await
    }

    pub async fn start_game(&self, token: &str) -> GameResult<()> {
        self.request(|reply| SessionEvent::StartGame {
            token: token.to_string(),
            reply,
        })
        .await?
    }

    pub async fn start_round(&self, token: &str) -> GameResult<()> {
        self.request(|reply| SessionEvent::StartRound {
            token: token.to_string(),
            reply,
        })
        .await?
    }

    pub async fn next_round(&self, token: &str) -> GameResult<()> {
        self.request(|reply| SessionEvent::NextRound {
            token: token.to_string(),
            reply,
        })
        .await?
    }

    pub async fn submit_input(&self, token: &str, input: &str) -> GameResult<()> {
        self.request(|reply| SessionEvent::SubmitInput {
            token: token.to_string(),
            input: input.to_string(),
            reply,
        })
        .await?
    }

    pub async fn update_options(&self, token: &str, options: GameOptions) -> GameResult<()> {
        self.request(|reply| SessionEvent::UpdateOptions {
            token: token.to_string(),
            options,
            reply,
        })
        .await?
    }

    pub async fn reset_lobby(&self, token: &str) -> GameResult<()> {
        self.request(|reply| SessionEvent::ResetLobby {
            token: token.to_string(),
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> GameResult<SessionSnapshot> {
        self.request(|reply| SessionEvent::Snapshot { reply }).await
    }

    /// Asks the task to cancel any live round and exit.
    pub fn shutdown(&self) {
        // Already gone is fine
        let _ = self.events.send(SessionEvent::Shutdown);
    }
}

/// Starts a session task and returns the handle used to reach it.
pub fn spawn_session(
    id: &str,
    options: GameOptions,
    lexicon: Arc<dyn Lexicon>,
    timing: Timing,
) -> (SessionHandle, JoinHandle<()>) {
    let (session, handle, events) = Session::new(id, options, lexicon, timing);
    let task = tokio::spawn(session.run(events));
    (handle, task)
}

pub struct Session {
    id: Arc<str>,
    state: GameState,
    lexicon: Arc<dyn Lexicon>,
    timing: Timing,
    rng: StdRng,
    /// Handed to each round timer so its steps come back through the queue
    events: mpsc::UnboundedSender<SessionEvent>,
    /// A round is counting down and has not been scored yet
    running: bool,
    /// The match reached its last round; no more rounds until a lobby reset
    ended: bool,
    /// Someone has joined at least once
    joined: bool,
    /// The last participant left; the task stops after the current event
    closed: bool,
    /// Bumped for every round started or cancelled; stale timer events are dropped
    generation: u64,
    timer: Option<RoundTimer>,
}

impl Session {
    fn new(
        id: &str,
        options: GameOptions,
        lexicon: Arc<dyn Lexicon>,
        timing: Timing,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let id: Arc<str> = Arc::from(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: Arc::clone(&id),
            events: tx.clone(),
        };
        let session = Self {
            id,
            state: GameState::new(options),
            lexicon,
            timing,
            rng: StdRng::from_entropy(),
            events: tx,
            running: false,
            ended: false,
            joined: false,
            closed: false,
            generation: 0,
            timer: None,
        };
        (session, handle, rx)
    }

    /// Handles events until shutdown, until the last participant leaves, or
    /// until the join deadline passes with nobody having joined. Requests
    /// still queued at that point fail with `SessionClosed`.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("Session {} started", self.id);
        let deadline = sleep(self.timing.join_deadline);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                _ = &mut deadline, if !self.joined => {
                    info!("Session {} expired before anyone joined", self.id);
                    break;
                }
            }
        }
        self.cancel_round().await;
        info!("Session {} stopped", self.id);
    }

    /// Applies one event. Returns false once the session should stop.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Join {
                token,
                username,
                connection,
                reply,
            } => {
                let _ = reply.send(self.join(token, username, connection));
            }
            SessionEvent::Reattach { connection, reply } => {
                let _ = reply.send(self.reattach(&connection));
            }
            SessionEvent::Leave { token, reply } => {
                let remaining = self.remove_participant(&token).await;
                let _ = reply.send(remaining);
            }
            SessionEvent::StartGame { token, reply } => {
                let result = self.start_game(&token).await;
                let _ = reply.send(result);
            }
            SessionEvent::StartRound { token, reply } => {
                let result = self.request_round(&token).await;
                let _ = reply.send(result);
            }
            SessionEvent::NextRound { token, reply } => {
                let result = self.next_round(&token).await;
                let _ = reply.send(result);
            }
            SessionEvent::SubmitInput {
                token,
                input,
                reply,
            } => {
                let _ = reply.send(self.submit_input(&token, &input));
            }
            SessionEvent::UpdateOptions {
                token,
                options,
                reply,
            } => {
                let _ = reply.send(self.update_options(&token, options));
            }
            SessionEvent::ResetLobby { token, reply } => {
                let result = self.reset_to_lobby(&token).await;
                let _ = reply.send(result);
            }
            SessionEvent::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            SessionEvent::Round(event) => self.on_round_event(event).await,
            SessionEvent::Shutdown => return false,
        }
        !self.closed
    }

    fn join(
        &mut self,
        token: String,
        username: String,
        connection: Arc<Connection>,
    ) -> GameResult<()> {
        match self.state.participant_mut(&token) {
            Some(participant) => {
                participant.attach(&connection);
                info!("Player {} rejoined session {}", participant.username, self.id);
            }
            None => {
                if self.state.started {
                    return Err(GameError::SessionAlreadyStarted);
                }
                self.state
                    .add_participant(Participant::new(token.clone(), username, &connection));
            }
        }
        connection.bind_session(&self.id);
        self.joined = true;

        self.broadcast_state();
        self.send_player_state(&token);
        Ok(())
    }

    fn reattach(&mut self, connection: &Arc<Connection>) -> bool {
        let Some(participant) = self.state.participant_mut(&connection.token) else {
            return false;
        };
        participant.attach(connection);
        connection.bind_session(&self.id);
        info!("Player {} reconnected to session {}", connection.token, self.id);

        if let Some(envelope) = envelope(GAME_STATE, &self.state.snapshot()) {
            connection.send_envelope(&envelope);
        }
        self.send_player_state(&connection.token);
        true
    }

    /// Removes a participant for good. Returns how many are left.
    async fn remove_participant(&mut self, token: &str) -> usize {
        let Some(removal) = self.state.remove_participant(token) else {
            return self.state.len();
        };
        if let Some(connection) = removal.participant.connection() {
            if connection.session_id().as_deref() == Some(&*self.id) {
                connection.unbind_session();
            }
        }

        if self.state.is_empty() {
            self.cancel_round().await;
            self.closed = true;
            info!("Session {} is empty and closing", self.id);
            return 0;
        }
        // A running countdown belonged to the departed leader
        if self.running && (removal.was_leader || removal.cycle.is_some()) {
            self.cancel_round().await;
            self.state.round_over = true;
        }
        if let Some(new_leader) = removal.new_leader {
            self.send_player_state(&new_leader);
        }
        self.broadcast_state();
        if removal.cycle == Some(CycleOutcome::GameOver) {
            self.end_session();
        }
        self.state.len()
    }

    async fn start_game(&mut self, token: &str) -> GameResult<()> {
        self.state.require_leader(token)?;
        if self.state.initialize(&mut self.rng) {
            info!("Session {} started by {}", self.id, token);
        }
        if let Some(envelope) = envelope(START_GAME, &self.state.snapshot()) {
            self.broadcast(&envelope);
        }
        self.start_round().await;
        Ok(())
    }

    async fn request_round(&mut self, token: &str) -> GameResult<()> {
        self.state.require_leader(token)?;
        if !self.state.started {
            return Err(GameError::SessionNotStarted);
        }
        self.start_round().await;
        Ok(())
    }

    async fn next_round(&mut self, token: &str) -> GameResult<()> {
        if self.state.participant(token).is_none() {
            return Err(GameError::ParticipantNotFound);
        }
        if let Some(envelope) = envelope(NEXT_ROUND, &self.state.snapshot()) {
            self.broadcast(&envelope);
        }
        if !self.running {
            self.start_round().await;
        }
        Ok(())
    }

    /// Kicks off the letter draw and countdown. Does nothing while a round is
    /// running, before the session started, or after the match ended.
    async fn start_round(&mut self) {
        if self.running {
            debug!("Session {}: round already running", self.id);
            return;
        }
        if self.ended || !self.state.started || self.state.is_empty() {
            debug!("Session {}: not starting a round", self.id);
            return;
        }
        // A timer that finished on its own may still be parked here
        self.cancel_round().await;

        let draw = self.state.begin_round(self.lexicon.as_ref(), &mut self.rng);
        debug!(
            "Session {} drew {}..{} ({} words, {} attempts)",
            self.id, self.state.head_letter, self.state.tail_letter, draw.matches, draw.attempts
        );

        self.running = true;
        self.generation += 1;
        self.timer = Some(RoundTimer::spawn(
            self.generation,
            self.timing.clone(),
            self.state.round_duration_seconds,
            self.events.clone(),
        ));
    }

    /// Stops any live countdown and waits for its task to exit. Scores
    /// nothing and leaves `round_over` alone.
    async fn cancel_round(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel().await;
            debug!("Session {}: round {} cancelled", self.id, self.generation);
        }
        self.running = false;
        self.generation += 1;
    }

    async fn on_round_event(&mut self, event: RoundEvent) {
        if event.generation != self.generation || !self.running {
            trace!("Session {}: dropping stale {:?}", self.id, event);
            return;
        }
        match event.phase {
            RoundPhase::RevealHead => {
                let letter = LetterReveal {
                    letter: self.state.head_letter.clone(),
                };
                if let Some(envelope) = envelope(ROUND_ATAMA, &letter) {
                    self.broadcast(&envelope);
                }
            }
            RoundPhase::RevealTail => {
                let letter = LetterReveal {
                    letter: self.state.tail_letter.clone(),
                };
                if let Some(envelope) = envelope(ROUND_OSHIRI, &letter) {
                    self.broadcast(&envelope);
                }
                if let Some(envelope) = envelope(ROUND_START, &self.state.snapshot()) {
                    self.broadcast(&envelope);
                }
            }
            RoundPhase::Tick => {
                self.state.tick();
                self.broadcast_state();
            }
            RoundPhase::Expired => self.finish_round().await,
        }
    }

    /// Scores the current turn. Ignored unless a round is running, so a late
    /// or duplicated expiry can never score twice.
    async fn finish_round(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        if let Some(timer) = self.timer.take() {
            timer.join().await;
        }

        let Some(result) = self.state.finish_turn(self.lexicon.as_ref()) else {
            return;
        };
        info!(
            "Session {}: {} played {:?} for {} points",
            self.id, result.token, result.submitted_word, result.points
        );

        let finished = RoundFinished {
            top_matches: result.top_matches,
            submitted_word: result.submitted_word,
            was_valid: result.was_valid,
            game_state: self.state.snapshot(),
        };
        if let Some(envelope) = envelope(ROUND_FINISHED, &finished) {
            self.broadcast(&envelope);
        }
        for participant in self.state.participants() {
            if let Some(envelope) = envelope(PLAYER_STATE, &participant.snapshot()) {
                participant.send(&envelope);
            }
        }

        if result.cycle == CycleOutcome::GameOver {
            self.end_session();
        }
    }

    fn end_session(&mut self) {
        self.ended = true;
        let standings = self.state.standings();
        info!("Session {} is over", self.id);
        if let Some(envelope) = envelope(GAME_OVER, &GameOver { standings }) {
            self.broadcast(&envelope);
        }
    }

    fn submit_input(&mut self, token: &str, input: &str) -> GameResult<()> {
        self.state.require_leader(token)?;
        if !self.running {
            return Err(GameError::RoundNotActive);
        }
        self.state.set_input(token, input)?;
        self.broadcast_state();
        Ok(())
    }

    fn update_options(&mut self, token: &str, options: GameOptions) -> GameResult<()> {
        if self.state.participant(token).is_none() {
            return Err(GameError::ParticipantNotFound);
        }
        if self.running {
            return Err(GameError::RoundInProgress);
        }
        self.state.apply_options(options)?;
        self.broadcast_state();
        Ok(())
    }

    async fn reset_to_lobby(&mut self, token: &str) -> GameResult<()> {
        self.state.require_leader(token)?;
        self.cancel_round().await;
        self.ended = false;
        self.state.reset_to_lobby();
        info!("Session {} reset to lobby", self.id);

        self.broadcast_state();
        for participant in self.state.participants() {
            if let Some(envelope) = envelope(PLAYER_STATE, &participant.snapshot()) {
                participant.send(&envelope);
            }
        }
        Ok(())
    }

    fn send_player_state(&self, token: &str) {
        let Some(participant) = self.state.participant(token) else {
            return;
        };
        if let Some(envelope) = envelope(PLAYER_STATE, &participant.snapshot()) {
            participant.send(&envelope);
        }
    }

    fn broadcast_state(&self) {
        if let Some(envelope) = envelope(GAME_STATE, &self.state.snapshot()) {
            self.broadcast(&envelope);
        }
    }

    /// Serializes once and fans out to every participant still connected to
    /// this session. Never waits on a slow connection.
    fn broadcast(&self, envelope: &Envelope) {
        let json = match envelope.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize {} envelope: {}", envelope.kind, e);
                return;
            }
        };
        let mut recipients = 0;
        for participant in self.state.participants() {
            let Some(connection) = participant.connection() else {
                continue;
            };
            if connection.session_id().as_deref() != Some(&*self.id) {
                continue;
            }
            if connection.send(Arc::clone(&json)) {
                recipients += 1;
            }
        }
        trace!(
            "Session {}: {} sent to {} clients",
            self.id,
            envelope.kind,
            recipients
        );
    }
}

fn envelope<T: Serialize>(kind: &str, data: &T) -> Option<Envelope> {
    match Envelope::new(kind, data) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("Failed to build {} envelope: {}", kind, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::WordList;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn words() -> Arc<dyn Lexicon> {
        Arc::new(WordList::from_words(["apple", "ample", "axe"]))
    }

    fn quick_options(max_rounds: u32) -> GameOptions {
        GameOptions {
            max_rounds,
            round_duration_seconds: 5,
            min_acceptable_combinations: 0,
        }
    }

    fn client(token: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(256);
        (Arc::new(Connection::new(token, tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(text) = rx.try_recv() {
            envelopes.push(Envelope::from_json(&text).unwrap());
        }
        envelopes
    }

    fn kinds(envelopes: &[Envelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.kind.as_str()).collect()
    }

    #[tokio::test]
    async fn test_join_broadcasts_state_and_player() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (conn, mut rx) = client("ana");

        handle.join("ana", "Ana", Arc::clone(&conn)).await.unwrap();

        let received = drain(&mut rx);
        assert_eq!(kinds(&received), vec![GAME_STATE, PLAYER_STATE]);
        let player: shared::ParticipantSnapshot = received[1].payload().unwrap();
        assert!(player.is_leader);
        assert_eq!(conn.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_second_join_same_token_reattaches() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (first, _rx1) = client("ana");
        let (second, mut rx2) = client("ana");

        handle.join("ana", "Ana", first).await.unwrap();
        handle.join("ana", "Ana", second).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.rotation_queue.len(), 1);
        assert_eq!(kinds(&drain(&mut rx2)), vec![GAME_STATE, PLAYER_STATE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_join_after_start_rejected() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.start_game("ana").await.unwrap();

        let (ben, _rx2) = client("ben");
        let result = handle.join("ben", "Ben", Arc::clone(&ben)).await;

        assert!(matches!(result, Err(GameError::SessionAlreadyStarted)));
        assert_eq!(ben.session_id(), None);
        assert_eq!(handle.snapshot().await.unwrap().rotation_queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_game_requires_leader() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx1) = client("ana");
        let (ben, _rx2) = client("ben");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();

        assert!(matches!(handle.start_game("ben").await, Err(GameError::NotLeader)));
        assert!(!handle.snapshot().await.unwrap().started);
        assert!(matches!(
            handle.start_game("nobody").await,
            Err(GameError::ParticipantNotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_reveals_then_counts_down() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();
        drain(&mut rx);

        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_millis(6_500)).await;

        let received = drain(&mut rx);
        assert_eq!(
            kinds(&received),
            vec![START_GAME, ROUND_ATAMA, ROUND_OSHIRI, ROUND_START]
        );
        let snapshot = handle.snapshot().await.unwrap();
        let head: LetterReveal = received[1].payload().unwrap();
        let tail: LetterReveal = received[2].payload().unwrap();
        assert_eq!(head.letter, snapshot.head_letter);
        assert_eq!(tail.letter, snapshot.tail_letter);

        sleep(Duration::from_secs(2)).await;
        let ticks = drain(&mut rx);
        assert_eq!(kinds(&ticks), vec![GAME_STATE, GAME_STATE]);
        let last: SessionSnapshot = ticks[1].payload().unwrap();
        assert_eq!(last.remaining_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_player_single_round_ends_game() {
        let (handle, _task) = spawn_session("s1", quick_options(1), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();

        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(7)).await;
        handle.submit_input("ana", "PPL").await.unwrap();
        sleep(Duration::from_secs(10)).await;

        let received = drain(&mut rx);
        let names = kinds(&received);
        assert_eq!(names.iter().filter(|k| **k == ROUND_FINISHED).count(), 1);
        assert_eq!(names.iter().filter(|k| **k == GAME_OVER).count(), 1);
        let finished_at = names.iter().position(|k| *k == ROUND_FINISHED).unwrap();
        let over_at = names.iter().position(|k| *k == GAME_OVER).unwrap();
        assert!(finished_at < over_at);

        let finished: RoundFinished = received[finished_at].payload().unwrap();
        assert!(finished.submitted_word.contains("ppl"));
        assert!(finished.game_state.round_over);

        let over: GameOver = received[over_at].payload().unwrap();
        assert_eq!(over.standings.len(), 1);
        assert_eq!(over.standings[0].rank, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rounds_after_game_over() {
        let (handle, _task) = spawn_session("s1", quick_options(1), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(20)).await;
        drain(&mut rx);

        handle.start_round("ana").await.unwrap();
        sleep(Duration::from_secs(20)).await;

        assert!(!kinds(&drain(&mut rx)).contains(&ROUND_ATAMA));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_over_two_players() {
        let (handle, _task) = spawn_session("s1", quick_options(2), words(), Timing::default());
        let (ana, _rx1) = client("ana");
        let (ben, mut rx2) = client("ben");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();

        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(12)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_round, 1);
        assert_eq!(snapshot.rotation_queue[0].username, "Ben");
        assert!(snapshot.rotation_queue[0].is_leader);
        assert!(snapshot.round_over);

        // The previous leader can no longer start rounds
        assert!(matches!(handle.start_round("ana").await, Err(GameError::NotLeader)));
        drain(&mut rx2);
        handle.start_round("ben").await.unwrap();
        sleep(Duration::from_secs(12)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_round, 2);
        assert_eq!(snapshot.rotation_queue[0].username, "Ana");
        assert!(kinds(&drain(&mut rx2)).contains(&ROUND_FINISHED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_input_rules() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx1) = client("ana");
        let (ben, _rx2) = client("ben");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();

        assert!(matches!(
            handle.submit_input("ana", "x").await,
            Err(GameError::RoundNotActive)
        ));

        handle.start_game("ana").await.unwrap();
        assert!(matches!(
            handle.submit_input("ben", "x").await,
            Err(GameError::NotLeader)
        ));
        handle.submit_input("ana", "PpL").await.unwrap();

        assert_eq!(handle.snapshot().await.unwrap().current_input, "ppl");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_options_between_rounds_only() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();

        let options = GameOptions {
            max_rounds: 4,
            round_duration_seconds: 30,
            min_acceptable_combinations: 1,
        };
        handle.update_options("ana", options).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.max_rounds, 4);
        assert_eq!(snapshot.round_duration_seconds, 30);

        handle.start_game("ana").await.unwrap();
        assert!(matches!(
            handle.update_options("ana", quick_options(2)).await,
            Err(GameError::RoundInProgress)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_leave_promotes_next() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx1) = client("ana");
        let (ben, mut rx2) = client("ben");
        handle.join("ana", "Ana", Arc::clone(&ana)).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();
        drain(&mut rx2);

        assert_eq!(handle.leave("ana").await.unwrap(), 1);

        let received = drain(&mut rx2);
        assert_eq!(kinds(&received), vec![PLAYER_STATE, GAME_STATE]);
        let player: shared::ParticipantSnapshot = received[0].payload().unwrap();
        assert!(player.is_leader);
        assert_eq!(ana.session_id(), None);
        // Leaving twice is harmless
        assert_eq!(handle.leave("ana").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_to_lobby_cancels_round() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(8)).await;

        handle.reset_lobby("ana").await.unwrap();
        drain(&mut rx);
        sleep(Duration::from_secs(60)).await;

        assert!(drain(&mut rx).is_empty());
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.started);
        assert!(!snapshot.round_over);
        assert_eq!(snapshot.current_round, 1);
        assert_eq!(snapshot.rotation_queue[0].score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let (handle, task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.start_game("ana").await.unwrap();

        handle.shutdown();
        task.await.unwrap();

        assert!(matches!(
            handle.snapshot().await,
            Err(GameError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_join_queued_behind_last_leave_is_refused() {
        let (handle, task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, _rx1) = client("ana");
        let (ben, _rx2) = client("ben");
        handle.join("ana", "Ana", ana).await.unwrap();

        let (left, joined) = tokio::join!(
            handle.leave("ana"),
            handle.join("ben", "Ben", Arc::clone(&ben))
        );

        assert_eq!(assert_ok!(left), 0);
        assert!(matches!(assert_err!(joined), GameError::SessionClosed(_)));
        assert_eq!(ben.session_id(), None);
        assert_ok!(task.await);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unjoined_session_expires() {
        let timing = Timing::default();
        let (handle, task) = spawn_session("s1", quick_options(3), words(), timing.clone());

        sleep(timing.join_deadline + Duration::from_secs(1)).await;

        assert_ok!(task.await);
        assert!(matches!(
            assert_err!(handle.snapshot().await),
            GameError::SessionClosed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_session_outlives_join_deadline() {
        let timing = Timing::default();
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), timing.clone());
        let (ana, _rx) = client("ana");
        handle.join("ana", "Ana", ana).await.unwrap();

        sleep(timing.join_deadline * 2).await;

        let snapshot = assert_ok!(handle.snapshot().await);
        assert_eq!(snapshot.rotation_queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_of_last_unplayed_advances_round() {
        let (handle, _task) = spawn_session("s1", quick_options(3), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        let (ben, _rx2) = client("ben");
        let (cai, _rx3) = client("cai");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();
        handle.join("cai", "Cai", cai).await.unwrap();

        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(12)).await;
        handle.start_round("ben").await.unwrap();
        sleep(Duration::from_secs(12)).await;
        assert_eq!(handle.snapshot().await.unwrap().current_round, 1);

        assert_eq!(assert_ok!(handle.leave("cai").await), 2);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_round, 2);
        assert_eq!(snapshot.rotation_queue[0].username, "Ana");
        assert!(snapshot.rotation_queue[0].is_leader);
        drain(&mut rx);

        // ana opens round 2; ben still owes a turn in it
        handle.start_round("ana").await.unwrap();
        sleep(Duration::from_secs(12)).await;
        assert_eq!(handle.snapshot().await.unwrap().current_round, 2);
        assert!(kinds(&drain(&mut rx)).contains(&ROUND_FINISHED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_departure_mid_countdown_cancels_round() {
        let (handle, _task) = spawn_session("s1", quick_options(1), words(), Timing::default());
        let (ana, mut rx) = client("ana");
        let (ben, _rx2) = client("ben");
        handle.join("ana", "Ana", ana).await.unwrap();
        handle.join("ben", "Ben", ben).await.unwrap();

        handle.start_game("ana").await.unwrap();
        sleep(Duration::from_secs(12)).await;
        handle.start_round("ben").await.unwrap();
        sleep(Duration::from_secs(8)).await;
        drain(&mut rx);

        // ben was the only one left to play in the last round
        handle.leave("ben").await.unwrap();
        sleep(Duration::from_secs(30)).await;

        let received = drain(&mut rx);
        let names = kinds(&received);
        assert!(!names.contains(&ROUND_FINISHED));
        assert_eq!(names.iter().filter(|k| **k == GAME_OVER).count(), 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.round_over);
        assert_eq!(snapshot.rotation_queue.len(), 1);
        assert_eq!(snapshot.rotation_queue[0].score, 0);
    }

    /// Drives a session by hand so cancellation can be observed between steps.
    struct Harness {
        session: Session,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _connections: Vec<Arc<Connection>>,
    }

    impl Harness {
        fn new(names: &[&str]) -> (Self, Vec<mpsc::Receiver<Arc<String>>>) {
            let (mut session, _handle, events) =
                Session::new("h", quick_options(3), words(), Timing::default());
            let mut receivers = Vec::new();
            let mut connections = Vec::new();
            for name in names {
                let (conn, rx) = client(name);
                session
                    .join(name.to_string(), name.to_string(), Arc::clone(&conn))
                    .unwrap();
                connections.push(conn);
                receivers.push(rx);
            }
            session.state.initialize(&mut session.rng);
            let harness = Self {
                session,
                events,
                _connections: connections,
            };
            (harness, receivers)
        }

        /// Feeds every queued timer event to the session.
        async fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_event(event).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_revealing_skips_finish() {
        let (mut harness, mut receivers) = Harness::new(&["ana"]);
        harness.session.start_round().await;
        sleep(Duration::from_secs(4)).await;
        harness.pump().await;

        harness.session.cancel_round().await;
        sleep(Duration::from_secs(60)).await;
        harness.pump().await;

        assert!(!harness.session.state.round_over);
        assert_eq!(harness.session.state.turns_taken_this_round(), 0);
        assert!(!harness.session.running);
        let received = drain(&mut receivers[0]);
        assert!(!kinds(&received).contains(&ROUND_FINISHED));
        assert!(!kinds(&received).contains(&ROUND_OSHIRI));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_counting_down_skips_finish() {
        let (mut harness, mut receivers) = Harness::new(&["ana", "ben"]);
        harness.session.start_round().await;
        sleep(Duration::from_secs(8)).await;
        harness.pump().await;
        let remaining = harness.session.state.remaining_seconds;

        harness.session.cancel_round().await;
        sleep(Duration::from_secs(60)).await;
        harness.pump().await;

        assert!(!harness.session.state.round_over);
        assert_eq!(harness.session.state.remaining_seconds, remaining);
        assert_eq!(harness.session.state.leader_token(), Some("ana"));
        assert!(!kinds(&drain(&mut receivers[1])).contains(&ROUND_FINISHED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_is_ignored() {
        let (mut harness, _receivers) = Harness::new(&["ana"]);
        harness.session.start_round().await;
        let stale = harness.session.generation;
        harness.session.cancel_round().await;

        harness
            .session
            .on_round_event(RoundEvent {
                generation: stale,
                phase: RoundPhase::Expired,
            })
            .await;
        harness.session.finish_round().await;

        assert_eq!(harness.session.state.turns_taken_this_round(), 0);
        assert!(!harness.session.state.round_over);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_countdown() {
        let (mut harness, mut receivers) = Harness::new(&["ana"]);
        harness.session.start_round().await;
        sleep(Duration::from_secs(4)).await;
        harness.pump().await;

        harness.session.cancel_round().await;
        harness.session.start_round().await;
        sleep(Duration::from_secs(4)).await;
        harness.pump().await;

        // One head reveal per round, never two countdowns at once
        let reveals = kinds(&drain(&mut receivers[0]))
            .into_iter()
            .filter(|k| *k == ROUND_ATAMA)
            .count();
        assert_eq!(reveals, 2);
        sleep(Duration::from_secs(60)).await;
        harness.pump().await;
        assert_eq!(harness.session.state.turns_taken_this_round(), 0);
        assert_eq!(harness.session.state.current_round, 2);
    }
}
