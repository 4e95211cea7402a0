//! Session state and the rules that mutate it.
//!
//! Everything here is synchronous and owned by exactly one session task (see
//! [`crate::session`]). Timing, broadcasting and cancellation live there;
//! rotation, letter draws, scoring and ranking live here.

use crate::client_manager::Connection;
use crate::error::{GameError, GameResult};
use crate::lexicon::Lexicon;
use log::{debug, info, warn};
use rand::Rng;
use shared::{Envelope, GameOptions, ParticipantSnapshot, SessionSnapshot, Standing};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

/// Letter pairs tried before settling for the best pair seen so far.
pub const MAX_LETTER_DRAWS: u32 = 256;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

#[derive(Debug)]
pub struct Participant {
    pub token: String,
    pub username: String,
    pub score: u32,
    pub is_leader: bool,
    connection: Weak<Connection>,
}

impl Participant {
    pub fn new(token: impl Into<String>, username: impl Into<String>, connection: &Arc<Connection>) -> Self {
        Self {
            token: token.into(),
            username: username.into(),
            score: 0,
            is_leader: false,
            connection: Arc::downgrade(connection),
        }
    }

    /// A participant with no live connection.
    pub fn detached(token: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            username: username.into(),
            score: 0,
            is_leader: false,
            connection: Weak::new(),
        }
    }

    pub fn attach(&mut self, connection: &Arc<Connection>) {
        self.connection = Arc::downgrade(connection);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    /// Sends to whichever connection currently backs this participant.
    /// Silently drops the message while they are disconnected.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match self.connection() {
            Some(connection) => connection.send_envelope(envelope),
            None => false,
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            username: self.username.clone(),
            score: self.score,
            is_leader: self.is_leader,
        }
    }
}

/// Outcome of a letter draw against the difficulty floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LetterDraw {
    pub attempts: u32,
    pub matches: usize,
    /// True when no pair met the floor and the best pair was used instead.
    pub relaxed: bool,
}

/// What a completed turn means for the match as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Others in the rotation still have their turn this round.
    Continue,
    /// Everyone had a turn; the round counter moved on.
    NextRound,
    /// Everyone had a turn and that was the last round.
    GameOver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub token: String,
    pub submitted_word: String,
    pub was_valid: bool,
    pub points: u32,
    pub top_matches: Vec<String>,
    pub cycle: CycleOutcome,
}

/// Who took over when a participant left.
#[derive(Debug)]
pub struct Removal {
    pub participant: Participant,
    pub was_leader: bool,
    pub new_leader: Option<String>,
    /// Set when everyone still active had already played, so the departure
    /// closed out the round.
    pub cycle: Option<CycleOutcome>,
}

#[derive(Debug)]
pub struct GameState {
    pub started: bool,
    pub current_round: u32,
    pub max_rounds: u32,
    pub remaining_seconds: u32,
    pub round_duration_seconds: u32,
    pub min_acceptable_combinations: u32,
    pub current_input: String,
    pub head_letter: String,
    pub tail_letter: String,
    pub round_over: bool,
    /// Tokens that finished a turn since the last completed round
    played_this_round: HashSet<String>,
    /// Active participants by token
    participants: HashMap<String, Participant>,
    /// Rotation order; the head is the leader
    queue: VecDeque<String>,
}

impl GameState {
    pub fn new(options: GameOptions) -> Self {
        Self {
            started: false,
            current_round: 1,
            max_rounds: options.max_rounds,
            remaining_seconds: 0,
            round_duration_seconds: options.round_duration_seconds,
            min_acceptable_combinations: options.min_acceptable_combinations,
            current_input: String::new(),
            head_letter: String::new(),
            tail_letter: String::new(),
            round_over: false,
            played_this_round: HashSet::new(),
            participants: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Adds a participant to the active set and the back of the rotation.
    /// Returns false if the token is already active.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.token) {
            return false;
        }
        let token = participant.token.clone();
        info!("Added player {} ({})", participant.username, token);
        self.participants.insert(token.clone(), participant);
        self.enqueue(&token);
        true
    }

    /// Appends an active participant to the rotation. The first one in an
    /// empty queue becomes leader.
    pub fn enqueue(&mut self, token: &str) {
        if self.queue.iter().any(|queued| queued == token) {
            return;
        }
        let Some(participant) = self.participants.get_mut(token) else {
            return;
        };
        participant.is_leader = self.queue.is_empty();
        self.queue.push_back(token.to_string());
    }

    /// Pops the leader off the rotation and promotes the next in line.
    pub fn dequeue(&mut self) -> Option<String> {
        let token = self.queue.pop_front()?;
        if let Some(participant) = self.participants.get_mut(&token) {
            participant.is_leader = false;
        }
        self.promote_head();
        Some(token)
    }

    fn promote_head(&mut self) -> Option<String> {
        let head = self.queue.front()?.clone();
        if let Some(participant) = self.participants.get_mut(&head) {
            participant.is_leader = true;
        }
        Some(head)
    }

    pub fn remove_participant(&mut self, token: &str) -> Option<Removal> {
        let participant = self.participants.remove(token)?;
        let was_leader = self.queue.front().map(String::as_str) == Some(token);
        self.queue.retain(|queued| queued != token);
        let new_leader = if was_leader { self.promote_head() } else { None };
        self.played_this_round.remove(token);
        let cycle = self.settle_cycle();

        info!("Removed player {} ({})", participant.username, token);
        Some(Removal {
            participant,
            was_leader,
            new_leader,
            cycle,
        })
    }

    pub fn participant(&self, token: &str) -> Option<&Participant> {
        self.participants.get(token)
    }

    pub fn participant_mut(&mut self, token: &str) -> Option<&mut Participant> {
        self.participants.get_mut(token)
    }

    /// Active participants in rotation order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.queue
            .iter()
            .filter_map(|token| self.participants.get(token))
    }

    pub fn leader_token(&self) -> Option<&str> {
        self.queue.front().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Fails unless `token` is an active participant at the head of the rotation.
    pub fn require_leader(&self, token: &str) -> GameResult<()> {
        let participant = self
            .participants
            .get(token)
            .ok_or(GameError::ParticipantNotFound)?;
        if participant.is_leader {
            Ok(())
        } else {
            Err(GameError::NotLeader)
        }
    }

    /// Moves the session out of the lobby. Returns false if it already was.
    pub fn initialize<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.head_letter = random_letter(rng);
        self.tail_letter = random_letter(rng);
        self.remaining_seconds = self.round_duration_seconds;
        self.current_input.clear();
        self.round_over = false;
        true
    }

    /// Prepares the state for a new countdown: fresh letters that meet the
    /// difficulty floor, a full timer and an empty input.
    pub fn begin_round<R: Rng>(&mut self, lexicon: &dyn Lexicon, rng: &mut R) -> LetterDraw {
        self.started = true;
        self.round_over = false;
        self.remaining_seconds = self.round_duration_seconds;
        self.current_input.clear();
        self.draw_letters(lexicon, rng)
    }

    /// Draws head and tail letters independently until the pair has at least
    /// `min_acceptable_combinations` matching words, giving up after
    /// [`MAX_LETTER_DRAWS`] attempts and keeping the richest pair seen.
    pub fn draw_letters<R: Rng>(&mut self, lexicon: &dyn Lexicon, rng: &mut R) -> LetterDraw {
        let floor = self.min_acceptable_combinations as usize;
        let mut best: Option<(String, String, usize)> = None;

        for attempt in 1..=MAX_LETTER_DRAWS {
            let head = random_letter(rng);
            let tail = random_letter(rng);
            let matches = lexicon.count(&head, &tail);

            if matches >= floor {
                self.head_letter = head;
                self.tail_letter = tail;
                return LetterDraw {
                    attempts: attempt,
                    matches,
                    relaxed: false,
                };
            }
            if best.as_ref().map_or(true, |(_, _, most)| matches > *most) {
                best = Some((head, tail, matches));
            }
        }

        // The loop always runs at least once, so best is populated
        let (head, tail, matches) = best.unwrap_or_default();
        warn!(
            "No letter pair reached {} words after {} draws; using {}..{} with {}",
            floor, MAX_LETTER_DRAWS, head, tail, matches
        );
        self.head_letter = head;
        self.tail_letter = tail;
        LetterDraw {
            attempts: MAX_LETTER_DRAWS,
            matches,
            relaxed: true,
        }
    }

    /// One countdown step.
    pub fn tick(&mut self) -> u32 {
        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
        self.remaining_seconds
    }

    /// Stores the leader's current fragment, lowercased.
    pub fn set_input(&mut self, token: &str, input: &str) -> GameResult<()> {
        self.require_leader(token)?;
        if !self.started {
            return Err(GameError::SessionNotStarted);
        }
        self.current_input = input.to_lowercase();
        Ok(())
    }

    pub fn apply_options(&mut self, options: GameOptions) -> GameResult<()> {
        if options.max_rounds == 0 {
            return Err(GameError::InvalidOptions("maxRounds must be at least 1"));
        }
        if options.round_duration_seconds == 0 {
            return Err(GameError::InvalidOptions(
                "roundDurationSeconds must be at least 1",
            ));
        }
        self.max_rounds = options.max_rounds;
        self.round_duration_seconds = options.round_duration_seconds;
        self.min_acceptable_combinations = options.min_acceptable_combinations;
        Ok(())
    }

    /// Scores the leader's answer, rotates them to the back and works out
    /// whether that completed the round or the match.
    ///
    /// Returns None when nobody is in the rotation.
    pub fn finish_turn(&mut self, lexicon: &dyn Lexicon) -> Option<TurnResult> {
        let submitted_word = format!(
            "{}{}{}",
            self.head_letter, self.current_input, self.tail_letter
        );
        let token = self.dequeue()?;

        let points = lexicon.score(&submitted_word);
        if let Some(participant) = self.participants.get_mut(&token) {
            participant.score += points;
        }
        self.enqueue(&token);

        self.played_this_round.insert(token.clone());
        let cycle = self.settle_cycle().unwrap_or(CycleOutcome::Continue);
        self.round_over = true;

        debug!(
            "Turn for {} scored {} ({}), cycle {:?}",
            token, points, submitted_word, cycle
        );
        Some(TurnResult {
            token,
            was_valid: lexicon.is_valid(&submitted_word),
            top_matches: lexicon.top_matches(&self.head_letter, &self.tail_letter),
            submitted_word,
            points,
            cycle,
        })
    }

    /// How many active participants have played since the round began.
    pub fn turns_taken_this_round(&self) -> usize {
        self.played_this_round.len()
    }

    /// Closes out the round once every active participant has played in it,
    /// advancing the counter or ending the match.
    fn settle_cycle(&mut self) -> Option<CycleOutcome> {
        if self.played_this_round.is_empty()
            || !self
                .participants
                .keys()
                .all(|token| self.played_this_round.contains(token))
        {
            return None;
        }
        self.played_this_round.clear();
        if self.current_round >= self.max_rounds {
            Some(CycleOutcome::GameOver)
        } else {
            self.current_round += 1;
            Some(CycleOutcome::NextRound)
        }
    }

    /// Final ranking: highest score first, tied scores share a rank.
    pub fn standings(&self) -> Vec<Standing> {
        let mut scores: Vec<(&str, u32)> = self
            .participants
            .values()
            .map(|p| (p.username.as_str(), p.score))
            .collect();
        scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        scores
            .iter()
            .map(|(username, score)| Standing {
                username: username.to_string(),
                score: *score,
                rank: 1 + scores.iter().filter(|(_, other)| other > score).count() as u32,
            })
            .collect()
    }

    /// Back to the lobby with everyone kept in place and all scores zeroed.
    pub fn reset_to_lobby(&mut self) {
        self.started = false;
        self.current_round = 1;
        self.remaining_seconds = 0;
        self.current_input.clear();
        self.head_letter.clear();
        self.tail_letter.clear();
        self.round_over = false;
        self.played_this_round.clear();
        for participant in self.participants.values_mut() {
            participant.score = 0;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            started: self.started,
            current_round: self.current_round,
            max_rounds: self.max_rounds,
            remaining_seconds: self.remaining_seconds,
            round_duration_seconds: self.round_duration_seconds,
            min_acceptable_combinations: self.min_acceptable_combinations,
            rotation_queue: self.participants().map(Participant::snapshot).collect(),
            current_input: self.current_input.clone(),
            head_letter: self.head_letter.clone(),
            tail_letter: self.tail_letter.clone(),
            round_over: self.round_over,
        }
    }
}

pub fn random_letter<R: Rng>(rng: &mut R) -> String {
    let index = rng.gen_range(0..ALPHABET.len());
    char::from(ALPHABET[index]).to_string()
}
