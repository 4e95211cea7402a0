use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ROUNDS: u32 = 10;
pub const DEFAULT_ROUND_DURATION_SECS: u32 = 25;
pub const DEFAULT_MIN_COMBINATIONS: u32 = 400;
pub const MAX_USERNAME_LEN: usize = 20;
pub const LETTER_REVEAL_UNITS: u32 = 3;
pub const TOP_MATCH_COUNT: usize = 3;

// Inbound envelope types
pub const JOIN_GAME: &str = "JOIN_GAME";
pub const START_GAME: &str = "START_GAME";
pub const ROUND_START: &str = "ROUND_START";
pub const NEXT_ROUND: &str = "NEXT_ROUND";
pub const PLAYER_INPUT: &str = "PLAYER_INPUT";
pub const UPDATE_GAME_OPTIONS: &str = "UPDATE_GAME_OPTIONS";
pub const RESET_LOBBY: &str = "RESET_LOBBY";
pub const LEAVE_GAME: &str = "LEAVE_GAME";

// Outbound envelope types
pub const NEW_CLIENT: &str = "NEW_CLIENT";
pub const GAME_STATE: &str = "GAME_STATE";
pub const PLAYER_STATE: &str = "PLAYER_STATE";
pub const ROUND_ATAMA: &str = "ROUND_ATAMA";
pub const ROUND_OSHIRI: &str = "ROUND_OSHIRI";
pub const ROUND_FINISHED: &str = "ROUND_FINISHED";
pub const GAME_OVER: &str = "GAME_OVER";
pub const ERROR: &str = "ERROR";

/// Every frame on the wire is one of these: a type tag and a payload whose
/// shape depends on the tag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// An envelope that carries no payload, e.g. `ROUND_START` from a client.
    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: serde_json::Value::Null,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decodes the payload into the shape expected for this envelope type.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinGame {
    pub session_id: String,
    pub username: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartGame {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInput {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    pub input: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameOptions {
    pub max_rounds: u32,
    pub round_duration_seconds: u32,
    pub min_acceptable_combinations: u32,
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            round_duration_seconds: DEFAULT_ROUND_DURATION_SECS,
            min_acceptable_combinations: DEFAULT_MIN_COMBINATIONS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewClient {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LetterReveal {
    pub letter: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
}

/// What other clients get to see of a participant. The token stays private.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub username: String,
    pub score: u32,
    pub is_leader: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub started: bool,
    pub current_round: u32,
    pub max_rounds: u32,
    pub remaining_seconds: u32,
    pub round_duration_seconds: u32,
    pub min_acceptable_combinations: u32,
    pub rotation_queue: Vec<ParticipantSnapshot>,
    pub current_input: String,
    pub head_letter: String,
    pub tail_letter: String,
    pub round_over: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundFinished {
    pub top_matches: Vec<String>,
    pub submitted_word: String,
    pub was_valid: bool,
    pub game_state: SessionSnapshot,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Standing {
    pub username: String,
    pub score: u32,
    pub rank: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GameOver {
    pub standings: Vec<Standing>,
}
