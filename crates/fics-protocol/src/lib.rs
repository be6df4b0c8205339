use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage sentinel used by the observations table when no status was recorded.
pub const OFFLINE: &str = "OFFLINE";

/// Activity state reported by the server as a single-character code.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ingame,
    SimulMatch,
    NotOpen,
    Examining,
    Inactive,
    Intournament,
}

impl Status {
    /// Map a server status code to its enumerant. Codes outside the closed
    /// set return `None` and the surrounding token is dropped by the parser.
    pub fn from_code(code: char) -> Option<Status> {
        match code {
            '^' => Some(Status::Ingame),
            '~' => Some(Status::SimulMatch),
            ':' => Some(Status::NotOpen),
            '#' => Some(Status::Examining),
            '.' => Some(Status::Inactive),
            '&' => Some(Status::Intournament),
            _ => None,
        }
    }

    /// Uppercase token stored in the observations table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ingame => "INGAME",
            Status::SimulMatch => "SIMUL_MATCH",
            Status::NotOpen => "NOT_OPEN",
            Status::Examining => "EXAMINING",
            Status::Inactive => "INACTIVE",
            Status::Intournament => "INTOURNAMENT",
        }
    }
}

/// One player as listed in a `who` reply.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Player {
    pub rating: i64,
    pub status: Status,
    pub name: String,
}

// Data rows are <rating><status-char><name> with no embedded whitespace.
// Everything else in the reply (headers, counts, prompts) fails the match.
static WHO_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)(\S)(.+)$").expect("who token regex"));

/// Parse one whitespace-delimited token from a `who` reply.
///
/// Returns `None` for server chrome and for status codes outside the closed
/// set; a mismatch is not an error.
pub fn parse_token(token: &str) -> Option<Player> {
    let caps = WHO_TOKEN.captures(token)?;
    let rating: i64 = caps[1].parse().ok()?;
    let status = Status::from_code(caps[2].chars().next()?)?;
    Some(Player {
        rating,
        status,
        name: caps[3].to_string(),
    })
}

/// Frozen snapshot of one poll, keyed by player name.
///
/// Duplicate names collapse (the later token wins); construction is the only
/// write path.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    players: BTreeMap<String, Player>,
}

impl Roster {
    /// Tokenize a raw reply on whitespace and keep every token that matches
    /// the player grammar.
    pub fn parse(text: &str) -> Roster {
        let players = text
            .split_whitespace()
            .filter_map(parse_token)
            .map(|p| (p.name.clone(), p))
            .collect();
        Roster { players }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.players.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Player> {
        self.players.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.players.keys().map(|s| s.as_str())
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }
}
