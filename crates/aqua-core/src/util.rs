//! Small shared helpers: identifiers, agent names, timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::seq::SliceRandom;
use uuid::Uuid;

/// Adjectives for generated agent names.
const ADJECTIVES: &[&str] = &[
    "brave", "calm", "dark", "eager", "fair", "gentle", "happy", "idle", "jolly", "keen", "lively",
    "merry", "noble", "odd", "proud", "quick", "rapid", "silent", "tall", "unique", "vivid", "warm",
    "young", "zesty", "amber", "blue", "coral", "dusty", "emerald", "frosty", "golden", "hazy",
];

/// Nouns for generated agent names.
const NOUNS: &[&str] = &[
    "falcon", "tiger", "eagle", "wolf", "bear", "lion", "hawk", "fox", "otter", "raven", "shark",
    "whale", "cobra", "crane", "drake", "elk", "finch", "gecko", "heron", "ibis", "jay", "koala",
    "lemur", "moose", "newt", "owl", "panda", "quail", "robin", "swan", "trout", "viper",
];

/// Generates a short unique identifier (8 hex characters).
#[must_use]
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Generates a memorable agent name like `brave-falcon`.
#[must_use]
pub fn agent_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let noun = NOUNS.choose(&mut rng).expect("non-empty list");
    format!("{adjective}-{noun}")
}

/// Current UTC time as an RFC 3339 string.
///
/// All timestamp columns use this one format so lexicographic comparison
/// in SQL matches chronological order.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Formats an arbitrary instant the same way [`now_rfc3339`] does.
#[must_use]
pub fn to_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp column written by [`now_rfc3339`].
///
/// Malformed values fall back to the Unix epoch rather than aborting a
/// query mid-row.
#[must_use]
pub fn parse_rfc3339(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

/// Parses an optional timestamp column.
#[must_use]
pub fn parse_rfc3339_opt(text: Option<String>) -> Option<DateTime<Utc>> {
    text.map(|value| parse_rfc3339(&value))
}

/// Splits a comma-separated tag string, dropping empty entries.
#[must_use]
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
