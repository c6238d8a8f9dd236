use chrono::NaiveDateTime;
#[cfg(feature = "ssr")]
use diesel::deserialize::{self, FromSql, FromSqlRow};
#[cfg(feature = "ssr")]
use diesel::expression::AsExpression;
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::serialize::{self, IsNull, Output, ToSql};
#[cfg(feature = "ssr")]
use diesel::sql_types::Text;
#[cfg(feature = "ssr")]
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Emoji given to participants who don't pick one.
pub const DEFAULT_EMOJI: &str = "👤";

/// Length of a session join code.
pub const SESSION_CODE_LEN: usize = 6;

/// Returned when a stored or submitted string doesn't name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(AsExpression, FromSqlRow))]
#[cfg_attr(feature = "ssr", diesel(sql_type = Text))]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Voting,
    Revealed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 3] = [Self::Waiting, Self::Voting, Self::Revealed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Voting => "voting",
            Self::Revealed => "revealed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "session status",
                value: s.to_string(),
            })
    }
}

/// The fixed deck. Anything outside it is rejected before it reaches the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(AsExpression, FromSqlRow))]
#[cfg_attr(feature = "ssr", diesel(sql_type = Text))]
pub enum CardValue {
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "1/2")]
    Half,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "13")]
    Thirteen,
    #[serde(rename = "21")]
    TwentyOne,
    #[serde(rename = "?")]
    Unsure,
    #[serde(rename = "☕")]
    Coffee,
}

impl CardValue {
    pub const ALL: [CardValue; 11] = [
        Self::Zero,
        Self::Half,
        Self::One,
        Self::Two,
        Self::Three,
        Self::Five,
        Self::Eight,
        Self::Thirteen,
        Self::TwentyOne,
        Self::Unsure,
        Self::Coffee,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zero => "0",
            Self::Half => "1/2",
            Self::One => "1",
            Self::Two => "2",
            Self::Three => "3",
            Self::Five => "5",
            Self::Eight => "8",
            Self::Thirteen => "13",
            Self::TwentyOne => "21",
            Self::Unsure => "?",
            Self::Coffee => "☕",
        }
    }
}

impl fmt::Display for CardValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardValue {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|card| card.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "card value",
                value: s.to_string(),
            })
    }
}

#[cfg(feature = "ssr")]
impl ToSql<Text, Sqlite> for SessionStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

#[cfg(feature = "ssr")]
impl FromSql<Text, Sqlite> for SessionStatus {
    fn from_sql(bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(value.parse()?)
    }
}

#[cfg(feature = "ssr")]
impl ToSql<Text, Sqlite> for CardValue {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

#[cfg(feature = "ssr")]
impl FromSql<Text, Sqlite> for CardValue {
    fn from_sql(bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        Ok(value.parse()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable, Identifiable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::poker_sessions))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct PokerSession {
    pub id: i32,
    pub code: String,
    pub host_id: Option<i32>,
    pub current_round: i32,
    pub status: SessionStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::poker_sessions)]
pub struct NewPokerSession<'a> {
    pub code: &'a str,
    // host_id is filled in once the host participant exists
    // current_round, status, and timestamps use defaults
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable, Identifiable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::participants))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Participant {
    pub id: i32,
    pub session_id: i32,
    pub name: String,
    pub emoji: String,
    /// Bearer credential. Handed out once on create/join, never serialized afterwards.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub joined_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::participants)]
pub struct NewParticipant<'a> {
    pub session_id: i32,
    pub name: &'a str,
    pub emoji: &'a str,
    pub token: &'a str,
    // joined_at uses default
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable, Identifiable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::votes))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Vote {
    pub id: i32,
    pub session_id: i32,
    /// None once the participant has left; the vote itself is kept for history.
    pub participant_id: Option<i32>,
    pub round: i32,
    pub card_value: CardValue,
    pub voted_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::votes)]
pub struct NewVote {
    pub session_id: i32,
    pub participant_id: Option<i32>,
    pub round: i32,
    pub card_value: CardValue,
    pub voted_at: NaiveDateTime,
}

/// A vote joined with whoever cast it, as shown once cards are revealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable))]
pub struct RevealedVote {
    pub vote_id: i32,
    pub participant_id: Option<i32>,
    pub participant_name: Option<String>,
    pub participant_emoji: Option<String>,
    pub card_value: CardValue,
    pub voted_at: NaiveDateTime,
}

/// Everything a participant needs to render a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub code: String,
    pub status: SessionStatus,
    pub current_round: i32,
    pub host_id: Option<i32>,
    pub participants: Vec<Participant>,
    /// Who has voted in the current round. Card values stay hidden until reveal.
    pub voted_participant_ids: Vec<i32>,
    /// Empty unless the session is revealed.
    pub votes: Vec<RevealedVote>,
}
