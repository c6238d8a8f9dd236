pub mod model;
pub mod round;
pub mod state;

#[cfg(feature = "ssr")]
pub mod app;
#[cfg(feature = "ssr")]
pub mod config;
#[cfg(feature = "ssr")]
pub mod error;
#[cfg(feature = "ssr")]
pub mod events;
#[cfg(feature = "ssr")]
pub mod schema;

#[cfg(feature = "ssr")]
use chrono::Utc;
#[cfg(feature = "ssr")]
use diesel::connection::{AnsiTransactionManager, SimpleConnection, TransactionManager};
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
#[cfg(feature = "ssr")]
use diesel::result::DatabaseErrorKind;
#[cfg(feature = "ssr")]
use diesel::SqliteConnection;
#[cfg(feature = "ssr")]
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
#[cfg(feature = "ssr")]
use rand::Rng;
#[cfg(feature = "ssr")]
use uuid::Uuid;

#[cfg(feature = "ssr")]
use crate::error::PokerError;
#[cfg(feature = "ssr")]
use crate::model::{
    CardValue, NewParticipant, NewPokerSession, NewVote, Participant, PokerSession, RevealedVote,
    SessionSnapshot, SessionStatus, Vote, SESSION_CODE_LEN,
};
#[cfg(feature = "ssr")]
use crate::round::{AutoRevealPolicy, RoundTally};
#[cfg(feature = "ssr")]
use crate::schema::{participants, poker_sessions, votes};
#[cfg(feature = "ssr")]
use crate::state::{transition, SessionAction};

#[cfg(feature = "ssr")]
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

#[cfg(feature = "ssr")]
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Characters a session code is drawn from.
#[cfg(feature = "ssr")]
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// How many fresh codes to try before giving up on creating a session.
#[cfg(feature = "ssr")]
const MAX_CODE_ATTEMPTS: usize = 8;

#[cfg(feature = "ssr")]
const HOST_LEFT_REASON: &str = "Host left the session";

// Enable WAL mode to allow concurrent reads during writes, and a timeout to retry locked
// operations. Foreign keys are off by default in SQLite and the cascades depend on them.
#[cfg(feature = "ssr")]
fn apply_pragmas(conn: &mut SqliteConnection) -> QueryResult<()> {
    conn.batch_execute(
        "PRAGMA busy_timeout = 10000; \
        PRAGMA foreign_keys = ON; \
        PRAGMA journal_mode = WAL; \
        PRAGMA synchronous = NORMAL;",
    )
}

#[cfg(feature = "ssr")]
#[derive(Debug, Clone, Copy)]
struct SqlitePragmas;

#[cfg(feature = "ssr")]
impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        apply_pragmas(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Opens a single connection with the same PRAGMAs the pool uses.
#[cfg(feature = "ssr")]
pub fn establish_connection(database_url: &str) -> Result<SqliteConnection, PokerError> {
    let mut conn = SqliteConnection::establish(database_url)?;
    apply_pragmas(&mut conn)?;
    Ok(conn)
}

/// Builds the shared connection pool. Every new connection gets the PRAGMAs applied.
#[cfg(feature = "ssr")]
pub fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool, PokerError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .connection_customizer(Box::new(SqlitePragmas))
        .build(manager)?;
    Ok(pool)
}

/// Applies any migration that hasn't run yet.
#[cfg(feature = "ssr")]
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), PokerError> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| PokerError::Migration(e.to_string()))?;
    for version in applied {
        tracing::info!(%version, "applied migration");
    }
    Ok(())
}

/// Runs `f` in a write transaction. Top-level calls take the write lock up front with
/// `BEGIN IMMEDIATE`; nested calls become savepoints.
#[cfg(feature = "ssr")]
fn write_transaction<T, F>(conn: &mut SqliteConnection, f: F) -> Result<T, PokerError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, PokerError>,
{
    let depth = AnsiTransactionManager::transaction_manager_status_mut(conn).transaction_depth()?;
    if depth.is_some() {
        conn.transaction(f)
    } else {
        conn.immediate_transaction(f)
    }
}

/// Generates a random join code such as `K7Q2ZD`.
#[cfg(feature = "ssr")]
pub fn generate_session_code() -> String {
    let mut rng = rand::rng();
    (0..SESSION_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(feature = "ssr")]
fn is_unique_violation(err: &diesel::result::Error) -> bool {
    matches!(
        err,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

/// Inserts a session row, relying on the UNIQUE constraint on `code` and regenerating the code
/// when it collides.
#[cfg(feature = "ssr")]
fn insert_session_with_unique_code<F>(
    conn: &mut SqliteConnection,
    mut next_code: F,
) -> Result<PokerSession, PokerError>
where
    F: FnMut() -> String,
{
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = next_code();
        let inserted = diesel::insert_into(poker_sessions::table)
            .values(&NewPokerSession { code: &code })
            .returning(PokerSession::as_returning())
            .get_result(conn);
        match inserted {
            Ok(session) => return Ok(session),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(attempt, "session code collision, regenerating");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PokerError::Internal(format!(
        "could not find a free session code after {} attempts",
        MAX_CODE_ATTEMPTS
    )))
}

#[cfg(feature = "ssr")]
fn insert_participant(
    conn: &mut SqliteConnection,
    session_id: i32,
    name: &str,
    emoji: &str,
) -> Result<Participant, PokerError> {
    let token = Uuid::new_v4().to_string();
    let participant = diesel::insert_into(participants::table)
        .values(&NewParticipant {
            session_id,
            name,
            emoji,
            token: &token,
        })
        .returning(Participant::as_returning())
        .get_result(conn)?;
    Ok(participant)
}

/// Creates a session in the `waiting` state at round 1 with `host_name` as its host. Returns
/// the session and the host participant, whose `token` is their credential.
#[cfg(feature = "ssr")]
pub fn create_session(
    conn: &mut SqliteConnection,
    host_name: &str,
    host_emoji: &str,
) -> Result<(PokerSession, Participant), PokerError> {
    create_session_with_codes(conn, host_name, host_emoji, generate_session_code)
}

#[cfg(feature = "ssr")]
fn create_session_with_codes<F>(
    conn: &mut SqliteConnection,
    host_name: &str,
    host_emoji: &str,
    next_code: F,
) -> Result<(PokerSession, Participant), PokerError>
where
    F: FnMut() -> String,
{
    write_transaction(conn, |conn| {
        let session = insert_session_with_unique_code(conn, next_code)?;
        let host = insert_participant(conn, session.id, host_name, host_emoji)?;

        let session = diesel::update(&session)
            .set(poker_sessions::host_id.eq(Some(host.id)))
            .returning(PokerSession::as_returning())
            .get_result(conn)?;

        tracing::info!(code = %session.code, host_id = host.id, "session created");
        Ok((session, host))
    })
}

/// Looks a session up by its join code.
#[cfg(feature = "ssr")]
pub fn find_session_by_code(
    conn: &mut SqliteConnection,
    code: &str,
) -> Result<PokerSession, PokerError> {
    poker_sessions::table
        .filter(poker_sessions::code.eq(code))
        .select(PokerSession::as_select())
        .first(conn)
        .optional()?
        .ok_or(PokerError::NotFound("session"))
}

/// Adds a participant to the session with the given code. Joining is allowed in every status.
/// Returns the session, the new participant, and the full roster.
#[cfg(feature = "ssr")]
pub fn join_session(
    conn: &mut SqliteConnection,
    code: &str,
    name: &str,
    emoji: &str,
) -> Result<(PokerSession, Participant, Vec<Participant>), PokerError> {
    write_transaction(conn, |conn| {
        let session = find_session_by_code(conn, code)?;
        let participant = insert_participant(conn, session.id, name, emoji)?;
        let roster = list_participants(conn, session.id)?;

        tracing::info!(code, participant_id = participant.id, "participant joined");
        Ok((session, participant, roster))
    })
}

/// Resolves a bearer credential to its participant.
#[cfg(feature = "ssr")]
pub fn get_participant_by_token(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Participant, PokerError> {
    // Tokens are always UUIDs, so anything else can't match.
    if Uuid::parse_str(token).is_err() {
        return Err(PokerError::Unauthorized("Invalid or missing token"));
    }

    participants::table
        .filter(participants::token.eq(token))
        .select(Participant::as_select())
        .first(conn)
        .optional()?
        .ok_or(PokerError::Unauthorized("Invalid or missing token"))
}

/// All participants of a session, in join order.
#[cfg(feature = "ssr")]
pub fn list_participants(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Vec<Participant>, PokerError> {
    Ok(participants::table
        .filter(participants::session_id.eq(session_id))
        .order(participants::id.asc())
        .select(Participant::as_select())
        .load(conn)?)
}

#[cfg(feature = "ssr")]
fn load_session(conn: &mut SqliteConnection, session_id: i32) -> Result<PokerSession, PokerError> {
    poker_sessions::table
        .find(session_id)
        .select(PokerSession::as_select())
        .first(conn)
        .optional()?
        .ok_or(PokerError::NotFound("session"))
}

/// Runs a host action through the state machine and stores the result. A rejected action
/// leaves the row untouched.
#[cfg(feature = "ssr")]
fn apply_action(
    conn: &mut SqliteConnection,
    session: &PokerSession,
    action: SessionAction,
) -> Result<PokerSession, PokerError> {
    let next = transition(session.status, session.current_round, action)?;
    let updated = diesel::update(session)
        .set((
            poker_sessions::status.eq(next.status),
            poker_sessions::current_round.eq(next.round),
            poker_sessions::updated_at.eq(Utc::now().naive_utc()),
        ))
        .returning(PokerSession::as_returning())
        .get_result(conn)?;
    Ok(updated)
}

/// waiting -> voting.
#[cfg(feature = "ssr")]
pub fn start_voting(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<PokerSession, PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        let session = apply_action(conn, &session, SessionAction::Start)?;
        tracing::info!(code = %session.code, round = session.current_round, "voting started");
        Ok(session)
    })
}

/// voting -> revealed. Returns the session and the votes of the round just revealed.
#[cfg(feature = "ssr")]
pub fn reveal_cards(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<(PokerSession, Vec<RevealedVote>), PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        let session = apply_action(conn, &session, SessionAction::Reveal)?;
        let votes = current_round_votes(conn, &session)?;
        tracing::info!(
            code = %session.code,
            round = session.current_round,
            votes = votes.len(),
            "cards revealed"
        );
        Ok((session, votes))
    })
}

/// revealed -> voting, one round further.
#[cfg(feature = "ssr")]
pub fn next_round(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<PokerSession, PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        let session = apply_action(conn, &session, SessionAction::NextRound)?;
        tracing::info!(code = %session.code, round = session.current_round, "next round started");
        Ok(session)
    })
}

/// Votes of the session's current round joined with whoever cast them, oldest first.
#[cfg(feature = "ssr")]
pub fn current_round_votes(
    conn: &mut SqliteConnection,
    session: &PokerSession,
) -> Result<Vec<RevealedVote>, PokerError> {
    Ok(votes::table
        .left_join(participants::table)
        .filter(votes::session_id.eq(session.id))
        .filter(votes::round.eq(session.current_round))
        .order(votes::voted_at.asc())
        .then_order_by(votes::id.asc())
        .select((
            votes::id,
            votes::participant_id,
            participants::name.nullable(),
            participants::emoji.nullable(),
            votes::card_value,
            votes::voted_at,
        ))
        .load::<RevealedVote>(conn)?)
}

/// Vote completeness for the session's current round. Every vote cast in the round counts,
/// including those of participants who have since left.
#[cfg(feature = "ssr")]
pub fn voting_stats(
    conn: &mut SqliteConnection,
    session: &PokerSession,
) -> Result<RoundTally, PokerError> {
    let votes_cast: i64 = votes::table
        .filter(votes::session_id.eq(session.id))
        .filter(votes::round.eq(session.current_round))
        .count()
        .get_result(conn)?;
    let total_participants: i64 = participants::table
        .filter(participants::session_id.eq(session.id))
        .count()
        .get_result(conn)?;
    Ok(RoundTally {
        votes_cast,
        total_participants,
    })
}

/// Result of a vote submission.
#[cfg(feature = "ssr")]
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub vote: Vote,
    pub tally: RoundTally,
    /// The session after the vote. Only differs from before when auto-reveal kicked in.
    pub session: PokerSession,
    /// Set when this vote completed the round and the policy revealed it.
    pub revealed_votes: Option<Vec<RevealedVote>>,
}

#[cfg(feature = "ssr")]
impl VoteOutcome {
    pub fn auto_revealed(&self) -> bool {
        self.revealed_votes.is_some()
    }
}

/// Records `participant_id`'s card for the current round, replacing any earlier card of theirs
/// in the same round. Only allowed while the session is voting.
#[cfg(feature = "ssr")]
pub fn submit_vote(
    conn: &mut SqliteConnection,
    session_id: i32,
    participant_id: i32,
    card_value: CardValue,
    policy: AutoRevealPolicy,
) -> Result<VoteOutcome, PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        let current = transition(session.status, session.current_round, SessionAction::Vote)?;

        let now = Utc::now().naive_utc();
        diesel::insert_into(votes::table)
            .values(&NewVote {
                session_id: session.id,
                participant_id: Some(participant_id),
                round: current.round,
                card_value,
                voted_at: now,
            })
            .on_conflict((votes::session_id, votes::participant_id, votes::round))
            .do_update()
            .set((votes::card_value.eq(card_value), votes::voted_at.eq(now)))
            .execute(conn)?;

        let vote: Vote = votes::table
            .filter(votes::session_id.eq(session.id))
            .filter(votes::participant_id.eq(Some(participant_id)))
            .filter(votes::round.eq(current.round))
            .select(Vote::as_select())
            .first(conn)?;

        let tally = voting_stats(conn, &session)?;
        tracing::info!(
            code = %session.code,
            round = current.round,
            participant_id,
            votes_cast = tally.votes_cast,
            total = tally.total_participants,
            "vote recorded"
        );

        if tally.should_auto_reveal(policy) {
            let session = apply_action(conn, &session, SessionAction::Reveal)?;
            let revealed = current_round_votes(conn, &session)?;
            tracing::info!(code = %session.code, round = session.current_round, "round auto-revealed");
            return Ok(VoteOutcome {
                vote,
                tally,
                session,
                revealed_votes: Some(revealed),
            });
        }

        Ok(VoteOutcome {
            vote,
            tally,
            session,
            revealed_votes: None,
        })
    })
}

/// What a session looks like to one of its participants. Card values stay hidden until the
/// round is revealed.
#[cfg(feature = "ssr")]
pub fn get_session_snapshot(
    conn: &mut SqliteConnection,
    session: &PokerSession,
) -> Result<SessionSnapshot, PokerError> {
    let participants = list_participants(conn, session.id)?;
    let voted_participant_ids: Vec<i32> = votes::table
        .filter(votes::session_id.eq(session.id))
        .filter(votes::round.eq(session.current_round))
        .filter(votes::participant_id.is_not_null())
        .order(votes::id.asc())
        .select(votes::participant_id.assume_not_null())
        .load(conn)?;
    let votes = if session.status == SessionStatus::Revealed {
        current_round_votes(conn, session)?
    } else {
        Vec::new()
    };

    Ok(SessionSnapshot {
        code: session.code.clone(),
        status: session.status,
        current_round: session.current_round,
        host_id: session.host_id,
        participants,
        voted_participant_ids,
        votes,
    })
}

/// Every vote ever cast in a session, including those whose participant has since left.
#[cfg(feature = "ssr")]
pub fn get_session_votes(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Vec<Vote>, PokerError> {
    Ok(votes::table
        .filter(votes::session_id.eq(session_id))
        .order((votes::round.asc(), votes::id.asc()))
        .select(Vote::as_select())
        .load(conn)?)
}

/// Outcome of a participant leaving.
#[cfg(feature = "ssr")]
#[derive(Debug, Clone, PartialEq)]
pub enum Departure {
    /// The host left, so the session and its roster are gone.
    SessionEnded { code: String, reason: &'static str },
    /// Somebody else left; the session carries on.
    ParticipantLeft {
        participant: Participant,
        remaining: Vec<Participant>,
    },
}

/// Removes `participant_id` from the session. If they are the host the whole session is
/// deleted (participants cascade); votes always survive with their participant nulled.
#[cfg(feature = "ssr")]
pub fn leave_session(
    conn: &mut SqliteConnection,
    session_id: i32,
    participant_id: i32,
) -> Result<Departure, PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        let participant: Participant = participants::table
            .filter(participants::id.eq(participant_id))
            .filter(participants::session_id.eq(session.id))
            .select(Participant::as_select())
            .first(conn)
            .optional()?
            .ok_or(PokerError::Forbidden("You are not a member of this session"))?;

        if session.host_id == Some(participant.id) {
            diesel::delete(&session).execute(conn)?;
            tracing::info!(code = %session.code, "host left, session ended");
            return Ok(Departure::SessionEnded {
                code: session.code,
                reason: HOST_LEFT_REASON,
            });
        }

        diesel::delete(&participant).execute(conn)?;
        let remaining = list_participants(conn, session.id)?;
        tracing::info!(
            code = %session.code,
            participant_id = participant.id,
            remaining = remaining.len(),
            "participant left"
        );
        Ok(Departure::ParticipantLeft {
            participant,
            remaining,
        })
    })
}

/// Host removes another participant. Returns the removed participant and the remaining roster.
#[cfg(feature = "ssr")]
pub fn remove_participant(
    conn: &mut SqliteConnection,
    session_id: i32,
    target_id: i32,
) -> Result<(Participant, Vec<Participant>), PokerError> {
    write_transaction(conn, |conn| {
        let session = load_session(conn, session_id)?;
        if session.host_id == Some(target_id) {
            return Err(PokerError::Conflict(
                "Host cannot remove themselves; leave the session instead".to_string(),
            ));
        }

        let target: Participant = participants::table
            .filter(participants::id.eq(target_id))
            .filter(participants::session_id.eq(session.id))
            .select(Participant::as_select())
            .first(conn)
            .optional()?
            .ok_or(PokerError::NotFound("participant"))?;

        diesel::delete(&target).execute(conn)?;
        let remaining = list_participants(conn, session.id)?;
        tracing::info!(
            code = %session.code,
            participant_id = target.id,
            "participant removed by host"
        );
        Ok((target, remaining))
    })
}

/// Deletes every session, participant, and vote.
#[cfg(feature = "ssr")]
pub fn reset_database(conn: &mut SqliteConnection) -> Result<(), PokerError> {
    write_transaction(conn, |conn| {
        // Votes first; they only loosely reference sessions.
        diesel::delete(votes::table).execute(conn)?;
        diesel::delete(participants::table).execute(conn)?;
        diesel::delete(poker_sessions::table).execute(conn)?;
        Ok(())
    })
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::state::TransitionError;

    // Helper to run a test in a transaction against a fresh in-memory database. The transaction
    // is always rolled back at the end of the test.
    fn run_test_in_transaction<F>(test_fn: F)
    where
        F: FnOnce(&mut SqliteConnection) -> Result<(), PokerError>,
    {
        let mut conn = establish_connection(":memory:").expect("in-memory database opens");
        run_migrations(&mut conn).expect("migrations apply");
        let result: Result<(), PokerError> = conn.transaction(|conn| {
            // Run the test. Propagate real errors.
            test_fn(conn)?;
            // Force rollback on test success by returning an error.
            Err(diesel::result::Error::RollbackTransaction.into())
        });
        match result {
            Err(PokerError::Database(diesel::result::Error::RollbackTransaction)) => {}
            Err(e) => panic!("test failed: {e}"),
            Ok(()) => unreachable!("the transaction is always rolled back"),
        }
    }

    fn count_sessions(conn: &mut SqliteConnection) -> i64 {
        poker_sessions::table
            .count()
            .get_result(conn)
            .expect("count sessions")
    }

    #[test]
    fn test_create_session() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👩‍💻")?;

            assert_eq!(session.status, SessionStatus::Waiting);
            assert_eq!(session.current_round, 1);
            assert_eq!(session.host_id, Some(host.id));
            assert_eq!(session.code.len(), SESSION_CODE_LEN);
            assert!(session
                .code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

            assert_eq!(host.session_id, session.id);
            assert_eq!(host.name, "Alice");
            assert_eq!(host.emoji, "👩‍💻");
            assert!(Uuid::parse_str(&host.token).is_ok());

            let stored = find_session_by_code(conn, &session.code)?;
            assert_eq!(stored, session);
            Ok(())
        });
    }

    #[test]
    fn test_session_codes_are_unique() {
        run_test_in_transaction(|conn| {
            let mut codes = std::collections::HashSet::new();
            for i in 0..25 {
                let (session, _) = create_session(conn, &format!("Host {i}"), "👤")?;
                assert!(codes.insert(session.code));
            }
            assert_eq!(count_sessions(conn), 25);
            Ok(())
        });
    }

    #[test]
    fn test_code_collision_is_regenerated() {
        run_test_in_transaction(|conn| {
            create_session_with_codes(conn, "First", "👤", || "AAAAAA".to_string())?;

            let mut candidates = vec!["BBBBBB", "AAAAAA", "AAAAAA"];
            let (session, _) = create_session_with_codes(conn, "Second", "👤", || {
                candidates.pop().expect("enough candidates").to_string()
            })?;
            assert_eq!(session.code, "BBBBBB");
            assert_eq!(count_sessions(conn), 2);
            Ok(())
        });
    }

    #[test]
    fn test_code_generation_gives_up_eventually() {
        run_test_in_transaction(|conn| {
            create_session_with_codes(conn, "First", "👤", || "SAME01".to_string())?;
            let err = create_session_with_codes(conn, "Second", "👤", || "SAME01".to_string())
                .expect_err("every candidate collides");
            assert!(matches!(err, PokerError::Internal(_)));
            assert_eq!(count_sessions(conn), 1);
            Ok(())
        });
    }

    #[test]
    fn test_generated_codes_use_the_alphabet() {
        for _ in 0..100 {
            let code = generate_session_code();
            assert_eq!(code.len(), SESSION_CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_join_session() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;
            let (joined, bob, roster) = join_session(conn, &session.code, "Bob", "👨‍💼")?;

            assert_eq!(joined.id, session.id);
            assert_eq!(bob.session_id, session.id);
            assert_ne!(bob.token, host.token);
            let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
            assert_eq!(names, vec!["Alice", "Bob"]);

            let err = join_session(conn, "NOPE00", "Carol", "👤").expect_err("unknown code");
            assert!(matches!(err, PokerError::NotFound("session")));
            Ok(())
        });
    }

    #[test]
    fn test_get_participant_by_token() {
        run_test_in_transaction(|conn| {
            let (_, host) = create_session(conn, "Alice", "👤")?;

            let found = get_participant_by_token(conn, &host.token)?;
            assert_eq!(found.id, host.id);

            assert!(matches!(
                get_participant_by_token(conn, "not-a-uuid"),
                Err(PokerError::Unauthorized(_))
            ));
            assert!(matches!(
                get_participant_by_token(conn, &Uuid::new_v4().to_string()),
                Err(PokerError::Unauthorized(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_full_round_scenario() {
        run_test_in_transaction(|conn| {
            let (session, alice) = create_session(conn, "Alice", "👤")?;
            assert_eq!(session.status, SessionStatus::Waiting);
            assert_eq!(session.current_round, 1);

            let session = start_voting(conn, session.id)?;
            assert_eq!(session.status, SessionStatus::Voting);

            let outcome = submit_vote(
                conn,
                session.id,
                alice.id,
                CardValue::Five,
                AutoRevealPolicy::Off,
            )?;
            assert!(outcome.tally.all_voted());
            assert!(!outcome.auto_revealed());
            assert_eq!(outcome.session.status, SessionStatus::Voting);

            let (session, votes) = reveal_cards(conn, session.id)?;
            assert_eq!(session.status, SessionStatus::Revealed);
            assert_eq!(votes.len(), 1);
            assert_eq!(votes[0].card_value, CardValue::Five);
            assert_eq!(votes[0].participant_name.as_deref(), Some("Alice"));

            let session = next_round(conn, session.id)?;
            assert_eq!(session.status, SessionStatus::Voting);
            assert_eq!(session.current_round, 2);
            assert!(current_round_votes(conn, &session)?.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_rejected_transitions_do_not_mutate() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;

            let err = reveal_cards(conn, session.id).expect_err("nothing to reveal");
            assert_eq!(err.to_string(), TransitionError::NothingToReveal.to_string());
            let err = next_round(conn, session.id).expect_err("not revealed");
            assert!(matches!(err, PokerError::Conflict(_)));
            let err = submit_vote(conn, session.id, host.id, CardValue::One, AutoRevealPolicy::Off)
                .expect_err("voting not active");
            assert_eq!(err.to_string(), "Voting is not currently active");

            start_voting(conn, session.id)?;
            let err = start_voting(conn, session.id).expect_err("already started");
            assert_eq!(err.to_string(), "Voting has already started");

            let stored = find_session_by_code(conn, &session.code)?;
            assert_eq!(stored.status, SessionStatus::Voting);
            assert_eq!(stored.current_round, 1);
            assert!(get_session_votes(conn, session.id)?.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_revote_updates_in_place() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;
            start_voting(conn, session.id)?;

            let first = submit_vote(conn, session.id, host.id, CardValue::Three, AutoRevealPolicy::Off)?;
            let second = submit_vote(conn, session.id, host.id, CardValue::Eight, AutoRevealPolicy::Off)?;

            assert_eq!(first.vote.id, second.vote.id);
            assert_eq!(second.vote.card_value, CardValue::Eight);
            assert_eq!(second.vote.round, 1);
            assert_eq!(second.vote.session_id, session.id);
            assert_eq!(second.vote.participant_id, Some(host.id));
            assert!(second.vote.voted_at >= first.vote.voted_at);

            let all = get_session_votes(conn, session.id)?;
            assert_eq!(all.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn test_votes_are_scoped_to_rounds() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👤")?;
            start_voting(conn, session.id)?;

            let outcome = submit_vote(conn, session.id, host.id, CardValue::Two, AutoRevealPolicy::Off)?;
            assert!(!outcome.tally.all_voted());
            assert_eq!(outcome.tally.votes_cast, 1);
            assert_eq!(outcome.tally.total_participants, 2);

            let outcome = submit_vote(conn, session.id, bob.id, CardValue::Thirteen, AutoRevealPolicy::Off)?;
            assert!(outcome.tally.all_voted());

            reveal_cards(conn, session.id)?;
            let session = next_round(conn, session.id)?;
            let outcome = submit_vote(conn, session.id, bob.id, CardValue::Coffee, AutoRevealPolicy::Off)?;
            assert_eq!(outcome.vote.round, 2);
            assert_eq!(outcome.tally.votes_cast, 1);

            let all = get_session_votes(conn, session.id)?;
            assert_eq!(all.len(), 3);
            assert_eq!(all.iter().filter(|v| v.round == 1).count(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_auto_reveal_when_everyone_voted() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👤")?;
            start_voting(conn, session.id)?;

            let outcome = submit_vote(conn, session.id, bob.id, CardValue::Five, AutoRevealPolicy::All)?;
            assert!(!outcome.auto_revealed());
            assert_eq!(outcome.session.status, SessionStatus::Voting);

            let outcome = submit_vote(conn, session.id, host.id, CardValue::Eight, AutoRevealPolicy::All)?;
            assert!(outcome.auto_revealed());
            assert_eq!(outcome.session.status, SessionStatus::Revealed);
            assert_eq!(outcome.revealed_votes.as_ref().map(Vec::len), Some(2));

            let stored = find_session_by_code(conn, &session.code)?;
            assert_eq!(stored.status, SessionStatus::Revealed);
            Ok(())
        });
    }

    #[test]
    fn test_snapshot_hides_votes_until_revealed() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Alice", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👤")?;
            let session = start_voting(conn, session.id)?;
            submit_vote(conn, session.id, bob.id, CardValue::Half, AutoRevealPolicy::Off)?;

            let snapshot = get_session_snapshot(conn, &session)?;
            assert_eq!(snapshot.status, SessionStatus::Voting);
            assert_eq!(snapshot.host_id, Some(host.id));
            assert_eq!(snapshot.participants.len(), 2);
            assert_eq!(snapshot.voted_participant_ids, vec![bob.id]);
            assert!(snapshot.votes.is_empty());

            let (session, _) = reveal_cards(conn, session.id)?;
            let snapshot = get_session_snapshot(conn, &session)?;
            assert_eq!(snapshot.votes.len(), 1);
            assert_eq!(snapshot.votes[0].card_value, CardValue::Half);
            Ok(())
        });
    }

    #[test]
    fn test_non_host_leaving_keeps_session_and_votes() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Host", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👨‍💼")?;
            let (_, carol, _) = join_session(conn, &session.code, "Carol", "👤")?;
            start_voting(conn, session.id)?;
            let vote = submit_vote(conn, session.id, bob.id, CardValue::Five, AutoRevealPolicy::Off)?.vote;

            let departure = leave_session(conn, session.id, bob.id)?;
            match departure {
                Departure::ParticipantLeft {
                    participant,
                    remaining,
                } => {
                    assert_eq!(participant.id, bob.id);
                    let ids: Vec<i32> = remaining.iter().map(|p| p.id).collect();
                    assert_eq!(ids, vec![host.id, carol.id]);
                }
                other => panic!("unexpected departure: {other:?}"),
            }

            assert!(find_session_by_code(conn, &session.code).is_ok());
            let votes = get_session_votes(conn, session.id)?;
            assert_eq!(votes.len(), 1);
            assert_eq!(votes[0].id, vote.id);
            assert_eq!(votes[0].participant_id, None);
            assert_eq!(votes[0].card_value, CardValue::Five);

            // Bob's vote still counts for the round he cast it in.
            let session = find_session_by_code(conn, &session.code)?;
            let tally = voting_stats(conn, &session)?;
            assert_eq!(tally.votes_cast, 1);
            assert_eq!(tally.total_participants, 2);

            let outcome = submit_vote(conn, session.id, carol.id, CardValue::Eight, AutoRevealPolicy::Off)?;
            assert_eq!(outcome.tally.votes_cast, 2);
            assert!(outcome.tally.all_voted());
            Ok(())
        });
    }

    #[test]
    fn test_host_leaving_ends_session() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Host", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👤")?;
            start_voting(conn, session.id)?;
            submit_vote(conn, session.id, host.id, CardValue::Three, AutoRevealPolicy::Off)?;
            submit_vote(conn, session.id, bob.id, CardValue::Five, AutoRevealPolicy::Off)?;

            let departure = leave_session(conn, session.id, host.id)?;
            assert_eq!(
                departure,
                Departure::SessionEnded {
                    code: session.code.clone(),
                    reason: HOST_LEFT_REASON,
                }
            );

            assert!(matches!(
                find_session_by_code(conn, &session.code),
                Err(PokerError::NotFound(_))
            ));
            let remaining: i64 = participants::table
                .filter(participants::session_id.eq(session.id))
                .count()
                .get_result(conn)?;
            assert_eq!(remaining, 0);

            let votes = get_session_votes(conn, session.id)?;
            assert_eq!(votes.len(), 2);
            assert!(votes.iter().all(|v| v.participant_id.is_none()));
            Ok(())
        });
    }

    #[test]
    fn test_cannot_leave_other_session() {
        run_test_in_transaction(|conn| {
            let (first, _) = create_session(conn, "Host One", "👤")?;
            let (second, _) = create_session(conn, "Host Two", "👤")?;
            let (_, bob, _) = join_session(conn, &second.code, "Bob", "👤")?;

            let err = leave_session(conn, first.id, bob.id).expect_err("not a member");
            assert!(matches!(err, PokerError::Forbidden(_)));
            assert_eq!(list_participants(conn, second.id)?.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_remove_participant() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Host", "👤")?;
            let (_, bob, _) = join_session(conn, &session.code, "Bob", "👤")?;
            let (other, _) = create_session(conn, "Elsewhere", "👤")?;
            let (_, stranger, _) = join_session(conn, &other.code, "Stranger", "👤")?;

            let err = remove_participant(conn, session.id, host.id).expect_err("host can't remove self");
            assert!(matches!(err, PokerError::Conflict(_)));
            let err = remove_participant(conn, session.id, stranger.id).expect_err("not in session");
            assert!(matches!(err, PokerError::NotFound("participant")));

            let (removed, remaining) = remove_participant(conn, session.id, bob.id)?;
            assert_eq!(removed.id, bob.id);
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].id, host.id);
            Ok(())
        });
    }

    #[test]
    fn test_reset_database() {
        run_test_in_transaction(|conn| {
            let (session, host) = create_session(conn, "Host", "👤")?;
            start_voting(conn, session.id)?;
            submit_vote(conn, session.id, host.id, CardValue::One, AutoRevealPolicy::Off)?;

            reset_database(conn)?;

            assert_eq!(count_sessions(conn), 0);
            let participant_count: i64 = participants::table.count().get_result(conn)?;
            let vote_count: i64 = votes::table.count().get_result(conn)?;
            assert_eq!(participant_count, 0);
            assert_eq!(vote_count, 0);
            Ok(())
        });
    }

    #[test]
    fn test_concurrent_votes_on_shared_pool() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::TempDir::new().expect("temp dir");
        let url = dir.path().join("poker.db").to_string_lossy().into_owned();
        let pool = build_pool(&url, 8).expect("pool builds");

        let (session, voters) = {
            let mut conn = pool.get().expect("connection available");
            run_migrations(&mut conn).expect("migrations apply");
            let (session, host) = create_session(&mut conn, "Host", "👤").expect("session created");
            let mut voters = vec![host.id];
            for i in 0..7 {
                let (_, p, _) = join_session(&mut conn, &session.code, &format!("Voter {i}"), "👤")
                    .expect("participant joins");
                voters.push(p.id);
            }
            start_voting(&mut conn, session.id).expect("voting starts");
            (session, voters)
        };

        const ATTEMPTS: usize = 10;
        let barrier = Arc::new(Barrier::new(voters.len()));
        let handles: Vec<_> = voters
            .iter()
            .map(|&participant_id| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                let session_id = session.id;
                std::thread::spawn(move || {
                    let mut errors = Vec::new();
                    for attempt in 0..ATTEMPTS {
                        barrier.wait();
                        let mut conn = pool.get().expect("connection available");
                        let card = CardValue::ALL[attempt % CardValue::ALL.len()];
                        if let Err(e) =
                            submit_vote(&mut conn, session_id, participant_id, card, AutoRevealPolicy::Off)
                        {
                            errors.push(e.to_string());
                        }
                    }
                    errors
                })
            })
            .collect();

        let errors: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("voter thread finishes"))
            .collect();
        assert!(errors.is_empty(), "{} votes failed, first: {:?}", errors.len(), errors.first());

        let mut conn = pool.get().expect("connection available");
        let votes = get_session_votes(&mut conn, session.id).expect("votes load");
        assert_eq!(votes.len(), voters.len());
        for participant_id in &voters {
            let theirs: Vec<&Vote> = votes
                .iter()
                .filter(|v| v.participant_id == Some(*participant_id))
                .collect();
            assert_eq!(theirs.len(), 1);
            assert_eq!(theirs[0].card_value, CardValue::ALL[(ATTEMPTS - 1) % CardValue::ALL.len()]);
        }
    }
}
