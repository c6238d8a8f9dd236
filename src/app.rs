//! HTTP surface: routes, credential checks, and request validation.
//!
//! Handlers resolve credentials and run store operations on the blocking pool, then publish
//! events once the store has committed.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::NaiveDateTime;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::error::PokerError;
use crate::events::{EventPublisher, SessionEvent};
use crate::state::SessionAction;
use crate::model::{
    CardValue, Participant, PokerSession, RevealedVote, SessionSnapshot, SessionStatus,
    DEFAULT_EMOJI,
};
use crate::{
    find_session_by_code, get_participant_by_token, get_session_snapshot, DbPool, Departure,
};

const API_KEY_HEADER: &str = "x-api-key";
const MAX_NAME_CHARS: usize = 50;
const MAX_EMOJI_CHARS: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: DbPool, events: Arc<dyn EventPublisher>, config: Config) -> Self {
        Self {
            pool,
            events,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/sessions", post(handle_create_session))
        .route("/api/sessions/{code}", get(handle_show_session))
        .route("/api/sessions/{code}/join", post(handle_join_session))
        .route("/api/sessions/{code}/vote", post(handle_vote))
        .route("/api/sessions/{code}/start", post(handle_start))
        .route("/api/sessions/{code}/reveal", post(handle_reveal))
        .route("/api/sessions/{code}/next-round", post(handle_next_round))
        .route("/api/sessions/{code}/leave", delete(handle_leave))
        .route(
            "/api/sessions/{code}/participants/{participant_id}",
            delete(handle_remove_participant),
        )
        .route("/api/sessions/{code}/events", get(handle_session_events))
        .with_state(state)
}

/// Runs `f` with a pooled connection on the blocking thread pool.
async fn with_conn<F, T>(pool: &DbPool, f: F) -> Result<T, PokerError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, PokerError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut *conn)
    })
    .await
    .map_err(|e| PokerError::Internal(format!("blocking task failed: {e}")))?
}

// Credentials

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), PokerError> {
    let supplied = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if supplied == Some(state.config.api_key.as_str()) {
        return Ok(());
    }
    tracing::warn!(present = supplied.is_some(), "rejected request with bad API key");
    Err(PokerError::Unauthorized("Invalid or missing API key"))
}

fn bearer_token(headers: &HeaderMap) -> Result<String, PokerError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            tracing::warn!("rejected request without bearer token");
            PokerError::Unauthorized("Invalid or missing token")
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Member,
    Host,
}

impl From<SessionAction> for Access {
    fn from(action: SessionAction) -> Self {
        if action.requires_host() {
            Self::Host
        } else {
            Self::Member
        }
    }
}

/// Resolves the caller and the addressed session, in that order, and checks the caller may act
/// on it.
fn authorize(
    conn: &mut SqliteConnection,
    token: &str,
    code: &str,
    access: Access,
) -> Result<(PokerSession, Participant), PokerError> {
    let participant = get_participant_by_token(conn, token)?;
    let session = find_session_by_code(conn, code)?;

    if participant.session_id != session.id {
        tracing::warn!(code, participant_id = participant.id, "participant is not a member");
        return Err(PokerError::Forbidden("You are not a member of this session"));
    }
    if access == Access::Host && session.host_id != Some(participant.id) {
        tracing::warn!(code, participant_id = participant.id, "host action by non-host");
        return Err(PokerError::Forbidden("This action requires host privileges"));
    }
    Ok((session, participant))
}

// Validation

fn body_or_validation<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, PokerError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| PokerError::validation("body", rejection.body_text()))
}

fn required_name(
    field: &'static str,
    label: &str,
    value: Option<String>,
) -> Result<String, PokerError> {
    let name = value.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(PokerError::validation(
            field,
            format!("The {label} field is required."),
        ));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(PokerError::validation(
            field,
            format!("The {label} field must not be greater than {MAX_NAME_CHARS} characters."),
        ));
    }
    Ok(name.to_string())
}

fn emoji_or_default(field: &'static str, value: Option<String>) -> Result<String, PokerError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(DEFAULT_EMOJI.to_string()),
        Some(emoji) if emoji.chars().count() > MAX_EMOJI_CHARS => Err(PokerError::validation(
            field,
            format!("The emoji field must not be greater than {MAX_EMOJI_CHARS} characters."),
        )),
        Some(emoji) => Ok(emoji.to_string()),
    }
}

fn parse_card(value: Option<String>) -> Result<CardValue, PokerError> {
    let Some(value) = value else {
        return Err(PokerError::validation(
            "card_value",
            "The card value field is required.",
        ));
    };
    value
        .parse()
        .map_err(|_| PokerError::validation("card_value", "The selected card value is invalid."))
}

// Requests and responses

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub host_name: Option<String>,
    pub host_emoji: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinSessionRequest {
    pub name: Option<String>,
    pub emoji: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VoteRequest {
    pub card_value: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatedSession {
    session: PokerSession,
    participant: Participant,
    token: String,
}

#[derive(Debug, Serialize)]
struct JoinedSession {
    session: PokerSession,
    participant: Participant,
    token: String,
    participants: Vec<Participant>,
}

#[derive(Debug, Serialize)]
struct VoteResponse {
    vote_id: i32,
    card_value: CardValue,
    voted_at: NaiveDateTime,
    round: i32,
    all_voted: bool,
    auto_revealed: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: SessionStatus,
    current_round: i32,
}

impl From<&PokerSession> for StatusResponse {
    fn from(session: &PokerSession) -> Self {
        Self {
            status: session.status,
            current_round: session.current_round,
        }
    }
}

#[derive(Debug, Serialize)]
struct RevealResponse {
    status: SessionStatus,
    current_round: i32,
    votes: Vec<RevealedVote>,
}

#[derive(Debug, Serialize)]
struct LeaveResponse {
    message: &'static str,
    session_ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_participants: Option<Vec<Participant>>,
}

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed_participant_id: i32,
    remaining_participants: Vec<Participant>,
}

// Handlers

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[tracing::instrument(skip_all)]
async fn handle_create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Response, PokerError> {
    check_api_key(&state, &headers)?;
    let body = body_or_validation(payload)?;
    let name = required_name("host_name", "host name", body.host_name)?;
    let emoji = emoji_or_default("host_emoji", body.host_emoji)?;

    let (session, participant) =
        with_conn(&state.pool, move |conn| crate::create_session(conn, &name, &emoji)).await?;

    let token = participant.token.clone();
    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            session,
            participant,
            token,
        }),
    )
        .into_response())
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_join_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<JoinSessionRequest>, JsonRejection>,
) -> Result<Json<JoinedSession>, PokerError> {
    check_api_key(&state, &headers)?;
    let body = body_or_validation(payload)?;
    let name = required_name("name", "name", body.name)?;
    let emoji = emoji_or_default("emoji", body.emoji)?;

    let lookup = code.clone();
    let (session, participant, participants) = with_conn(&state.pool, move |conn| {
        crate::join_session(conn, &lookup, &name, &emoji)
    })
    .await?;

    state.events.publish(
        &code,
        SessionEvent::ParticipantJoined {
            participant: participant.clone(),
        },
    );

    let token = participant.token.clone();
    Ok(Json(JoinedSession {
        session,
        participant,
        token,
        participants,
    }))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_show_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSnapshot>, PokerError> {
    let token = bearer_token(&headers)?;
    let snapshot = with_conn(&state.pool, move |conn| {
        let (session, _) = authorize(conn, &token, &code, Access::Member)?;
        get_session_snapshot(conn, &session)
    })
    .await?;
    Ok(Json(snapshot))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_vote(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    // Checked after the caller is authorized, so a stranger learns nothing from a bad body.
    let card = body_or_validation(payload).and_then(|body| parse_card(body.card_value));
    let policy = state.config.auto_reveal;

    let lookup = code.clone();
    let outcome = with_conn(&state.pool, move |conn| {
        let (session, participant) = authorize(conn, &token, &lookup, SessionAction::Vote.into())?;
        crate::submit_vote(conn, session.id, participant.id, card?, policy)
    })
    .await?;

    if let Some(participant_id) = outcome.vote.participant_id {
        state.events.publish(
            &code,
            SessionEvent::VoteSubmitted {
                participant_id,
                round: outcome.vote.round,
            },
        );
    }
    if let Some(votes) = &outcome.revealed_votes {
        state.events.publish(
            &code,
            SessionEvent::CardsRevealed {
                round: outcome.session.current_round,
                votes: votes.clone(),
            },
        );
    }

    Ok(Json(VoteResponse {
        vote_id: outcome.vote.id,
        card_value: outcome.vote.card_value,
        voted_at: outcome.vote.voted_at,
        round: outcome.vote.round,
        all_voted: outcome.tally.all_voted(),
        auto_revealed: outcome.auto_revealed(),
    }))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_start(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    let session = with_conn(&state.pool, move |conn| {
        let (session, _) = authorize(conn, &token, &lookup, SessionAction::Start.into())?;
        crate::start_voting(conn, session.id)
    })
    .await?;

    state.events.publish(
        &code,
        SessionEvent::VotingStarted {
            round: session.current_round,
        },
    );
    Ok(Json(StatusResponse::from(&session)))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_reveal(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RevealResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    let (session, votes) = with_conn(&state.pool, move |conn| {
        let (session, _) = authorize(conn, &token, &lookup, SessionAction::Reveal.into())?;
        crate::reveal_cards(conn, session.id)
    })
    .await?;

    state.events.publish(
        &code,
        SessionEvent::CardsRevealed {
            round: session.current_round,
            votes: votes.clone(),
        },
    );
    Ok(Json(RevealResponse {
        status: session.status,
        current_round: session.current_round,
        votes,
    }))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_next_round(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    let session = with_conn(&state.pool, move |conn| {
        let (session, _) = authorize(conn, &token, &lookup, SessionAction::NextRound.into())?;
        crate::next_round(conn, session.id)
    })
    .await?;

    state.events.publish(
        &code,
        SessionEvent::NextRoundStarted {
            round: session.current_round,
        },
    );
    Ok(Json(StatusResponse::from(&session)))
}

#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_leave(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LeaveResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    let departure = with_conn(&state.pool, move |conn| {
        let (session, participant) = authorize(conn, &token, &lookup, Access::Member)?;
        crate::leave_session(conn, session.id, participant.id)
    })
    .await?;

    match departure {
        Departure::SessionEnded { reason, .. } => {
            state.events.publish(
                &code,
                SessionEvent::SessionEnded {
                    reason: reason.to_string(),
                },
            );
            state.events.close(&code);
            Ok(Json(LeaveResponse {
                message: "Session ended - host left",
                session_ended: true,
                remaining_participants: None,
            }))
        }
        Departure::ParticipantLeft {
            participant,
            remaining,
        } => {
            state.events.publish(
                &code,
                SessionEvent::ParticipantLeft {
                    participant_id: participant.id,
                    participant_name: participant.name,
                    remaining_participants: remaining.clone(),
                },
            );
            Ok(Json(LeaveResponse {
                message: "Participant left session",
                session_ended: false,
                remaining_participants: Some(remaining),
            }))
        }
    }
}

#[tracing::instrument(skip_all, fields(code = %code, participant_id = participant_id))]
async fn handle_remove_participant(
    State(state): State<AppState>,
    Path((code, participant_id)): Path<(String, i32)>,
    headers: HeaderMap,
) -> Result<Json<RemovedResponse>, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    let (removed, remaining) = with_conn(&state.pool, move |conn| {
        let (session, _) = authorize(conn, &token, &lookup, Access::Host)?;
        crate::remove_participant(conn, session.id, participant_id)
    })
    .await?;

    state.events.publish(
        &code,
        SessionEvent::ParticipantRemoved {
            participant_id: removed.id,
            participant_name: removed.name,
            remaining_participants: remaining.clone(),
            removed_by_host: true,
        },
    );
    Ok(Json(RemovedResponse {
        removed_participant_id: removed.id,
        remaining_participants: remaining,
    }))
}

/// GET /api/sessions/{code}/events: SSE stream of the session's events.
#[tracing::instrument(skip_all, fields(code = %code))]
async fn handle_session_events(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Response, PokerError> {
    let token = bearer_token(&headers)?;
    let lookup = code.clone();
    with_conn(&state.pool, move |conn| {
        authorize(conn, &token, &lookup, Access::Member).map(|_| ())
    })
    .await?;

    let rx = state
        .events
        .subscribe(&code)
        .ok_or(PokerError::NotFound("event stream"))?;
    tracing::debug!("event stream opened");

    let stream = BroadcastStream::new(rx).filter_map(
        |result: Result<SessionEvent, BroadcastStreamRecvError>| match result {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(&event)
                .ok()
                .map(Ok::<_, Infallible>),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
                None
            }
        },
    );

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}
