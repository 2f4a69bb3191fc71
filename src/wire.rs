//! Newline-delimited JSON protocol.
//!
//! Each request is one line:
//! `{"id": <any>, "actor": {"id": "<ulid>", "role": "customer"|"admin"}, "command": {"<name>": {...}}}`.
//! Each reply is one line, `{"id", "ok": true, "data"}` or `{"id", "ok": false, "error": {"code", "message"}}`.
//! After `listen`, notification lines `{"notification": {"channel", "event", "payload"}}`
//! are interleaved with replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_LINE_BYTES, MAX_LISTENS_PER_CONNECTION};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{command_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

const NOTIFY_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub actor: Actor,
    pub command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    CreateReservation(ReservationDraft),
    GetReservation(ById),
    ListReservations(ReservationFilter),
    UpdateReservation(UpdateReservationArgs),
    Transition(TransitionArgs),
    DeleteReservation(ById),
    CheckInterval(CheckIntervalArgs),
    CanReview(ByReservation),
    CreateReview(ReviewDraft),
    GetReview(ById),
    ListReviews(ReviewFilter),
    UpdateReview(UpdateReviewArgs),
    DeleteReview(ById),
    EquipmentRating(ByEquipment),
    Listen(ByEquipment),
    Unlisten(ByEquipment),
    UnlistenAll,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ById {
    pub id: Ulid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ByReservation {
    pub reservation_id: Ulid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ByEquipment {
    pub equipment_id: Ulid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateReservationArgs {
    pub id: Ulid,
    pub patch: ReservationPatch,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionArgs {
    pub id: Ulid,
    /// Parsed server-side so an unknown name yields `invalid_status`.
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckIntervalArgs {
    pub equipment_id: Ulid,
    pub span: Span,
    #[serde(default)]
    pub exclude: Option<Ulid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateReviewArgs {
    pub id: Ulid,
    pub patch: ReviewPatch,
}

// ── Replies ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn ok(id: Option<Value>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(id: Option<Value>, code: &'static str, message: String) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody { code, message }),
        }
    }
}

#[derive(Serialize)]
struct NotificationLine<'a> {
    notification: &'a Notification,
}

fn to_data<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        serde_json::json!({
            "ok": false,
            "error": { "code": "internal", "message": e.to_string() },
        })
        .to_string()
    })
}

// ── Connection ───────────────────────────────────────────────────

/// Per-connection LISTEN state: one forwarding task per equipment channel.
struct Session {
    listens: HashMap<Ulid, JoinHandle<()>>,
    note_tx: mpsc::Sender<Event>,
}

impl Session {
    fn listen(&mut self, engine: &Engine, equipment_id: Ulid) -> Result<(), EngineError> {
        if self.listens.contains_key(&equipment_id) {
            return Ok(());
        }
        if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many listens on connection"));
        }
        let mut rx = engine.notify.subscribe(equipment_id);
        let tx = self.note_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener on {equipment_id} lagged, skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listens.insert(equipment_id, handle);
        Ok(())
    }

    fn unlisten(&mut self, equipment_id: &Ulid) {
        if let Some(handle) = self.listens.remove(equipment_id) {
            handle.abort();
        }
    }

    fn unlisten_all(&mut self) {
        for (_, handle) in self.listens.drain() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (note_tx, mut note_rx) = mpsc::channel(NOTIFY_BUFFER);
    let mut session = Session {
        listens: HashMap::new(),
        note_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::err(None, "bad_request", "line too long".into());
                        framed.send(encode(&reply)).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&engine, &mut session, &line).await;
                framed.send(encode(&reply)).await?;
            }
            Some(event) = note_rx.recv() => {
                let notification = Notification::from_event(&event);
                framed.send(encode(&NotificationLine { notification: &notification })).await?;
            }
        }
    }
    Ok(())
}

async fn handle_line(engine: &Engine, session: &mut Session, line: &str) -> Reply {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Reply::err(None, "bad_request", e.to_string()),
    };
    let label = command_label(&request.command);
    let started = Instant::now();
    let result = execute(engine, session, &request.actor, request.command).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "command" => label, "status" => "ok").increment(1);
            Reply::ok(request.id, data)
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "command" => label, "status" => e.code())
                .increment(1);
            if e.is_unavailable() {
                tracing::error!("{label} failed: {e}");
            } else {
                debug!("{label} rejected: {e}");
            }
            Reply::err(request.id, e.code(), e.to_string())
        }
    }
}

async fn execute(
    engine: &Engine,
    session: &mut Session,
    actor: &Actor,
    command: Command,
) -> Result<Value, EngineError> {
    Ok(match command {
        Command::CreateReservation(draft) => to_data(engine.create_reservation(actor, draft).await?),
        Command::GetReservation(ById { id }) => to_data(engine.get_reservation(actor, id).await?),
        Command::ListReservations(filter) => to_data(engine.list_reservations(actor, filter).await?),
        Command::UpdateReservation(UpdateReservationArgs { id, patch }) => {
            to_data(engine.update_reservation(actor, id, patch).await?)
        }
        Command::Transition(TransitionArgs { id, status, reason }) => {
            to_data(engine.transition_named(id, actor, &status, reason).await?)
        }
        Command::DeleteReservation(ById { id }) => {
            engine.delete_reservation(actor, id).await?;
            serde_json::json!({ "deleted": id })
        }
        Command::CheckInterval(CheckIntervalArgs {
            equipment_id,
            span,
            exclude,
        }) => to_data(engine.check_interval(actor, equipment_id, span, exclude).await?),
        Command::CanReview(ByReservation { reservation_id }) => {
            to_data(engine.check_review_eligibility(actor, reservation_id).await?)
        }
        Command::CreateReview(draft) => to_data(engine.create_review(actor, draft).await?),
        Command::GetReview(ById { id }) => to_data(engine.get_review(id)?),
        Command::ListReviews(filter) => to_data(engine.list_reviews(filter)?),
        Command::UpdateReview(UpdateReviewArgs { id, patch }) => {
            to_data(engine.update_review(actor, id, patch).await?)
        }
        Command::DeleteReview(ById { id }) => {
            engine.delete_review(actor, id).await?;
            serde_json::json!({ "deleted": id })
        }
        Command::EquipmentRating(ByEquipment { equipment_id }) => {
            to_data(engine.equipment_rating(equipment_id))
        }
        Command::Listen(ByEquipment { equipment_id }) => {
            if !actor.is_admin() {
                return Err(EngineError::Forbidden);
            }
            session.listen(engine, equipment_id)?;
            serde_json::json!({ "listening": crate::notify::channel_name(equipment_id) })
        }
        Command::Unlisten(ByEquipment { equipment_id }) => {
            session.unlisten(&equipment_id);
            serde_json::json!({ "unlistened": crate::notify::channel_name(equipment_id) })
        }
        Command::UnlistenAll => {
            session.unlisten_all();
            serde_json::json!({ "unlistened": "*" })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_struct_and_unit_commands() {
        let actor = Ulid::new();
        let eid = Ulid::new();
        let line = format!(
            r#"{{"id":1,"actor":{{"id":"{actor}","role":"admin"}},"command":{{"listen":{{"equipment_id":"{eid}"}}}}}}"#
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        assert!(req.actor.is_admin());
        assert!(matches!(req.command, Command::Listen(ByEquipment { equipment_id }) if equipment_id == eid));

        let line = format!(
            r#"{{"actor":{{"id":"{actor}","role":"user"}},"command":"unlisten_all"}}"#
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        assert!(!req.actor.is_admin());
        assert!(req.id.is_none());
        assert!(matches!(req.command, Command::UnlistenAll));
    }

    #[test]
    fn unknown_command_fields_are_rejected() {
        let line = format!(
            r#"{{"actor":{{"id":"{}","role":"admin"}},"command":{{"get_reservation":{{"id":"{}","extra":1}}}}}}"#,
            Ulid::new(),
            Ulid::new()
        );
        assert!(serde_json::from_str::<Request>(&line).is_err());
    }

    #[test]
    fn transition_reason_is_optional() {
        let id = Ulid::new();
        let line = format!(
            r#"{{"actor":{{"id":"{}","role":"admin"}},"command":{{"transition":{{"id":"{id}","status":"confirmed"}}}}}}"#,
            Ulid::new()
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        let Command::Transition(args) = req.command else {
            panic!("wrong command");
        };
        assert_eq!(args.status, "confirmed");
        assert!(args.reason.is_none());
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom(r#"bad "quoted" value"#))
        }
    }

    #[test]
    fn encode_failure_still_yields_valid_json() {
        let line = encode(&Unencodable);
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "internal");
        assert!(reply["error"]["message"].as_str().unwrap().contains(r#""quoted""#));
    }

    #[test]
    fn reply_shapes() {
        let ok = serde_json::to_value(Reply::ok(Some(Value::from(3)), Value::from("x"))).unwrap();
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["id"], 3);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(Reply::err(None, "conflict", "nope".into())).unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "conflict");
        assert!(err.get("id").is_none());
    }
}
