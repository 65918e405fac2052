//! Request handling for the mock instance.
//!
//! One function per request type, each returning the body to send or a
//! `(code, message)` error, the way a real instance would answer.

use std::sync::atomic::Ordering;

use iproto_common::*;
use rmpv::Value;
use tracing::{debug, trace};

use crate::instance::{InstanceState, Reply, Session};

/// Error code returned for an unknown `CALL` target.
pub const ER_NO_SUCH_PROC: u32 = 33;

type Answer = Result<Body, (u32, String)>;

pub(crate) fn handle(state: &InstanceState, session: &mut Session, packet: Packet) {
    let header = packet.header;
    let body = packet.body;
    state.count(header.code);
    if let Some(stream) = header.stream_id {
        state.streams.lock().insert(stream);
    }
    if state.muted.load(Ordering::Acquire) {
        trace!(sync = header.sync, "muted, dropping request");
        return;
    }

    let Some(kind) = RequestType::from_code(header.code) else {
        send(state, session, header.sync, Err((ER_UNKNOWN_REQUEST_TYPE, format!("Unknown request type {}", header.code))));
        return;
    };

    if let Some(expected) = header.schema_version {
        let current = state.schema_version();
        if is_schema_checked(kind) && expected != current {
            debug!(expected, current, "stale schema version in request");
            send(
                state,
                session,
                header.sync,
                Err((ER_WRONG_SCHEMA_VERSION, format!("Wrong schema version, current: {}, in request: {}", current, expected))),
            );
            return;
        }
    }

    let answer = match kind {
        RequestType::Id => id(state),
        RequestType::Auth => auth(state, session, &body),
        RequestType::Ping => Ok(Body::new()),
        RequestType::Call => {
            let name = body.get_str(KEY_FUNCTION_NAME).unwrap_or_default().to_string();
            let handler = state.calls.lock().get(&name).cloned();
            match handler {
                Some(handler) => return reply(state, session, header.sync, handler(&args(&body))),
                None => Err((ER_NO_SUCH_PROC, format!("Procedure '{}' is not defined", name))),
            }
        }
        RequestType::Eval => {
            let expr = body.get_str(KEY_EXPR).unwrap_or_default().to_string();
            let handler = state.evals.lock().get(&expr).cloned();
            match handler {
                Some(handler) => return reply(state, session, header.sync, handler(&args(&body))),
                // Unscripted expressions echo their arguments.
                None => Ok(data(args(&body))),
            }
        }
        RequestType::Select => select(state, &body),
        RequestType::Insert => with_space(state, &body, |space| space.insert(tuple(&body)).map(|t| data(vec![t]))),
        RequestType::Replace => with_space(state, &body, |space| Ok(data(vec![space.replace(tuple(&body))]))),
        RequestType::Delete => with_space(state, &body, |space| {
            let index = index_id(&body, space)?;
            Ok(data(space.delete(index, &key(&body)).into_iter().collect()))
        }),
        RequestType::Update => with_space(state, &body, |space| {
            let index = index_id(&body, space)?;
            let ops = tuple(&body);
            Ok(data(space.update(index, &key(&body), &ops)?.into_iter().collect()))
        }),
        RequestType::Upsert => with_space(state, &body, |space| {
            let ops = array(&body, KEY_OPS);
            space.upsert(tuple(&body), &ops)?;
            Ok(data(Vec::new()))
        }),
        RequestType::Watch => {
            watch(state, session, &body);
            return;
        }
        RequestType::Unwatch => {
            if let Some(key) = body.get_str(KEY_EVENT_KEY) {
                session.watched.remove(key);
            }
            return;
        }
        RequestType::WatchOnce => {
            let key = body.get_str(KEY_EVENT_KEY).unwrap_or_default();
            let value = state.values.lock().get(key).map(|(value, _)| value.clone());
            Ok(data(value.into_iter().collect()))
        }
        RequestType::Begin | RequestType::Commit | RequestType::Rollback => Ok(Body::new()),
        RequestType::Event => return,
    };
    send(state, session, header.sync, answer);
}

fn is_schema_checked(kind: RequestType) -> bool {
    matches!(
        kind,
        RequestType::Select
            | RequestType::Insert
            | RequestType::Replace
            | RequestType::Update
            | RequestType::Delete
            | RequestType::Upsert
    )
}

fn data(rows: Vec<Value>) -> Body {
    Body::new().with(KEY_DATA, Value::Array(rows))
}

fn array(body: &Body, key: u8) -> Vec<Value> {
    body.get(key).and_then(Value::as_array).cloned().unwrap_or_default()
}

fn args(body: &Body) -> Vec<Value> {
    array(body, KEY_TUPLE)
}

fn tuple(body: &Body) -> Vec<Value> {
    array(body, KEY_TUPLE)
}

fn key(body: &Body) -> Vec<Value> {
    array(body, KEY_KEY)
}

fn id(state: &InstanceState) -> Answer {
    let settings = &state.settings;
    if !settings.id_supported {
        return Err((ER_UNKNOWN_REQUEST_TYPE, "Unknown request type 73".to_string()));
    }
    Ok(id_body(settings.version, settings.features))
}

fn auth(state: &InstanceState, session: &mut Session, body: &Body) -> Answer {
    let user = body.get_str(KEY_USER_NAME).unwrap_or_default().to_string();
    let denied = || (ER_CREDENTIALS, format!("User not found or supplied credentials are invalid: {}", user));
    let Some(password) = state.settings.users.get(&user) else {
        return Err(denied());
    };
    let scramble = body
        .get(KEY_TUPLE)
        .and_then(Value::as_array)
        .and_then(|parts| parts.get(1))
        .and_then(|part| match part {
            Value::Binary(bytes) => Some(bytes.clone()),
            Value::String(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        });
    if scramble.as_deref() != Some(&chap_sha1_scramble(&session.salt, password)[..]) {
        return Err(denied());
    }
    session.user = user;
    Ok(Body::new())
}

fn space_id(state: &InstanceState, body: &Body) -> Result<u32, (u32, String)> {
    if let Some(id) = body.get_u64(KEY_SPACE_ID) {
        return Ok(id as u32);
    }
    let name = body.get_str(KEY_SPACE_NAME).unwrap_or_default();
    state
        .spaces
        .lock()
        .values()
        .find(|space| space.name == name)
        .map(|space| space.id)
        .ok_or_else(|| (ER_NO_SUCH_SPACE, format!("Space '{}' does not exist", name)))
}

fn index_id(body: &Body, space: &crate::space::MockSpace) -> Result<u32, (u32, String)> {
    let id = match body.get_u64(KEY_INDEX_ID) {
        Some(id) => Some(id as u32),
        None => match body.get_str(KEY_INDEX_NAME) {
            Some(name) => space.index_id(name),
            None => Some(0),
        },
    };
    match id {
        Some(id) if space.has_index(id) => Ok(id),
        _ => Err((
            ER_NO_SUCH_INDEX,
            format!("No index #{} is defined in space '{}'", id.unwrap_or(u32::MAX), space.name),
        )),
    }
}

fn with_space<F>(state: &InstanceState, body: &Body, apply: F) -> Answer
where
    F: FnOnce(&mut crate::space::MockSpace) -> Answer,
{
    let id = space_id(state, body)?;
    let mut spaces = state.spaces.lock();
    let space = spaces
        .get_mut(&id)
        .ok_or_else(|| (ER_NO_SUCH_SPACE, format!("Space '#{}' does not exist", id)))?;
    apply(space)
}

fn select(state: &InstanceState, body: &Body) -> Answer {
    let id = space_id(state, body)?;
    let spaces = state.spaces.lock();
    match id {
        VSPACE_ID => return Ok(data(spaces.values().map(|space| space.vspace_row()).collect())),
        VINDEX_ID => return Ok(data(spaces.values().flat_map(|space| space.vindex_rows()).collect())),
        _ => {}
    }
    let space = spaces
        .get(&id)
        .ok_or_else(|| (ER_NO_SUCH_SPACE, format!("Space '#{}' does not exist", id)))?;
    let index = index_id(body, space)?;
    let offset = body.get_u64(KEY_OFFSET).unwrap_or(0) as usize;
    let limit = body.get_u64(KEY_LIMIT).unwrap_or(u32::MAX as u64) as usize;
    Ok(data(space.select(index, &key(body), offset, limit)))
}

fn watch(state: &InstanceState, session: &mut Session, body: &Body) {
    let Some(key) = body.get_str(KEY_EVENT_KEY) else { return };
    if session.watched.contains_key(key) {
        // Acknowledgement of the previous event.
        return;
    }
    let current = state.values.lock().get(key).cloned();
    let (value, version) = match current {
        Some((value, version)) => (Some(value), version),
        None => (None, 0),
    };
    session.watched.insert(key.to_string(), version);
    send_event(session, key, value);
}

/// Sends events for watched keys whose value changed since the last push.
pub(crate) fn push_events(state: &InstanceState, session: &mut Session) {
    let values = state.values.lock().clone();
    let mut changed = Vec::new();
    for (key, seen) in session.watched.iter_mut() {
        if let Some((value, version)) = values.get(key) {
            if version > seen {
                *seen = *version;
                changed.push((key.clone(), value.clone()));
            }
        }
    }
    for (key, value) in changed {
        send_event(session, &key, Some(value));
    }
}

fn send_event(session: &Session, key: &str, value: Option<Value>) {
    let mut body = Body::new().with(KEY_EVENT_KEY, key);
    if let Some(value) = value {
        body.insert(KEY_EVENT_DATA, value);
    }
    let header = Header::response(RequestType::Event.code(), 0, 0);
    if let Ok(frame) = encode_frame(header, body) {
        let _ = session.tx.send(frame);
    }
}

fn reply(state: &InstanceState, session: &Session, sync: u64, reply: Reply) {
    match reply {
        Reply::Data(values) => send(state, session, sync, Ok(data(values))),
        Reply::Error { code, message } => send(state, session, sync, Err((code, message))),
        Reply::Silent => {}
        Reply::Delayed(delay, inner) => {
            let (tx, version) = (session.tx.clone(), state.schema_version());
            let Some(frame) = answer_frame(sync, version, resolve(*inner)) else { return };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(frame);
            });
        }
    }
}

/// Flattens nested delays into a final answer; a silent reply becomes `None`.
fn resolve(reply: Reply) -> Option<Answer> {
    match reply {
        Reply::Data(values) => Some(Ok(data(values))),
        Reply::Error { code, message } => Some(Err((code, message))),
        Reply::Delayed(_, inner) => resolve(*inner),
        Reply::Silent => None,
    }
}

fn answer_frame(sync: u64, version: u64, answer: Option<Answer>) -> Option<bytes::Bytes> {
    let (code, body) = match answer? {
        Ok(body) => (STATUS_OK, body),
        Err((code, message)) => (STATUS_ERROR_BIT | code, Body::new().with(KEY_ERROR_24, message)),
    };
    encode_frame(Header::response(code, sync, version), body).ok()
}

fn send(state: &InstanceState, session: &Session, sync: u64, answer: Answer) {
    if let Some(frame) = answer_frame(sync, state.schema_version(), Some(answer)) {
        let _ = session.tx.send(frame);
    }
}
