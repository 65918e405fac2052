//! # Streams
//!
//! A stream is an ordered, optionally transactional sequence of requests on
//! one connection. Every request sent through a `Stream` carries its stream
//! id; the server executes them in order.

use std::time::Duration;

use iproto_common::{
    begin_body, call_body, eval_body, tuple_body, Body, RequestTarget, RequestType, StreamId,
};
use rmpv::Value;

use crate::connection::Connection;
use crate::error::ClientResult;
use crate::waiter::{RequestOptions, ResponseFuture};

/// Handle to one stream; created by `Connection::new_stream`.
#[derive(Debug, Clone)]
pub struct Stream {
    conn: Connection,
    id: StreamId,
}

impl Stream {
    pub(crate) fn new(conn: Connection, id: StreamId) -> Self {
        Stream { conn, id }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn send(&self, kind: RequestType, body: Body, mut opts: RequestOptions) -> ClientResult<ResponseFuture> {
        opts.stream_id = Some(self.id.get());
        self.conn.send_request(kind, body, opts)
    }

    /// Starts a transaction; `timeout` bounds it server-side.
    pub fn begin(&self, timeout: Option<Duration>) -> ClientResult<ResponseFuture> {
        let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
        self.send(RequestType::Begin, begin_body(secs), RequestOptions::new())
    }

    pub fn commit(&self) -> ClientResult<ResponseFuture> {
        self.send(RequestType::Commit, Body::new(), RequestOptions::new())
    }

    pub fn rollback(&self) -> ClientResult<ResponseFuture> {
        self.send(RequestType::Rollback, Body::new(), RequestOptions::new())
    }

    pub fn call(&self, function: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.send(RequestType::Call, call_body(function, args), opts)
    }

    pub fn eval(&self, expr: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.send(RequestType::Eval, eval_body(expr, args), opts)
    }

    /// Inserts by numeric space id.
    pub fn insert(&self, space: u32, tuple: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.send(RequestType::Insert, tuple_body(&RequestTarget::ById(space), tuple), opts)
    }
}
