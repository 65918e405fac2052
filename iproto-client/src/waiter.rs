//! # Response Waiters
//!
//! A waiter is the pending half of one request: it owns the sender that
//! completes the caller's future and the timer that fails it at the
//! deadline. Whoever removes the waiter from the pending table completes
//! it, so each waiter resolves exactly once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use iproto_common::{Body, SyncId};
use rmpv::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{ClientError, ClientResult};

/// How response data is presented to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// The whole data array.
    #[default]
    Data,
    /// Only the first element of the data array (`Nil` when empty).
    Single,
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Response {
    pub sync: u64,
    /// Schema version reported by the server.
    pub schema_version: Option<u64>,
    pub body: Body,
    pub format: ResponseFormat,
}

impl Response {
    /// Takes the data array.
    pub fn into_data(mut self) -> Vec<Value> {
        self.body.take_data()
    }

    /// Applies the response format.
    pub fn into_value(self) -> Value {
        let format = self.format;
        let mut data = self.into_data();
        match format {
            ResponseFormat::Data => Value::Array(data),
            ResponseFormat::Single => {
                if data.is_empty() {
                    Value::Nil
                } else {
                    data.swap_remove(0)
                }
            }
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the connection's default timeout.
    pub timeout: Option<Duration>,
    pub format: ResponseFormat,
    /// Schema version the request was built against.
    pub schema_version: Option<u64>,
    pub(crate) stream_id: Option<u64>,
}

impl RequestOptions {
    pub fn new() -> Self {
        RequestOptions::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = Some(version);
        self
    }
}

pub(crate) struct ResponseWaiter {
    tx: oneshot::Sender<ClientResult<Response>>,
    pub(crate) format: ResponseFormat,
    pub(crate) started: Instant,
    timer: Option<AbortHandle>,
}

impl ResponseWaiter {
    pub(crate) fn new(format: ResponseFormat) -> (Self, oneshot::Receiver<ClientResult<Response>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = ResponseWaiter {
            tx,
            format,
            started: Instant::now(),
            timer: None,
        };
        (waiter, rx)
    }

    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        self.timer = Some(timer);
    }

    /// Resolves the waiter; the caller may have dropped its future already.
    pub(crate) fn complete(self, result: ClientResult<Response>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.tx.send(result);
    }
}

/// Future returned by `send_request`, resolved by the connection.
#[derive(Debug)]
#[must_use = "a response future does nothing unless awaited"]
pub struct ResponseFuture {
    sync: SyncId,
    rx: oneshot::Receiver<ClientResult<Response>>,
}

impl ResponseFuture {
    pub(crate) fn new(sync: SyncId, rx: oneshot::Receiver<ClientResult<Response>>) -> Self {
        ResponseFuture { sync, rx }
    }

    pub fn sync(&self) -> SyncId {
        self.sync
    }
}

impl Future for ResponseFuture {
    type Output = ClientResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iproto_common::KEY_DATA;

    fn response(data: Vec<Value>, format: ResponseFormat) -> Response {
        Response {
            sync: 1,
            schema_version: Some(1),
            body: Body::new().with(KEY_DATA, Value::Array(data)),
            format,
        }
    }

    #[test]
    fn format_single_takes_first() {
        let value = response(vec![Value::from(1), Value::from(2)], ResponseFormat::Single).into_value();
        assert_eq!(value, Value::from(1));
        assert_eq!(response(vec![], ResponseFormat::Single).into_value(), Value::Nil);
    }

    #[test]
    fn format_data_keeps_array() {
        let value = response(vec![Value::from(1)], ResponseFormat::Data).into_value();
        assert_eq!(value, Value::Array(vec![Value::from(1)]));
    }

    #[tokio::test]
    async fn dropped_waiter_reads_as_closed() {
        let (waiter, rx) = ResponseWaiter::new(ResponseFormat::Data);
        let future = ResponseFuture::new(SyncId(3), rx);
        drop(waiter);
        assert!(matches!(future.await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn completed_waiter_delivers_result() {
        let (waiter, rx) = ResponseWaiter::new(ResponseFormat::Data);
        let future = ResponseFuture::new(SyncId(4), rx);
        assert_eq!(future.sync(), SyncId(4));
        waiter.complete(Ok(response(vec![Value::from("x")], ResponseFormat::Data)));
        let data = future.await.unwrap().into_data();
        assert_eq!(data, vec![Value::from("x")]);
    }
}
