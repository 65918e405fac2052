//! # Connection Factory
//!
//! Purpose: Turn an instance group descriptor into a Ready connection.
//!
//! ## Handshake
//!
//! ```text
//! TCP connect ─► (TLS) ─► greeting ─► Connecting
//!   ─► ID (version + features) ─► Authenticating ─► AUTH (unless guest)
//!   ─► SchemaSync ─► PING (publishes schema version) ─► Ready
//! ```
//!
//! The whole sequence is bounded by the connect timeout; a connection that
//! fails any step is closed before the error is returned.

use std::time::Duration;

use iproto_common::*;
use rmpv::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{ClientConfig, TlsConfig};
use crate::connection::{Connection, ConnectionContext, ConnectionState};
use crate::error::{ClientError, ClientResult};
use crate::group::InstanceConnectionGroup;
use crate::tls::{build_connector, wrap_tls, ClientStream};
use crate::waiter::RequestOptions;

/// Builds connections for the pool.
#[derive(Clone)]
pub struct ConnectionFactory {
    context: ConnectionContext,
    connect_timeout: Duration,
    tls: Option<(TlsConnector, TlsConfig)>,
}

impl ConnectionFactory {
    pub fn new(context: ConnectionContext, config: &ClientConfig) -> ClientResult<Self> {
        let tls = match &config.tls {
            Some(tls) => Some((build_connector(tls)?, tls.clone())),
            None => None,
        };
        Ok(ConnectionFactory {
            context,
            connect_timeout: config.connect_timeout(),
            tls,
        })
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Connects, negotiates, and authenticates one connection.
    pub async fn connect(&self, group: &InstanceConnectionGroup, index: usize) -> ClientResult<Connection> {
        let addr = group.addr();
        let stream = tokio::time::timeout(self.connect_timeout, self.open(group))
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })??;

        let (stream, greeting) = stream;
        debug!(tag = %group.tag, index, %addr, server = %greeting.server, "greeting received");
        let conn = Connection::spawn(stream, group.tag.clone(), index, greeting.salt, self.context.clone());

        match tokio::time::timeout(self.connect_timeout, self.handshake(&conn, group)).await {
            Ok(Ok(())) => {
                conn.set_state(ConnectionState::Ready);
                debug!(tag = %group.tag, index, negotiated = ?conn.negotiated(), "connection ready");
                Ok(conn)
            }
            Ok(Err(err)) => {
                conn.abort();
                Err(err)
            }
            Err(_) => {
                conn.abort();
                Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("handshake with {} timed out", addr),
                )))
            }
        }
    }

    async fn open(&self, group: &InstanceConnectionGroup) -> ClientResult<(ClientStream, Greeting)> {
        let tcp = TcpStream::connect((group.host.as_str(), group.port)).await?;
        tcp.set_nodelay(true)?;
        let mut stream = match &self.tls {
            Some((connector, tls)) => {
                let server_name = tls.server_name.as_deref().unwrap_or(&group.host);
                wrap_tls(connector, server_name, tcp).await?
            }
            None => ClientStream::Tcp(tcp),
        };

        let mut raw = [0u8; GREETING_SIZE];
        stream.read_exact(&mut raw).await?;
        let greeting = Greeting::parse(&raw)?;
        Ok((stream, greeting))
    }

    async fn handshake(&self, conn: &Connection, group: &InstanceConnectionGroup) -> ClientResult<()> {
        conn.set_negotiated(negotiate(conn).await?);

        conn.set_state(ConnectionState::Authenticating);
        if group.needs_auth() {
            let response = conn
                .authorize(&group.user, &group.password, RequestOptions::new())?
                .await;
            match response {
                Ok(_) => {}
                Err(ClientError::Server { message, .. }) => return Err(ClientError::Auth(message)),
                Err(err) => return Err(err),
            }
        }

        conn.set_state(ConnectionState::SchemaSync);
        let pong = conn.ping(RequestOptions::new())?.await?;
        if let Some(version) = pong.schema_version {
            self.context.schema_versions.observe(version);
        }
        Ok(())
    }
}

/// Sends `ID` and derives the negotiated protocol.
///
/// Servers that predate `ID` answer with "unknown request type"; they get
/// version 0 and no features.
async fn negotiate(conn: &Connection) -> ClientResult<Negotiated> {
    let ours = FeatureSet::all();
    let request = conn.send_request(
        RequestType::Id,
        id_body(CLIENT_PROTOCOL_VERSION, ours),
        RequestOptions::new(),
    )?;
    match request.await {
        Ok(response) => {
            let version = response.body.get_u64(KEY_VERSION).unwrap_or(0);
            let ids = response
                .body
                .get(KEY_FEATURES)
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_u64).collect::<Vec<_>>())
                .unwrap_or_default();
            Ok(Negotiated::new(
                version.min(CLIENT_PROTOCOL_VERSION),
                ours.intersect(FeatureSet::from_ids(ids)),
            ))
        }
        Err(ClientError::Server { code, .. }) if code == ER_UNKNOWN_REQUEST_TYPE => {
            warn!(tag = %conn.tag(), index = conn.index(), "server does not support ID, using legacy protocol");
            Ok(Negotiated::default())
        }
        Err(err) => Err(err),
    }
}
