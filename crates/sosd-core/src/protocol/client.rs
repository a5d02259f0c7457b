//! Wire client used by the CLI, tests, and embedding tools.
//!
//! Packs are buffered locally per pub and travel with the next PUBLISH,
//! mirroring how instrumented programs talk to the daemon. FEEDBACK frames
//! that arrive while a reply is awaited are queued and handed out by
//! [`SosClient::next_feedback`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::debug;

use super::codec::{Frame, MsgType, SosCodec};
use super::message::*;
use super::ProtocolError;
use crate::error::WireError;
use crate::feedback::Feedback;
use crate::guid::GuidBlock;
use crate::ingest::{PackEntry, PublishAck};
use crate::query::{CacheGrab, JobStatus, PivotRequest};
use crate::registry::{AnnounceOutcome, AnnounceRequest, ClientInfo, ManifestEntry, Registration};
use crate::results::ResultSet;
use crate::types::{Guid, Value, now_secs};

const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("daemon closed the connection")]
    Closed,

    #[error("daemon rejected the request: {0}")]
    Rejected(WireError),

    #[error("expected a {expected:?} reply, got {got:?}")]
    UnexpectedReply { expected: MsgType, got: MsgType },
}

impl ClientError {
    /// The daemon's error, when the request was refused.
    pub fn wire(&self) -> Option<&WireError> {
        match self {
            ClientError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

pub struct SosClient {
    framed: Framed<TcpStream, SosCodec>,
    guid: Guid,
    feedback: VecDeque<Feedback>,
    pending: HashMap<Guid, Vec<PackEntry>>,
}

impl SosClient {
    pub async fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            framed: Framed::new(stream, SosCodec::new(DEFAULT_MAX_FRAME_BYTES)),
            guid: 0,
            feedback: VecDeque::new(),
            pending: HashMap::new(),
        })
    }

    /// Client guid issued by REGISTER, or 0 before registering.
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Send one frame and return the next non-FEEDBACK frame.
    pub async fn roundtrip(&mut self, frame: Frame) -> Result<Frame, ClientError> {
        self.framed.send(frame).await?;
        loop {
            let reply = self.framed.next().await.ok_or(ClientError::Closed)??;
            if reply.msg_type == MsgType::Feedback {
                self.feedback.push_back(reply.body()?);
                continue;
            }
            return Ok(reply);
        }
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &mut self,
        msg_type: MsgType,
        target: Guid,
        body: &B,
        expected: MsgType,
    ) -> Result<R, ClientError> {
        let frame = Frame::with_body(msg_type, self.guid, target, body)?;
        let reply = self.roundtrip(frame).await?;
        if reply.msg_type == MsgType::Ack && expected != MsgType::Ack {
            let ack: Ack = reply.body()?;
            return Err(ClientError::Rejected(ack.error.unwrap_or_else(|| {
                WireError::new(crate::error::ErrorCode::ProtocolError, "bare ACK")
            })));
        }
        if reply.msg_type != expected {
            return Err(ClientError::UnexpectedReply {
                expected,
                got: reply.msg_type,
            });
        }
        Ok(reply.body()?)
    }

    async fn ack<B: Serialize>(&mut self, msg_type: MsgType, body: &B) -> Result<u64, ClientError> {
        let ack: Ack = self.call(msg_type, 0, body, MsgType::Ack).await?;
        match ack.error {
            Some(e) => Err(ClientError::Rejected(e)),
            None => Ok(ack.count),
        }
    }

    async fn results<B: Serialize>(
        &mut self,
        msg_type: MsgType,
        body: &B,
    ) -> Result<ResultSet, ClientError> {
        let reply: ResultsReply = self.call(msg_type, 0, body, MsgType::Results).await?;
        reply.into_result().map_err(ClientError::Rejected)
    }

    pub async fn register(&mut self, info: &ClientInfo) -> Result<Registration, ClientError> {
        let reg: Registration = self
            .call(MsgType::Register, 0, info, MsgType::Register)
            .await?;
        self.guid = reg.client_guid;
        debug!(client_guid = reg.client_guid, "Registered with daemon");
        Ok(reg)
    }

    pub async fn guid_block(&mut self) -> Result<GuidBlock, ClientError> {
        self.call(MsgType::GuidBlock, 0, &serde_json::json!({}), MsgType::GuidBlock)
            .await
    }

    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<AnnounceOutcome, ClientError> {
        let target = req.guid.unwrap_or(0);
        self.call(MsgType::Announce, target, req, MsgType::Announce)
            .await
    }

    /// Buffer a value for the next publish of `pub_guid`.
    pub fn pack(&mut self, pub_guid: Guid, name: &str, value: &Value) {
        self.pack_entry(pub_guid, PackEntry::new(name, value));
    }

    pub fn pack_entry(&mut self, pub_guid: Guid, entry: PackEntry) {
        self.pending.entry(pub_guid).or_default().push(entry);
    }

    /// Send every buffered pack of `pub_guid` as one publish.
    pub async fn publish(&mut self, pub_guid: Guid) -> Result<PublishAck, ClientError> {
        let req = PublishRequest {
            packs: self.pending.remove(&pub_guid).unwrap_or_default(),
            time_send: Some(now_secs()),
        };
        self.call(MsgType::Publish, pub_guid, &req, MsgType::Publish)
            .await
    }

    /// Run a query and wait for its rows.
    pub async fn query(&mut self, sql: &str, timeout_ms: Option<u64>) -> Result<ResultSet, ClientError> {
        let req = QueryRequest {
            sql: sql.to_string(),
            is_async: false,
            timeout_ms,
        };
        self.results(MsgType::Query, &req).await
    }

    /// Start a query in the background and return its guid.
    pub async fn submit(&mut self, sql: &str, timeout_ms: Option<u64>) -> Result<Guid, ClientError> {
        let req = QueryRequest {
            sql: sql.to_string(),
            is_async: true,
            timeout_ms,
        };
        let handle: QueryHandle = self.call(MsgType::Query, 0, &req, MsgType::Query).await?;
        Ok(handle.query_guid)
    }

    pub async fn status(&mut self, query_guid: Guid) -> Result<JobStatus, ClientError> {
        self.call(
            MsgType::QueryStatus,
            0,
            &QueryRef { query_guid },
            MsgType::QueryStatus,
        )
        .await
    }

    /// Whether an async query has finished.
    pub async fn poll(&mut self, query_guid: Guid) -> Result<bool, ClientError> {
        Ok(self.status(query_guid).await?.is_done)
    }

    /// Take the result of an async query. Without `wait` an unfinished
    /// query is refused with `QueryPending`.
    pub async fn claim(&mut self, query_guid: Guid, wait: bool) -> Result<ResultSet, ClientError> {
        self.results(MsgType::QueryClaim, &ClaimRequest { query_guid, wait })
            .await
    }

    /// Wait for an async query and take its result.
    pub async fn wait(&mut self, query_guid: Guid) -> Result<ResultSet, ClientError> {
        self.claim(query_guid, true).await
    }

    /// Returns true when the query ended up cancelled.
    pub async fn cancel(&mut self, query_guid: Guid) -> Result<bool, ClientError> {
        Ok(self.ack(MsgType::QueryCancel, &QueryRef { query_guid }).await? > 0)
    }

    pub async fn cache_grab(&mut self, req: &CacheGrab) -> Result<ResultSet, ClientError> {
        self.results(MsgType::CacheGrab, req).await
    }

    pub async fn pivot(
        &mut self,
        request: &PivotRequest,
        timeout_ms: Option<u64>,
    ) -> Result<ResultSet, ClientError> {
        let req = PivotQuery {
            request: request.clone(),
            timeout_ms,
        };
        self.results(MsgType::Pivot, &req).await
    }

    pub async fn manifest(&mut self, filter: Option<&str>) -> Result<Vec<ManifestEntry>, ClientError> {
        let req = ManifestRequest {
            filter: filter.map(str::to_string),
        };
        let reply: ManifestReply = self
            .call(MsgType::Manifest, 0, &req, MsgType::Manifest)
            .await?;
        Ok(reply.pubs)
    }

    pub async fn probe(&mut self) -> Result<ProbeReply, ClientError> {
        self.call(MsgType::Probe, 0, &serde_json::json!({}), MsgType::Probe)
            .await
    }

    /// Returns false when this connection was already sensitive.
    pub async fn sense(&mut self, handle: &str) -> Result<bool, ClientError> {
        let req = SenseRequest {
            handle: handle.to_string(),
        };
        Ok(self.ack(MsgType::Sensitivity, &req).await? > 0)
    }

    pub async fn desensitize(&mut self, handle: &str) -> Result<bool, ClientError> {
        let req = SenseRequest {
            handle: handle.to_string(),
        };
        Ok(self.ack(MsgType::Desensitize, &req).await? > 0)
    }

    /// Fire a trigger; returns how many sessions it reached.
    pub async fn trigger(&mut self, handle: &str, payload: &str) -> Result<u64, ClientError> {
        let req = TriggerRequest {
            handle: handle.to_string(),
            payload: payload.to_string(),
        };
        self.ack(MsgType::Trigger, &req).await
    }

    /// Next queued or incoming FEEDBACK, or `None` once `timeout` passes.
    pub async fn next_feedback(&mut self, timeout: Duration) -> Result<Option<Feedback>, ClientError> {
        if let Some(fb) = self.feedback.pop_front() {
            return Ok(Some(fb));
        }
        let next = match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(next) => next,
            Err(_) => return Ok(None),
        };
        let frame = next.ok_or(ClientError::Closed)??;
        if frame.msg_type != MsgType::Feedback {
            return Err(ClientError::UnexpectedReply {
                expected: MsgType::Feedback,
                got: frame.msg_type,
            });
        }
        Ok(Some(frame.body()?))
    }

    /// Ask the daemon to shut down.
    pub async fn shutdown(&mut self, token: Option<&str>) -> Result<(), ClientError> {
        let req = ShutdownRequest {
            token: token.map(str::to_string),
        };
        self.ack(MsgType::Shutdown, &req).await.map(|_| ())
    }
}
