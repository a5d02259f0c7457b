//! Connection listener: accepts clients and dispatches their frames.
//!
//! Every connection runs in its own task with a private reader, and a
//! writer task that drains an outbound queue shared by replies and pushed
//! FEEDBACK frames. Requests on one connection are answered in order; a
//! slow query on one connection never stalls another.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::SosContext;
use crate::error::{Coded, ErrorCode, WireError};
use crate::feedback::Feedback;
use crate::ingest::IngestSession;
use crate::protocol::*;
use crate::query::QueryError;
use crate::stats::DaemonStats;
use crate::types::{Guid, now_secs};

const OUTBOUND_QUEUE: usize = 64;
const FEEDBACK_QUEUE: usize = 256;

/// Accept connections until `stop` fires. Connection tasks are spawned on
/// `tracker` and end when `close` fires or their client hangs up.
pub async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SosContext>,
    tracker: TaskTracker,
    stop: CancellationToken,
    close: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                socket.set_nodelay(true).ok();
                let session = ctx.guids.next();
                debug!(%peer, session, "Connection accepted");
                let conn = Connection::new(Arc::clone(&ctx), session, close.child_token());
                tracker.spawn(conn.run(socket));
            }
            Err(e) => {
                // Transient (e.g. fd exhaustion); keep accepting.
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
    info!("Listener stopped accepting connections");
}

/// What to do after handling one frame.
enum Next {
    Reply(Frame),
    /// Send the frame, then close the connection.
    Close(Frame),
}

struct Connection {
    ctx: Arc<SosContext>,
    session: Guid,
    ingest: IngestSession,
    close: CancellationToken,
}

impl Connection {
    fn new(ctx: Arc<SosContext>, session: Guid, close: CancellationToken) -> Self {
        Self {
            ctx,
            session,
            ingest: IngestSession::new(session),
            close,
        }
    }

    async fn run(mut self, socket: TcpStream) {
        let ctx = Arc::clone(&self.ctx);
        ctx.stats.connection_opened();
        let codec = SosCodec::new(ctx.config.daemon.max_frame_bytes);
        let (sink, mut stream) = Framed::new(socket, codec).split();

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (fb_tx, fb_rx) = mpsc::channel(FEEDBACK_QUEUE);
        ctx.feedback.connect(self.session, fb_tx);
        let writer = tokio::spawn(write_loop(sink, out_rx, fb_rx, Arc::clone(&ctx), self.session));

        loop {
            let next = tokio::select! {
                _ = self.close.cancelled() => break,
                next = stream.next() => next,
            };
            let outcome = match next {
                None => break,
                Some(Ok(frame)) => {
                    DaemonStats::incr(&ctx.stats.messages);
                    DaemonStats::add(&ctx.stats.bytes_in, frame.wire_len() as u64);
                    self.dispatch(frame).await
                }
                Some(Err(ProtocolError::Io(e))) => {
                    debug!(session = self.session, error = %e, "Connection read failed");
                    break;
                }
                Some(Err(e)) => self.protocol_error(&e),
            };
            let (frame, close) = match outcome {
                Next::Reply(frame) => (frame, false),
                Next::Close(frame) => (frame, true),
            };
            if out_tx.send(frame).await.is_err() || close {
                break;
            }
        }

        drop(out_tx);
        ctx.feedback.disconnect(self.session);
        ctx.query.release_session(self.session);
        if let Err(e) = writer.await {
            warn!(session = self.session, error = %e, "Connection writer panicked");
        }
        ctx.stats.connection_closed();
        debug!(session = self.session, "Connection closed");
    }

    fn protocol_error(&self, err: &ProtocolError) -> Next {
        DaemonStats::incr(&self.ctx.stats.protocol_errors);
        warn!(session = self.session, error = %err, "Protocol error, closing connection");
        Next::Close(self.ack(Ack::from_error(err)))
    }

    fn ack(&self, ack: Ack) -> Frame {
        self.reply(MsgType::Ack, 0, &ack)
    }

    fn fail(&self, err: &dyn Coded) -> Next {
        Next::Reply(self.ack(Ack::from_error(err)))
    }

    /// Encode a reply body. Our own types always serialize; if one does
    /// not, the client gets an ACK explaining why.
    fn reply<T: serde::Serialize>(&self, msg_type: MsgType, target: Guid, body: &T) -> Frame {
        Frame::with_body(msg_type, 0, target, body).unwrap_or_else(|e| {
            let ack = Ack::failed(WireError::new(ErrorCode::ProtocolError, e.to_string()));
            Frame::with_body(MsgType::Ack, 0, target, &ack)
                .unwrap_or_else(|_| Frame::new(MsgType::Ack, 0, target, bytes::Bytes::new()))
        })
    }

    fn results(&self, query_guid: Guid, result: Result<crate::results::ResultSet, QueryError>) -> Next {
        DaemonStats::incr(&self.ctx.stats.queries);
        if result.is_err() {
            DaemonStats::incr(&self.ctx.stats.query_failures);
        }
        let reply = ResultsReply::from_result(query_guid, result.map_err(|e| e.to_wire()));
        Next::Reply(self.reply(MsgType::Results, 0, &reply))
    }

    async fn dispatch(&mut self, frame: Frame) -> Next {
        match self.handle(&frame).await {
            Ok(next) => next,
            Err(e) => self.protocol_error(&e),
        }
    }

    /// `Err` only for malformed requests; per-request failures become ACKs.
    async fn handle(&mut self, frame: &Frame) -> Result<Next, ProtocolError> {
        let ctx = Arc::clone(&self.ctx);
        let next = match frame.msg_type {
            MsgType::Register => {
                let info: crate::registry::ClientInfo = frame.body()?;
                let reg = ctx.registry.register_client(&info);
                Next::Reply(self.reply(MsgType::Register, 0, &reg))
            }
            MsgType::GuidBlock => {
                let block = ctx.registry.guid_block();
                Next::Reply(self.reply(MsgType::GuidBlock, 0, &block))
            }
            MsgType::Announce => {
                let mut req: crate::registry::AnnounceRequest = frame.body()?;
                if req.guid.is_none() && frame.target != 0 {
                    req.guid = Some(frame.target);
                }
                match ctx.ingest.offload_announce(&mut self.ingest, req).await {
                    Ok(outcome) => Next::Reply(self.reply(MsgType::Announce, outcome.guid, &outcome)),
                    Err(e) => self.fail(&e),
                }
            }
            MsgType::Publish => {
                let req: PublishRequest = frame.body()?;
                let time_send = req.time_send.unwrap_or_else(now_secs);
                match ctx
                    .ingest
                    .offload_publish(&self.ingest, frame.target, req.packs, time_send)
                    .await
                {
                    Ok(ack) => {
                        DaemonStats::incr(&ctx.stats.publishes);
                        DaemonStats::add(&ctx.stats.vals, ack.committed as u64);
                        Next::Reply(self.reply(MsgType::Publish, frame.target, &ack))
                    }
                    Err(e) => self.fail(&e),
                }
            }
            MsgType::Query => {
                let req: QueryRequest = frame.body()?;
                if req.is_async {
                    let guid = ctx.query.submit(self.session, &req.sql, req.timeout_ms);
                    DaemonStats::incr(&ctx.stats.queries);
                    Next::Reply(self.reply(MsgType::Query, 0, &QueryHandle { query_guid: guid }))
                } else {
                    let result = ctx.query.execute(&req.sql, req.timeout_ms).await;
                    let guid = result.as_ref().map_or(0, |rs| rs.query_guid);
                    self.results(guid, result)
                }
            }
            MsgType::QueryStatus => {
                let req: QueryRef = frame.body()?;
                match ctx.query.status(self.session, req.query_guid) {
                    Ok(status) => Next::Reply(self.reply(MsgType::QueryStatus, 0, &status)),
                    Err(e) => self.fail(&e),
                }
            }
            MsgType::QueryClaim => {
                let req: ClaimRequest = frame.body()?;
                let result = ctx.query.claim(self.session, req.query_guid, req.wait).await;
                // Asking too early or twice is not a query failure.
                if let Err(e) = &result
                    && !matches!(e, QueryError::Pending(_) | QueryError::UnknownQuery(_))
                {
                    DaemonStats::incr(&ctx.stats.query_failures);
                }
                let reply =
                    ResultsReply::from_result(req.query_guid, result.map_err(|e| e.to_wire()));
                Next::Reply(self.reply(MsgType::Results, 0, &reply))
            }
            MsgType::QueryCancel => {
                let req: QueryRef = frame.body()?;
                match ctx.query.cancel(self.session, req.query_guid) {
                    Ok(state) => {
                        let cancelled = u64::from(state == crate::query::JobState::Cancelled);
                        Next::Reply(self.ack(Ack::ok(cancelled)))
                    }
                    Err(e) => self.fail(&e),
                }
            }
            MsgType::CacheGrab => {
                let req: crate::query::CacheGrab = frame.body()?;
                let result = ctx.query.cache_grab(&req);
                let guid = result.as_ref().map_or(0, |rs| rs.query_guid);
                self.results(guid, result)
            }
            MsgType::Pivot => {
                let req: PivotQuery = frame.body()?;
                let result = ctx.query.pivot(&req.request, req.timeout_ms).await;
                let guid = result.as_ref().map_or(0, |rs| rs.query_guid);
                self.results(guid, result)
            }
            MsgType::Manifest => {
                let req: ManifestRequest = frame.body()?;
                match ctx.registry.list_manifest(req.filter.as_deref()) {
                    Ok(pubs) => Next::Reply(self.reply(MsgType::Manifest, 0, &ManifestReply { pubs })),
                    Err(e) => self.fail(&e),
                }
            }
            MsgType::Probe => Next::Reply(self.reply(MsgType::Probe, 0, &ctx.probe())),
            MsgType::Shutdown => {
                let req: ShutdownRequest = frame.body()?;
                if ctx.authorize_shutdown(req.token.as_deref()) {
                    info!(session = self.session, sender = frame.sender, "SHUTDOWN received");
                    ctx.request_shutdown("wire SHUTDOWN");
                    Next::Reply(self.ack(Ack::ok(0)))
                } else {
                    warn!(session = self.session, "Unauthorized SHUTDOWN refused");
                    Next::Reply(self.ack(Ack::failed(WireError::new(
                        ErrorCode::Unauthorized,
                        "shutdown token missing or wrong",
                    ))))
                }
            }
            MsgType::Sensitivity => {
                let req: SenseRequest = frame.body()?;
                let added = ctx.feedback.sense(self.session, &req.handle);
                Next::Reply(self.ack(Ack::ok(u64::from(added))))
            }
            MsgType::Desensitize => {
                let req: SenseRequest = frame.body()?;
                let removed = ctx.feedback.desensitize(self.session, &req.handle);
                Next::Reply(self.ack(Ack::ok(u64::from(removed))))
            }
            MsgType::Trigger => {
                let req: TriggerRequest = frame.body()?;
                let source = if frame.sender != 0 {
                    frame.sender
                } else {
                    self.session
                };
                let delivered = ctx.feedback.fire(source, &req.handle, &req.payload);
                DaemonStats::incr(&ctx.stats.triggers);
                Next::Reply(self.ack(Ack::ok(delivered as u64)))
            }
            MsgType::Feedback | MsgType::Ack | MsgType::Results => {
                return Err(ProtocolError::Unexpected(frame.msg_type));
            }
        };
        Ok(next)
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut out_rx: mpsc::Receiver<Frame>,
    mut fb_rx: mpsc::Receiver<Feedback>,
    ctx: Arc<SosContext>,
    session: Guid,
) where
    S: futures::Sink<Frame, Error = ProtocolError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            Some(fb) = fb_rx.recv() => match Frame::with_body(MsgType::Feedback, fb.source_guid, 0, &fb) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(session, error = %e, "Dropping unencodable feedback");
                    continue;
                }
            },
        };
        let len = frame.wire_len() as u64;
        if let Err(e) = sink.send(frame).await {
            debug!(session, error = %e, "Connection write failed");
            break;
        }
        DaemonStats::add(&ctx.stats.bytes_out, len);
    }
    sink.close().await.ok();
}
