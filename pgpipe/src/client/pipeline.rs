//! Query pipeline.
//!
//! Sequences submitted queries onto one connection and routes backend
//! messages back to the query that caused them. The pipeline does no io,
//! frontend messages are written into an output buffer which the worker
//! flushes, and backend messages are fed in one at a time.
//!
//! Exactly one query is active. The next queued query is written only after
//! the `ReadyForQuery` of the previous one, so every `Sync` pairs with one
//! query.
use bytes::BytesMut;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::{mpsc::UnboundedSender, oneshot}, time::Instant};

use super::{Event, Shared, query::{Query, QueryResult, ResultSet}, statement::StatementCache};
use crate::{
    Error, Result,
    common::{debug, verbose, warning},
    encode::Param,
    error::{ConnectionClosed, InvalidQuery, QueryTimeout},
    postgres::{
        BackendMessage, FieldDescriptor, ProtocolError,
        frontend::{self, Bind, Close, CopyFail, Describe, Execute, Flush, Parse, Sync, Target},
    },
    row::Row,
    value::{Decoder, Value},
};

const COPY_IN_UNSUPPORTED: &str = "COPY FROM STDIN is not supported";

pub(crate) type Reply = oneshot::Sender<Result<QueryResult>>;

/// Work item written to the backend.
#[derive(Debug)]
pub(crate) enum Request {
    Query(Query),
    /// Close a named statement.
    Close(String),
}

#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) request: Request,
    pub(crate) reply: Reply,
    pub(crate) deadline: Option<Instant>,
}

/// The query whose messages are in flight.
struct Active {
    /// `None` once resolved early, the remaining messages are drained and discarded.
    reply: Option<Reply>,
    deadline: Option<Instant>,
    /// Statement name whose `Parse` awaits `ParseComplete`.
    parsing: Option<String>,
    /// Row limit per `Execute`, zero when unlimited.
    max_rows: u32,
    sync_sent: bool,
    suspended: bool,
    fields: Option<Arc<[FieldDescriptor]>>,
    rows: Vec<Row>,
    sets: Vec<ResultSet>,
}

impl Active {
    fn resolve(&mut self, result: Result<QueryResult>) {
        if let Some(reply) = self.reply.take() {
            // receiver dropped means the caller is no longer interested
            let _ = reply.send(result);
        }
        self.rows.clear();
        self.sets.clear();
    }

    fn is_discarding(&self) -> bool {
        self.reply.is_none()
    }
}

pub(crate) struct Pipeline {
    queue: VecDeque<Submission>,
    active: Option<Active>,
    /// `ReadyForQuery` observed and no query written since.
    ready: bool,
    statements: StatementCache,
    decoder: Arc<dyn Decoder>,
    events: Option<UnboundedSender<Event>>,
    shared: Arc<Shared>,
    out: BytesMut,
}

impl Pipeline {
    /// Pipeline over a connection that completed startup.
    pub(crate) fn new(decoder: Arc<dyn Decoder>, shared: Arc<Shared>) -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            ready: true,
            statements: StatementCache::default(),
            decoder,
            events: None,
            shared,
            out: BytesMut::with_capacity(1024),
        }
    }

    pub(crate) fn subscribe(&mut self, events: UnboundedSender<Event>) {
        self.events = Some(events);
    }

    /// Queue a request, client side violations are rejected before anything is written.
    pub(crate) fn submit(&mut self, submission: Submission) {
        let checked = match &submission.request {
            Request::Query(query) => query
                .validate()
                .map_err(Error::from)
                .and_then(|_| match &query.name {
                    Some(name) => self.statements.reserve(name, &query.text).map_err(Error::from),
                    None => Ok(()),
                }),
            Request::Close(name) if name.contains('\0') => {
                Err(InvalidQuery::NulByte("statement name").into())
            },
            Request::Close(_) => Ok(()),
        };
        if let Err(err) = checked {
            let _ = submission.reply.send(Err(err));
            return;
        }

        self.queue.push_back(submission);
    }

    /// Write queued requests while the backend is ready.
    pub(crate) fn dispatch(&mut self, now: Instant) {
        while self.ready && self.active.is_none() {
            let Some(Submission { request, reply, deadline }) = self.queue.pop_front() else {
                break;
            };

            if reply.is_closed() {
                release(&mut self.statements, &request);
                continue;
            }

            if deadline.is_some_and(|deadline| deadline <= now) {
                release(&mut self.statements, &request);
                let _ = reply.send(Err(QueryTimeout { sent: false }.into()));
                continue;
            }

            self.active = Some(self.write(request, reply, deadline));
            self.ready = false;
        }
    }

    fn write(&mut self, request: Request, reply: Reply, deadline: Option<Instant>) -> Active {
        let mut active = Active {
            reply: Some(reply),
            deadline,
            parsing: None,
            max_rows: 0,
            sync_sent: true,
            suspended: false,
            fields: None,
            rows: Vec::new(),
            sets: Vec::new(),
        };

        let out = &mut self.out;

        match request {
            Request::Query(query) if !query.requires_preparation() => {
                verbose!(sql = %query.text, "simple query");
                frontend::write(frontend::Query { sql: &query.text }, out);
            },
            Request::Query(query) => {
                verbose!(sql = %query.text, name = ?query.name, rows = query.rows, "extended query");
                let stmt_name = query.name.as_deref().unwrap_or_default();
                let needs_parse = match &query.name {
                    Some(name) => self.statements.prepare(name, &query.text),
                    None => true,
                };

                if needs_parse {
                    let oids = query.parse_types().unwrap_or_default();
                    frontend::write(Parse { prepare_name: stmt_name, sql: &query.text, oids }, out);
                    active.parsing = query.name.clone();
                }

                frontend::write(Bind {
                    portal_name: "",
                    stmt_name,
                    params: &query.values,
                    binary: query.binary,
                    encoder: Param::clone,
                }, out);
                frontend::write(Describe { kind: Target::Portal, name: "" }, out);
                frontend::write(Execute { portal_name: "", max_rows: query.rows }, out);

                if query.rows > 0 {
                    // Sync would close the portal, it is deferred until exhaustion
                    frontend::write(Flush, out);
                    active.max_rows = query.rows;
                    active.sync_sent = false;
                } else {
                    frontend::write(Sync, out);
                }
            },
            Request::Close(name) => {
                verbose!(name = %name, "close statement");
                frontend::write(Close { kind: Target::Statement, name: &name }, out);
                frontend::write(Sync, out);
                self.statements.close(&name);
            },
        }

        active
    }

    /// Route one backend message, an error means the connection can not continue.
    pub(crate) fn handle(&mut self, message: BackendMessage) -> Result<()> {
        let msgtype = message.msgtype();

        match message {
            BackendMessage::ReadyForQuery(ready) => {
                if let Some(status) = ready.status() {
                    self.shared.set_transaction_status(status);
                }
                if let Some(mut active) = self.active.take() {
                    let sets = std::mem::take(&mut active.sets);
                    active.resolve(Ok(QueryResult::from_sets(sets)));
                }
                self.ready = true;
            },
            BackendMessage::RowDescription(desc) => {
                let active = active_mut(&mut self.active, msgtype)?;
                active.fields = Some(desc.fields);
                active.rows.clear();
            },
            BackendMessage::DataRow(row) => {
                let active = active_mut(&mut self.active, msgtype)?;
                let Some(fields) = &active.fields else {
                    return Err(ProtocolError::unexpected_phase(msgtype, "query pipeline").into());
                };
                if row.values.len() != fields.len() {
                    return Err(ProtocolError::malformed(msgtype, "column count differs from row description").into());
                }
                if active.is_discarding() {
                    return Ok(());
                }

                let values = fields
                    .iter()
                    .zip(row.values)
                    .map(|(field, raw)| match raw {
                        Some(raw) => self.decoder.decode(field.type_oid, field.format, &raw),
                        None => Value::Null,
                    })
                    .collect();
                active.rows.push(Row::new(fields.clone(), values));
            },
            BackendMessage::CommandComplete(complete) => {
                let active = active_mut(&mut self.active, msgtype)?;
                let rows = std::mem::take(&mut active.rows);
                let mut set = ResultSet::new(Some(complete.tag), active.fields.take(), rows);
                if std::mem::take(&mut active.suspended) {
                    // the tag only counts rows of the last Execute
                    let total = set.rows().len() as u64;
                    set = set.with_row_count(total);
                }
                if !active.is_discarding() {
                    active.sets.push(set);
                }
                self.sync_deferred();
            },
            BackendMessage::EmptyQueryResponse(_) => {
                let active = active_mut(&mut self.active, msgtype)?;
                if !active.is_discarding() {
                    active.sets.push(ResultSet::new(None, None, Vec::new()));
                }
                self.sync_deferred();
            },
            BackendMessage::PortalSuspended(_) => {
                let active = active_mut(&mut self.active, msgtype)?;
                if active.max_rows == 0 {
                    return Err(ProtocolError::unexpected_phase(msgtype, "unlimited execute").into());
                }
                active.suspended = true;
                if active.is_discarding() {
                    // nobody awaits the remaining rows, Sync closes the portal
                    self.sync_deferred();
                    return Ok(());
                }
                verbose!(max_rows = active.max_rows, "portal suspended");
                frontend::write(Execute { portal_name: "", max_rows: active.max_rows }, &mut self.out);
                frontend::write(Flush, &mut self.out);
            },
            BackendMessage::ParseComplete(_) => {
                active_mut(&mut self.active, msgtype)?.parsing = None;
            },
            BackendMessage::BindComplete(_)
            | BackendMessage::CloseComplete(_)
            | BackendMessage::NoData(_)
            | BackendMessage::ParameterDescription(_) => {
                active_mut(&mut self.active, msgtype)?;
            },
            BackendMessage::ErrorResponse(err) => {
                let Some(active) = self.active.as_mut() else {
                    return Err(err.into());
                };
                debug!("query failed: {}", *err);
                if let Some(name) = active.parsing.take() {
                    self.statements.parse_failed(&name);
                }
                active.resolve(Err(err.into()));
                // backend discards everything until Sync
                self.sync_deferred();
            },
            BackendMessage::CopyInResponse(_) => {
                active_mut(&mut self.active, msgtype)?;
                frontend::write(CopyFail { message: COPY_IN_UNSUPPORTED }, &mut self.out);
            },
            BackendMessage::CopyOutResponse(_)
            | BackendMessage::CopyBothResponse(_)
            | BackendMessage::CopyData(_)
            | BackendMessage::CopyDone(_) => {
                active_mut(&mut self.active, msgtype)?;
            },
            BackendMessage::NoticeResponse(notice) => {
                self.emit(Event::Notice(notice.into()));
            },
            BackendMessage::NotificationResponse(notification) => {
                self.emit(Event::Notification {
                    process_id: notification.process_id,
                    channel: notification.channel,
                    payload: notification.payload,
                });
            },
            BackendMessage::ParameterStatus(param) => {
                self.shared.set_parameter(param.name.clone(), param.value.clone());
                self.emit(Event::Parameter { name: param.name, value: param.value });
            },
            BackendMessage::Unsupported(_unsupported) => {
                warning!(
                    "ignoring unsupported message {:?} of {} bytes",
                    _unsupported.msgtype as char,
                    _unsupported.body.len(),
                );
            },
            message @ (BackendMessage::Authentication(_)
            | BackendMessage::BackendKeyData(_)
            | BackendMessage::NegotiateProtocolVersion(_)
            | BackendMessage::FunctionCallResponse(_)) => {
                return Err(message.unexpected("query pipeline").into());
            },
        }

        Ok(())
    }

    /// Write the `Sync` a row limited query deferred.
    fn sync_deferred(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if !active.sync_sent {
                frontend::write(Sync, &mut self.out);
                active.sync_sent = true;
            }
        }
    }

    fn emit(&mut self, event: Event) {
        let Some(events) = &self.events else {
            log_event(&event);
            return;
        };
        if let Err(err) = events.send(event) {
            self.events = None;
            log_event(&err.0);
        }
    }

    /// Earliest deadline of a query not yet resolved.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let active = self
            .active
            .as_ref()
            .filter(|active| !active.is_discarding())
            .and_then(|active| active.deadline);
        self.queue.iter().filter_map(|sub| sub.deadline).chain(active).min()
    }

    /// Resolve queries whose deadline passed.
    ///
    /// A queued query is removed without being written. The active query is
    /// resolved but keeps being drained, its `ReadyForQuery` is still awaited.
    pub(crate) fn expire(&mut self, now: Instant) {
        let expired = |deadline: Option<Instant>| deadline.is_some_and(|deadline| deadline <= now);

        if let Some(active) = self.active.as_mut().filter(|active| expired(active.deadline)) {
            if !active.is_discarding() {
                debug!("query timed out after being sent");
                active.resolve(Err(QueryTimeout { sent: true }.into()));
            }
        }

        if self.queue.iter().any(|sub| expired(sub.deadline)) {
            let queue = std::mem::take(&mut self.queue);
            for sub in queue {
                if expired(sub.deadline) {
                    release(&mut self.statements, &sub.request);
                    let _ = sub.reply.send(Err(QueryTimeout { sent: false }.into()));
                } else {
                    self.queue.push_back(sub);
                }
            }
        }
    }

    /// Fail every pending query, the connection is gone.
    ///
    /// `cause` is `None` when the client ended the connection itself.
    pub(crate) fn close(&mut self, cause: Option<Error>) {
        let cause = cause.map(Arc::new);
        if let Some(mut active) = self.active.take() {
            active.resolve(Err(ConnectionClosed::new(true, cause.clone()).into()));
        }
        for sub in self.queue.drain(..) {
            let _ = sub.reply.send(Err(ConnectionClosed::new(false, cause.clone()).into()));
        }
        self.ready = false;
    }

    /// Buffered frontend messages, to be written to the connection.
    pub(crate) fn take_output(&mut self) -> Option<BytesMut> {
        match self.out.is_empty() {
            true => None,
            false => Some(self.out.split()),
        }
    }

    /// A query was written and its `ReadyForQuery` is outstanding.
    pub(crate) fn is_busy(&self) -> bool {
        self.active.is_some()
    }
}

/// Messages answering a query are a violation while nothing is active.
fn active_mut(active: &mut Option<Active>, msgtype: u8) -> Result<&mut Active, ProtocolError> {
    active
        .as_mut()
        .ok_or_else(|| ProtocolError::unexpected_phase(msgtype, "query pipeline"))
}

fn release(statements: &mut StatementCache, request: &Request) {
    if let Request::Query(Query { name: Some(name), .. }) = request {
        statements.release(name);
    }
}

fn log_event(event: &Event) {
    match event {
        Event::Notice(_notice) => {
            warning!("{_notice}");
        },
        Event::Notification { .. } | Event::Parameter { .. } => {
            debug!("unobserved event: {event:?}");
        },
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot::error::TryRecvError};

    use super::*;
    use crate::{
        ErrorClass, ErrorKind,
        postgres::{
            BackendProtocol, TransactionStatus, oid,
            testing::{Frame, frontend_tags, split_frontend},
        },
        value::DefaultDecoder,
    };

    fn pipeline() -> Pipeline {
        Pipeline::new(Arc::new(DefaultDecoder), Arc::new(Shared::default()))
    }

    fn submit(p: &mut Pipeline, query: impl Into<Query>) -> oneshot::Receiver<Result<QueryResult>> {
        let (reply, recv) = oneshot::channel();
        p.submit(Submission { request: Request::Query(query.into()), reply, deadline: None });
        p.dispatch(Instant::now());
        recv
    }

    fn feed(p: &mut Pipeline, frames: &[Frame]) {
        for frame in frames {
            let (msgtype, body) = frame.clone().into_parts();
            p.handle(BackendMessage::decode(msgtype, body).unwrap()).unwrap();
            p.dispatch(Instant::now());
        }
    }

    fn output(p: &mut Pipeline) -> Vec<u8> {
        p.take_output().map(|b| b.to_vec()).unwrap_or_default()
    }

    fn simple_response(value: &str) -> Vec<Frame> {
        vec![
            Frame::row_description(&[("n", oid::INT4)]),
            Frame::data_row(&[Some(value)]),
            Frame::command_complete("SELECT 1"),
            Frame::ready(b'I'),
        ]
    }

    fn resolved(recv: &mut oneshot::Receiver<Result<QueryResult>>) -> Result<QueryResult> {
        match recv.try_recv() {
            Ok(result) => result,
            Err(err) => panic!("query not resolved: {err:?}"),
        }
    }

    #[test]
    fn simple_query_round_trip() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, "SELECT 1");
        assert_eq!(output(&mut p), b"Q\0\0\0\x0dSELECT 1\0");

        feed(&mut p, &simple_response("1"));
        let result = resolved(&mut recv).unwrap();
        let QueryResult::Single(set) = result else { panic!("expected one result set") };
        assert_eq!(set.command(), Some("SELECT"));
        assert_eq!(set.row_count(), Some(1));
        assert_eq!(set.rows().len(), 1);
        assert_eq!(set.rows()[0].get("n"), Some(&Value::Int(1)));
        assert!(!p.is_busy());
    }

    #[test]
    fn multiple_result_sets() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, "SELECT 1; SELECT 2");
        output(&mut p);
        feed(&mut p, &[
            Frame::row_description(&[("a", oid::INT4)]),
            Frame::data_row(&[Some("1")]),
            Frame::command_complete("SELECT 1"),
            Frame::row_description(&[("b", oid::TEXT)]),
            Frame::data_row(&[Some("x")]),
            Frame::data_row(&[None]),
            Frame::command_complete("SELECT 2"),
            Frame::ready(b'I'),
        ]);
        let sets = resolved(&mut recv).unwrap().into_result_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].fields()[0].name, "a");
        assert_eq!(sets[1].rows()[1].get(0), Some(&Value::Null));
    }

    #[test]
    fn empty_query() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, "");
        feed(&mut p, &[Frame::empty_query(), Frame::ready(b'I')]);
        let QueryResult::Single(set) = resolved(&mut recv).unwrap() else { panic!() };
        assert_eq!(set.command(), None);
    }

    #[test]
    fn pipelining_order() {
        let mut p = pipeline();
        let mut a = submit(&mut p, "SELECT 'a'");
        let mut b = submit(&mut p, "SELECT 'b'");
        let mut c = submit(&mut p, "SELECT 'c'");

        // only the first query is written until its ReadyForQuery
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");

        feed(&mut p, &simple_response("1")[..3]);
        assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
        feed(&mut p, &[Frame::ready(b'I')]);
        assert!(resolved(&mut a).is_ok());
        assert_eq!(split_frontend(&output(&mut p)), [(b'Q', b"SELECT 'b'\0".to_vec())]);
        assert!(matches!(c.try_recv(), Err(TryRecvError::Empty)));

        feed(&mut p, &simple_response("2"));
        assert!(resolved(&mut b).is_ok());
        assert_eq!(split_frontend(&output(&mut p)), [(b'Q', b"SELECT 'c'\0".to_vec())]);

        feed(&mut p, &simple_response("3"));
        assert!(resolved(&mut c).is_ok());
    }

    #[test]
    fn row_limited_fetch() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, Query::new("SELECT n FROM t").rows(2));
        let mut tags = frontend_tags(&output(&mut p));
        assert_eq!(tags, b"PBDEH");

        feed(&mut p, &[
            Frame::parse_complete(),
            Frame::bind_complete(),
            Frame::row_description(&[("n", oid::INT4)]),
            Frame::data_row(&[Some("1")]),
            Frame::data_row(&[Some("2")]),
            Frame::portal_suspended(),
        ]);
        let written = output(&mut p);
        assert_eq!(split_frontend(&written), [(b'E', b"\0\0\0\0\x02".to_vec()), (b'H', vec![])]);
        tags.extend(frontend_tags(&written));

        feed(&mut p, &[Frame::data_row(&[Some("3")]), Frame::data_row(&[Some("4")]), Frame::portal_suspended()]);
        tags.extend(frontend_tags(&output(&mut p)));

        feed(&mut p, &[Frame::data_row(&[Some("5")])]);
        assert!(output(&mut p).is_empty());
        feed(&mut p, &[Frame::command_complete("SELECT 1")]);
        let written = output(&mut p);
        assert_eq!(frontend_tags(&written), b"S");
        tags.extend(frontend_tags(&written));

        assert_eq!(tags.iter().filter(|t| **t == b'E').count(), 3);
        assert_eq!(tags.iter().filter(|t| **t == b'S').count(), 1);

        feed(&mut p, &[Frame::ready(b'I')]);
        let QueryResult::Single(set) = resolved(&mut recv).unwrap() else { panic!() };
        assert_eq!(set.rows().len(), 5);
        assert_eq!(set.row_count(), Some(5));
        assert_eq!(set.rows()[4].try_get::<_, i32>(0), Ok(5));
    }

    #[test]
    fn error_isolation() {
        let mut p = pipeline();
        let mut a = submit(&mut p, "SELECT 'a'");
        let mut b = submit(&mut p, "SELEC 'b'");
        let mut c = submit(&mut p, "SELECT 'c'");
        output(&mut p);

        feed(&mut p, &simple_response("1"));
        assert!(resolved(&mut a).is_ok());
        output(&mut p);

        feed(&mut p, &[Frame::error(&[(b'S', "ERROR"), (b'C', "42601"), (b'M', "syntax error")])]);
        let err = resolved(&mut b).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Rejected);
        assert_eq!(err.as_database().and_then(|db| db.code()), Some("42601"));

        // C waits for the ReadyForQuery following B's error
        assert!(output(&mut p).is_empty());
        assert!(matches!(c.try_recv(), Err(TryRecvError::Empty)));

        feed(&mut p, &[Frame::ready(b'I')]);
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");
        feed(&mut p, &simple_response("3"));
        assert!(resolved(&mut c).is_ok());
    }

    #[test]
    fn row_limited_error_sends_sync() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, Query::new("SELECT 1/0").rows(10));
        output(&mut p);
        feed(&mut p, &[Frame::parse_complete(), Frame::bind_complete(), Frame::error(&[(b'M', "division by zero")])]);
        assert_eq!(frontend_tags(&output(&mut p)), b"S");
        assert!(resolved(&mut recv).is_err());
        feed(&mut p, &[Frame::ready(b'I')]);
        assert!(output(&mut p).is_empty());
    }

    #[test]
    fn prepared_statement_conflict() {
        let mut p = pipeline();
        let mut first = submit(&mut p, Query::new("SELECT 1").name("s1"));
        assert_eq!(frontend_tags(&output(&mut p)), b"PBDES");

        let mut second = submit(&mut p, Query::new("SELECT 2").name("s1"));
        let err = resolved(&mut second).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::StatementConflict(_)));
        assert_eq!(err.class(), ErrorClass::NotSent);
        assert!(output(&mut p).is_empty());
        assert_eq!(p.statements.get("s1"), Some("SELECT 1"));

        feed(&mut p, &[
            Frame::parse_complete(),
            Frame::bind_complete(),
            Frame::row_description(&[("n", oid::INT4)]),
            Frame::data_row(&[Some("1")]),
            Frame::command_complete("SELECT 1"),
            Frame::ready(b'I'),
        ]);
        assert!(resolved(&mut first).is_ok());

        // same name and text skips Parse
        let _third = submit(&mut p, Query::new("SELECT 1").name("s1"));
        assert_eq!(frontend_tags(&output(&mut p)), b"BDES");
    }

    #[test]
    fn failed_parse_frees_name() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, Query::new("SELEC 1").name("s1"));
        output(&mut p);
        feed(&mut p, &[Frame::error(&[(b'M', "syntax error")]), Frame::ready(b'I')]);
        assert!(resolved(&mut recv).is_err());

        let _next = submit(&mut p, Query::new("SELECT 1").name("s1"));
        assert_eq!(frontend_tags(&output(&mut p)), b"PBDES");
    }

    #[test]
    fn bind_parameters() {
        let mut p = pipeline();
        let _recv = submit(&mut p, Query::new("SELECT $1, $2").bind(7).bind(None::<i64>).binary(true));
        let messages = split_frontend(&output(&mut p));
        let (tag, parse) = &messages[0];
        assert_eq!(*tag, b'P');
        assert_eq!(parse, b"\0SELECT $1, $2\0\0\x02\0\0\0\x17\0\0\0\x14");
        let (tag, bind) = &messages[1];
        assert_eq!(*tag, b'B');
        assert_eq!(bind, b"\0\0\0\x02\0\0\0\0\0\x02\0\0\0\x017\xff\xff\xff\xff\0\x01\0\x01");
    }

    #[test]
    fn invalid_parameter_types() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, Query::new("SELECT $1").bind(1).param_types([oid::INT4, oid::INT4]));
        let err = resolved(&mut recv).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidQuery(_)));
        assert!(output(&mut p).is_empty());
    }

    #[test]
    fn too_many_parameters() {
        let mut p = pipeline();
        let query = (0..=u16::MAX as i32).fold(Query::new("SELECT 1"), Query::bind);
        let mut recv = submit(&mut p, query);
        let err = resolved(&mut recv).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidQuery(InvalidQuery::TooManyParams(65536))));
        assert_eq!(err.class(), ErrorClass::NotSent);
        assert!(output(&mut p).is_empty());

        // the pipeline is unaffected
        let mut recv = submit(&mut p, "SELECT 1");
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");
        feed(&mut p, &simple_response("1"));
        assert!(resolved(&mut recv).is_ok());
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let mut p = pipeline();
        let mut text = submit(&mut p, "SELECT 1\0; DROP TABLE t");
        let mut name = submit(&mut p, Query::new("SELECT 1").name("s\01"));
        let (reply, mut close) = oneshot::channel();
        p.submit(Submission { request: Request::Close("s\01".into()), reply, deadline: None });
        p.dispatch(Instant::now());

        for recv in [&mut text, &mut name, &mut close] {
            let err = resolved(recv).unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::InvalidQuery(InvalidQuery::NulByte(_))));
        }
        assert!(output(&mut p).is_empty());
        assert_eq!(p.statements.get("s\01"), None);
    }

    #[test]
    fn timed_out_cursor_stops_fetching() {
        let mut p = pipeline();
        let now = Instant::now();
        let (reply, mut recv) = oneshot::channel();
        let deadline = Some(now + std::time::Duration::from_secs(1));
        p.submit(Submission { request: Request::Query(Query::new("SELECT n FROM t").rows(2)), reply, deadline });
        p.dispatch(now);
        assert_eq!(frontend_tags(&output(&mut p)), b"PBDEH");

        feed(&mut p, &[
            Frame::parse_complete(),
            Frame::bind_complete(),
            Frame::row_description(&[("n", oid::INT4)]),
            Frame::data_row(&[Some("1")]),
            Frame::data_row(&[Some("2")]),
            Frame::portal_suspended(),
        ]);
        assert_eq!(frontend_tags(&output(&mut p)), b"EH");

        p.expire(now + std::time::Duration::from_secs(2));
        assert!(matches!(resolved(&mut recv).unwrap_err().kind(), ErrorKind::Timeout(t) if t.was_sent()));

        // the in flight batch is drained, then Sync closes the portal
        let mut next = submit(&mut p, "SELECT 2");
        feed(&mut p, &[Frame::data_row(&[Some("3")]), Frame::data_row(&[Some("4")]), Frame::portal_suspended()]);
        assert_eq!(split_frontend(&output(&mut p)), [(b'S', vec![])]);

        feed(&mut p, &[Frame::ready(b'I')]);
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");
        feed(&mut p, &simple_response("2"));
        assert!(resolved(&mut next).is_ok());
    }

    #[test]
    fn close_statement() {
        let mut p = pipeline();
        let _first = submit(&mut p, Query::new("SELECT 1").name("s1"));
        output(&mut p);
        feed(&mut p, &[Frame::parse_complete(), Frame::bind_complete(), Frame::no_data(), Frame::command_complete("SELECT 0"), Frame::ready(b'I')]);

        let (reply, mut recv) = oneshot::channel();
        p.submit(Submission { request: Request::Close("s1".into()), reply, deadline: None });
        p.dispatch(Instant::now());
        assert_eq!(split_frontend(&output(&mut p)), [(b'C', b"Ss1\0".to_vec()), (b'S', vec![])]);
        feed(&mut p, &[Frame::close_complete(), Frame::ready(b'I')]);
        assert!(resolved(&mut recv).is_ok());
        assert_eq!(p.statements.get("s1"), None);
    }

    #[test]
    fn timeouts() {
        let mut p = pipeline();
        let now = Instant::now();
        let deadline = Some(now + std::time::Duration::from_secs(1));

        let (reply, mut active) = oneshot::channel();
        p.submit(Submission { request: Request::Query("SELECT pg_sleep(10)".into()), reply, deadline });
        let (reply, mut queued) = oneshot::channel();
        p.submit(Submission { request: Request::Query(Query::new("SELECT 1").name("s1")), reply, deadline });
        p.dispatch(now);
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");
        assert_eq!(p.next_deadline(), deadline);

        let later = now + std::time::Duration::from_secs(2);
        p.expire(later);
        let err = resolved(&mut active).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(t) if t.was_sent()));
        assert_eq!(err.class(), ErrorClass::ConnectionLost);
        let err = resolved(&mut queued).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(t) if !t.was_sent()));
        assert_eq!(err.class(), ErrorClass::NotSent);
        assert_eq!(p.statements.get("s1"), None);
        assert_eq!(p.next_deadline(), None);

        // the timed out query is still drained
        let mut next = submit(&mut p, "SELECT 2");
        assert!(output(&mut p).is_empty());
        feed(&mut p, &simple_response("0"));
        assert_eq!(frontend_tags(&output(&mut p)), b"Q");
        feed(&mut p, &simple_response("2"));
        assert!(resolved(&mut next).is_ok());
    }

    #[test]
    fn close_fails_everything() {
        let mut p = pipeline();
        let mut active = submit(&mut p, "SELECT 1");
        let mut queued = submit(&mut p, "SELECT 2");

        let cause = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        p.close(Some(cause));

        let ErrorKind::Closed(closed) = resolved(&mut active).unwrap_err().into_kind() else { panic!() };
        assert!(closed.was_sent());
        assert!(matches!(closed.cause().map(Error::kind), Some(ErrorKind::Io(_))));
        let err = resolved(&mut queued).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotSent);
    }

    #[test]
    fn copy_in_is_refused() {
        let mut p = pipeline();
        let mut recv = submit(&mut p, "COPY t FROM STDIN");
        output(&mut p);
        feed(&mut p, &[Frame::copy_in(1)]);
        let written = split_frontend(&output(&mut p));
        assert_eq!(written, [(b'f', b"COPY FROM STDIN is not supported\0".to_vec())]);
        feed(&mut p, &[Frame::error(&[(b'M', "COPY from stdin failed")]), Frame::ready(b'I')]);
        assert!(resolved(&mut recv).is_err());
    }

    #[test]
    fn asynchronous_messages() {
        let mut p = pipeline();
        let (tx, mut rx) = mpsc::unbounded_channel();
        p.subscribe(tx);

        feed(&mut p, &[
            Frame::notice(&[(b'S', "NOTICE"), (b'M', "relation exists, skipping")]),
            Frame::notification(9, "jobs", "42"),
            Frame::parameter_status("TimeZone", "UTC"),
        ]);

        let Ok(Event::Notice(notice)) = rx.try_recv() else { panic!() };
        assert_eq!(notice.message(), Some("relation exists, skipping"));
        let Ok(Event::Notification { process_id, channel, payload }) = rx.try_recv() else { panic!() };
        assert_eq!((process_id, channel.as_str(), payload.as_str()), (9, "jobs", "42"));
        assert!(matches!(rx.try_recv(), Ok(Event::Parameter { .. })));
        assert_eq!(p.shared.parameter("TimeZone").as_deref(), Some("UTC"));
    }

    #[test]
    fn transaction_status() {
        let mut p = pipeline();
        let _recv = submit(&mut p, "BEGIN");
        feed(&mut p, &[Frame::command_complete("BEGIN"), Frame::ready(b'T')]);
        assert_eq!(p.shared.transaction_status(), TransactionStatus::InTransaction);
    }

    #[test]
    fn fatal_messages() {
        let mut p = pipeline();
        let (msgtype, body) = Frame::error(&[(b'S', "FATAL"), (b'M', "terminating connection")]).into_parts();
        let err = p.handle(BackendMessage::decode(msgtype, body).unwrap()).unwrap_err();
        assert!(err.as_database().is_some_and(|db| db.is_fatal()));
        assert_eq!(err.class(), ErrorClass::ConnectionLost);

        let err = p.handle(BackendMessage::decode(b'D', Bytes::from_static(b"\0\0")).unwrap()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));

        let (msgtype, body) = Frame::new(b'!').u8(1).into_parts();
        p.handle(BackendMessage::decode(msgtype, body).unwrap()).unwrap();
    }
}
