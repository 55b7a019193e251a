use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream;
use futures::{Sink, StreamExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::UsherAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct UsherHandler {
    tenant_manager: Arc<TenantManager>,
    session: Arc<Session>,
    query_parser: Arc<UsherQueryParser>,
}

impl UsherHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, session: Arc<Session>) -> Self {
        Self {
            tenant_manager,
            session,
            query_parser: Arc::new(UsherQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSeats { room_id, schedule_id, seats } => {
                let count = engine
                    .create_seats(room_id, schedule_id, seats)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::InsertHold { room_id, schedule_id, seat_id, holder_id } => {
                let key = SeatKey::new(room_id, schedule_id, seat_id);
                engine.select_seat(key, &holder_id).map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteHold { room_id, schedule_id, seat_id, holder_id } => {
                let key = SeatKey::new(room_id, schedule_id, seat_id);
                // A no-op release reports zero rows, never an error.
                let released = engine.release_seat(key, &holder_id).map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(released)),
                )])
            }
            Command::InsertBooking { booking } => {
                engine.commit_booking(booking).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdatePayment { booking_id, payment_id, status } => {
                engine
                    .finalize_payment(booking_id, &payment_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectSeats { room_id, schedule_id } => {
                let seats = engine
                    .seat_map(room_id, schedule_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(seats_schema());
                let rows: Vec<PgWireResult<_>> = seats
                    .into_iter()
                    .map(|seat| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&seat.seat_id)?;
                        encoder.encode_field(&seat.price)?;
                        encoder.encode_field(&seat.status.as_str())?;
                        encoder.encode_field(&seat.holder_id)?;
                        encoder.encode_field(&seat.booking_id.map(|id| id.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectHolds { room_id, schedule_id } => {
                let holds = engine.list_holds(&ShowtimeKey { room_id, schedule_id });

                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<_>> = holds
                    .into_iter()
                    .map(|hold| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&hold.seat_id)?;
                        encoder.encode_field(&hold.holder_id)?;
                        encoder.encode_field(&hold.created_at)?;
                        encoder.encode_field(&hold.age_ms)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBooking { id } => {
                let schema = Arc::new(bookings_schema());
                // Unknown id yields an empty result set, as SELECT should.
                let rows: Vec<PgWireResult<_>> = engine
                    .get_booking(&id)
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.code)?;
                        encoder.encode_field(&b.purchaser)?;
                        encoder.encode_field(&b.room_id.to_string())?;
                        encoder.encode_field(&b.schedule_id.to_string())?;
                        let seats: Vec<&str> =
                            b.seats.iter().map(|s| s.seat_id.as_str()).collect();
                        encoder.encode_field(&seats.join(","))?;
                        let food: Vec<String> = b
                            .food
                            .iter()
                            .map(|f| format!("{}:{}:{}", f.name, f.qty, f.unit_price))
                            .collect();
                        encoder.encode_field(&food.join(","))?;
                        encoder.encode_field(&b.total)?;
                        encoder.encode_field(&b.payment.status.as_str())?;
                        encoder.encode_field(&b.payment.payment_id)?;
                        encoder.encode_field(&b.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectShowtimes => {
                let shows = engine.list_showtimes().await;

                let schema = Arc::new(showtimes_schema());
                let rows: Vec<PgWireResult<_>> = shows
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.room_id.to_string())?;
                        encoder.encode_field(&s.schedule_id.to_string())?;
                        encoder.encode_field(&(s.seats as i64))?;
                        encoder.encode_field(&(s.available as i64))?;
                        encoder.encode_field(&(s.held as i64))?;
                        encoder.encode_field(&(s.booked as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                parse_topic(&channel).map_err(channel_err)?;
                self.session.subscribe(&channel, &engine.notify);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.session.unsubscribe(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.session.unsubscribe_all();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Shape check for `seats/{roomId}/{scheduleId}` channels.
fn parse_topic(channel: &str) -> Result<(), String> {
    let rest = channel.strip_prefix("seats/").ok_or_else(|| {
        format!("invalid channel: {channel} (expected seats/{{roomId}}/{{scheduleId}})")
    })?;
    let (room, schedule) = rest.split_once('/').ok_or_else(|| {
        format!("invalid channel: {channel} (expected seats/{{roomId}}/{{scheduleId}})")
    })?;
    Ulid::from_string(room).map_err(|e| format!("bad room ULID in channel: {e}"))?;
    Ulid::from_string(schedule).map_err(|e| format!("bad schedule ULID in channel: {e}"))?;
    Ok(())
}

fn seats_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("seat_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("price".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("holder_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("booking_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("seat_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("holder_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("age_ms".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("code".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("purchaser".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("schedule_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("seats".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("food".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("total".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("payment_status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("payment_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn showtimes_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("schedule_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("seats".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("available".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("held".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("booked".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn result_schema_for(sql: &str) -> Option<Vec<FieldInfo>> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return None;
    }
    if upper.contains("FROM SEATS") {
        Some(seats_schema())
    } else if upper.contains("FROM HOLDS") {
        Some(holds_schema())
    } else if upper.contains("FROM BOOKINGS") {
        Some(bookings_schema())
    } else if upper.contains("FROM SHOWTIMES") {
        Some(showtimes_schema())
    } else {
        None
    }
}

#[async_trait]
impl SimpleQueryHandler for UsherHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct UsherQueryParser;

#[async_trait]
impl QueryParser for UsherQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema_for(stmt).unwrap_or_default())
    }
}

#[async_trait]
impl ExtendedQueryHandler for UsherHandler {
    type Statement = String;
    type QueryParser = UsherQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let fields = result_schema_for(&target.statement).unwrap_or_default();
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = result_schema_for(&target.statement.statement).unwrap_or_default();
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Per-connection subscriptions ─────────────────────────────────

/// LISTEN state for one connection. Forwarder tasks copy hub broadcasts
/// into the relay's notification queue; the relay turns them into
/// NotificationResponse frames.
pub struct Session {
    notif_tx: mpsc::UnboundedSender<(String, String)>,
    subs: DashMap<String, JoinHandle<()>>,
}

impl Session {
    fn new(notif_tx: mpsc::UnboundedSender<(String, String)>) -> Self {
        Self {
            notif_tx,
            subs: DashMap::new(),
        }
    }

    fn subscribe(&self, channel: &str, hub: &NotifyHub) {
        use dashmap::mapref::entry::Entry;
        match self.subs.entry(channel.to_string()) {
            // LISTEN on a subscribed channel is a no-op, per Postgres.
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                let mut rx = hub.subscribe(channel);
                let tx = self.notif_tx.clone();
                let chan = channel.to_string();
                slot.insert(tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(update) => {
                                let Ok(payload) = serde_json::to_string(&update) else {
                                    continue;
                                };
                                if tx.send((chan.clone(), payload)).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("listener on {chan} lagged, dropped {n} updates");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
        }
    }

    fn unsubscribe(&self, channel: &str) {
        if let Some((_, handle)) = self.subs.remove(channel) {
            handle.abort();
        }
    }

    fn unsubscribe_all(&self) {
        self.subs.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct UsherFactory {
    handler: Arc<UsherHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<UsherAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl UsherFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        session: Arc<Session>,
    ) -> Self {
        let auth_source = UsherAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(UsherHandler::new(tenant_manager, session)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for UsherFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Connection relay ─────────────────────────────────────────────
//
// pgwire's connection loop owns its socket, which leaves no way to push
// NotificationResponse frames from a sweep or another session's commit.
// Each client connection is therefore spliced through a loopback pair:
// pgwire speaks the protocol on the far end while the relay owns the
// client socket and injects 'A' frames between backend messages.

const SSL_REQUEST_CODE: u32 = 80877103;
const GSSENC_REQUEST_CODE: u32 = 80877104;
const CANCEL_REQUEST_CODE: u32 = 80877102;
const MAX_STARTUP_LEN: usize = 16 * 1024;

pub async fn process_connection(
    mut socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let Some((code, frame)) = read_startup_frame(&mut socket).await? else {
        return Ok(());
    };

    match code {
        // No cancel-key bookkeeping; a cancel connection has nothing to do.
        CANCEL_REQUEST_CODE => Ok(()),
        SSL_REQUEST_CODE => match tls {
            Some(acceptor) => {
                socket.write_all(b"S").await?;
                let mut tls_stream = acceptor.accept(socket).await?;
                match read_startup_frame(&mut tls_stream).await? {
                    Some((CANCEL_REQUEST_CODE, _)) | None => Ok(()),
                    Some((_, frame)) => serve(tls_stream, frame, tenant_manager, password).await,
                }
            }
            None => {
                socket.write_all(b"N").await?;
                match read_startup_frame(&mut socket).await? {
                    Some((CANCEL_REQUEST_CODE, _)) | None => Ok(()),
                    Some((_, frame)) => serve(socket, frame, tenant_manager, password).await,
                }
            }
        },
        GSSENC_REQUEST_CODE => {
            socket.write_all(b"N").await?;
            match read_startup_frame(&mut socket).await? {
                Some((CANCEL_REQUEST_CODE, _)) | None => Ok(()),
                Some((_, frame)) => serve(socket, frame, tenant_manager, password).await,
            }
        }
        _ => serve(socket, frame, tenant_manager, password).await,
    }
}

/// Read one startup-family message: `[len:u32][code:u32][rest]`, no type
/// byte. Returns the request code and the whole frame for forwarding.
async fn read_startup_frame<S>(stream: &mut S) -> io::Result<Option<(u32, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(8..=MAX_STARTUP_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad startup length: {len}"),
        ));
    }
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&len_buf);
    stream.read_exact(&mut frame[4..]).await?;
    let code = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    Ok(Some((code, frame)))
}

async fn serve<S>(
    stream: S,
    startup: Vec<u8>,
    tenant_manager: Arc<TenantManager>,
    password: String,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(notif_tx));

    let (pg_side, relay_side) = loopback_pair().await?;

    let factory = UsherFactory::new(tenant_manager, password, session.clone());
    let pg_task = tokio::spawn(async move {
        if let Err(e) = pgwire::tokio::process_socket(pg_side, None, factory).await {
            debug!("backend loop ended: {e}");
        }
    });

    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let (pg_read, mut pg_write) = relay_side.into_split();

    let client_to_pg = async {
        pg_write.write_all(&startup).await?;
        tokio::io::copy(&mut client_read, &mut pg_write).await?;
        pg_write.shutdown().await
    };

    let pg_to_client = async {
        let mut frames = FramedRead::new(pg_read, BackendFrameCodec);
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        client_write.write_all(&frame).await?;
                        client_write.flush().await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                notif = notif_rx.recv() => {
                    // The session keeps a sender alive for the whole relay,
                    // so recv only yields real notifications.
                    if let Some((channel, payload)) = notif {
                        let frame = encode_notification(&channel, &payload);
                        client_write.write_all(&frame).await?;
                        client_write.flush().await?;
                    }
                }
            }
        }
        client_write.shutdown().await
    };

    tokio::pin!(client_to_pg, pg_to_client);
    let result = tokio::select! {
        r = &mut client_to_pg => r,
        r = &mut pg_to_client => r,
    };

    session.unsubscribe_all();
    pg_task.abort();
    result
}

/// Socket pair backing one relayed session: `pg_side` goes to pgwire, the
/// other end stays with the relay. The listener lives for exactly one
/// accept, and a foreign connection racing to the ephemeral port fails the
/// peer address check instead of getting spliced into the session.
async fn loopback_pair() -> io::Result<(TcpStream, TcpStream)> {
    let loopback = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = loopback.local_addr()?;
    let (connect, accept) = tokio::join!(TcpStream::connect(addr), loopback.accept());
    let relay_side = connect?;
    let (pg_side, peer) = accept?;
    if peer != relay_side.local_addr()? {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "loopback accept from foreign peer",
        ));
    }
    Ok((pg_side, relay_side))
}

/// Splits the backend byte stream into whole `[type:u8][len:u32][body]`
/// messages so notifications are never injected mid-frame.
struct BackendFrameCodec;

impl Decoder for BackendFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad backend frame length: {len}"),
            ));
        }
        let total = len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

/// Hand-encoded NotificationResponse: 'A', length, sender pid (0 here,
/// updates have no originating backend), then channel and payload as
/// C strings.
fn encode_notification(channel: &str, payload: &str) -> Bytes {
    let body_len = 4 + 4 + channel.len() + 1 + payload.len() + 1;
    let mut buf = BytesMut::with_capacity(1 + body_len);
    buf.put_u8(b'A');
    buf.put_u32(body_len as u32);
    buf.put_i32(0);
    buf.put_slice(channel.as_bytes());
    buf.put_u8(0);
    buf.put_slice(payload.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn channel_err(msg: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42000".into(), msg)))
}
