use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{CourtdAuthSource, Credentials, Role};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct CourtdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CourtdQueryParser>,
}

impl CourtdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CourtdQueryParser),
        }
    }

    fn resolve_role<C: ClientInfo>(&self, client: &C) -> PgWireResult<Role> {
        client
            .metadata()
            .get("user")
            .and_then(|user| Role::from_user(user))
            .ok_or_else(|| user_error("28000", "session has no known role".into()))
    }

    /// Parse, authorize, execute and record one statement.
    async fn run(&self, role: Role, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        if !role.permits(&cmd) {
            return Err(user_error(
                "42501",
                format!("permission denied: {} may not run {}", role.as_str(), observability::command_label(&cmd)),
            ));
        }

        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SelectAvailability(req) => {
                let availability = engine.availability(&req).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let court_id = i64::from(availability.court_id);
                let date = availability.date.to_string();
                let mut slots: Vec<(Hour, bool)> = availability
                    .available
                    .iter()
                    .map(|h| (*h, false))
                    .chain(availability.booked.iter().map(|h| (*h, true)))
                    .collect();
                slots.sort_unstable();

                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|(hour, booked)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court_id)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&i64::from(hour))?;
                        encoder.encode_field(&booked)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking(req) => {
                let receipt = engine.create_booking(&req).await.map_err(engine_err)?;
                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.booking_id)?;
                encoder.encode_field(&receipt.total_price)?;
                encoder.encode_field(&receipt.token.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookingByToken { token } => {
                let view = engine.find_by_token(&token).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = vec![encode_booking(&schema, &view, None)];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::CheckIn { token } => {
                let check_in = engine.check_in(&token).await.map_err(engine_err)?;
                let schema = Arc::new(check_in_schema());
                let rows = vec![encode_booking(
                    &schema,
                    &check_in.booking,
                    Some((check_in.checked_in, check_in.already_used)),
                )];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings(filter) => {
                let listing = engine.list_bookings(&filter).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows: Vec<PgWireResult<DataRow>> = listing
                    .bookings
                    .iter()
                    .map(|view| encode_booking(&schema, view, None))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCourts { id } => {
                let courts = match id {
                    Some(id) => vec![engine.get_court(id).await.map_err(engine_err)?],
                    None => engine.list_courts().await.map_err(engine_err)?,
                };
                court_response(&courts)
            }
            Command::InsertCourt { id, name } => {
                let court = engine.create_court(id, &name).await.map_err(engine_err)?;
                court_response(&[court])
            }
            Command::UpdateCourt { id, name } => {
                let court = engine.rename_court(id, &name).await.map_err(engine_err)?;
                court_response(&[court])
            }
            Command::DeleteCourt { id } => {
                let court = engine.delete_court(id).await.map_err(engine_err)?;
                court_response(&[court])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("court_id", Type::INT8),
        field("date", Type::VARCHAR),
        field("hour", Type::INT8),
        field("booked", Type::BOOL),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::INT8),
        field("total_price", Type::INT8),
        field("token", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("court_id", Type::INT8),
        field("court_name", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_hour", Type::INT8),
        field("end_hour", Type::INT8),
        field("people_count", Type::INT8),
        field("total_price", Type::INT8),
        field("token", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("used_at", Type::VARCHAR),
    ]
}

fn check_in_schema() -> Vec<FieldInfo> {
    let mut fields = vec![field("checked_in", Type::BOOL), field("already_used", Type::BOOL)];
    fields.extend(booking_schema());
    fields
}

fn court_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::INT8), field("name", Type::VARCHAR)]
}

/// Result columns for a statement, decided from its text alone so that
/// Describe works before parameters are bound.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let verb = upper.split_whitespace().next().unwrap_or("");
    if upper.contains("AVAILABILITY") && verb == "SELECT" {
        availability_schema()
    } else if upper.contains("BOOKINGS") {
        match verb {
            "INSERT" => receipt_schema(),
            "UPDATE" => check_in_schema(),
            "SELECT" => booking_schema(),
            _ => vec![],
        }
    } else if upper.contains("COURTS") {
        court_schema()
    } else {
        vec![]
    }
}

fn timestamp(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    view: &BookingView,
    check_in: Option<(bool, bool)>,
) -> PgWireResult<DataRow> {
    let b = &view.booking;
    let mut encoder = DataRowEncoder::new(schema.clone());
    if let Some((checked_in, already_used)) = check_in {
        encoder.encode_field(&checked_in)?;
        encoder.encode_field(&already_used)?;
    }
    encoder.encode_field(&b.id)?;
    encoder.encode_field(&i64::from(b.court_id))?;
    encoder.encode_field(&view.court_name)?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&i64::from(b.hours.start))?;
    encoder.encode_field(&i64::from(b.hours.end))?;
    encoder.encode_field(&i64::from(b.people_count))?;
    encoder.encode_field(&b.total_price)?;
    encoder.encode_field(&b.token.to_string())?;
    encoder.encode_field(&b.state().as_str().to_string())?;
    encoder.encode_field(&timestamp(b.created_at))?;
    encoder.encode_field(&b.used_at.map(timestamp))?;
    Ok(encoder.take_row())
}

fn court_response(courts: &[Court]) -> PgWireResult<Response> {
    let schema = Arc::new(court_schema());
    let rows: Vec<PgWireResult<DataRow>> = courts
        .iter()
        .map(|court| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&i64::from(court.id))?;
            encoder.encode_field(&court.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for CourtdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let role = self.resolve_role(client)?;
        Ok(vec![self.run(role, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtdQueryParser;

#[async_trait]
impl QueryParser for CourtdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtdHandler {
    type Statement = String;
    type QueryParser = CourtdQueryParser;

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
        let role = self.resolve_role(client)?;
        let sql = substitute_params(portal);
        self.run(role, &sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)` in source order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => {
                // A doubled quote is an escaped quote, not the end of the literal.
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start + 1..end].parse::<usize>() {
                    found.push((start..end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in one pass,
/// so bound values are never rescanned.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[last..span.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        last = span.end;
    }
    result.push_str(&sql[last..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtdFactory {
    handler: Arc<CourtdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CourtdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtdFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = CourtdAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtdFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CourtdFactory::new(engine, credentials);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation { .. } | EngineError::LimitExceeded(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::CourtInUse { .. } => "23503",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::CourtNotFound(_) | EngineError::TokenNotFound(_) => "P0002",
        EngineError::Storage(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Storage(_) = e {
        tracing::error!("storage failure: {e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
