use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;

use crate::engine::{expand_dates, Engine, EngineError};
use crate::limits::MAX_QUERY_SPAN_DAYS;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CurlbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Auth ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CurlbookAuthSource {
    password: String,
}

impl CurlbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CurlbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct CurlbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CurlbookQueryParser>,
}

impl CurlbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CurlbookQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertArea { area } => {
                if engine.get_area(area.id).await.is_some() {
                    engine.update_area(area).await.map_err(engine_err)?;
                } else {
                    engine.create_area(area).await.map_err(engine_err)?;
                }
                Ok(vec![inserted(1)])
            }
            Command::DeleteArea { id } => {
                engine.delete_area(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::UpsertAvailability { availability } => {
                if engine.availability_area(availability.id).is_some() {
                    engine.update_availability(availability).await.map_err(engine_err)?;
                } else {
                    engine.add_availability(availability).await.map_err(engine_err)?;
                }
                Ok(vec![inserted(1)])
            }
            Command::DeleteAvailability { id } => {
                engine.remove_availability(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::UpsertBooking { id, date, template } => {
                if engine.get_booking(id).is_some() {
                    engine.update_booking(id, template, date).await.map_err(engine_err)?;
                } else {
                    engine.create_booking(id, template, date).await.map_err(engine_err)?;
                }
                Ok(vec![inserted(1)])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::UpsertPattern { id, template, rule } => {
                let batch = if engine.get_pattern(id).is_some() {
                    engine.update_recurring_pattern(id, template, rule).await
                } else {
                    engine.create_recurring_bookings(id, template, rule).await
                }
                .map_err(engine_err)?;
                Ok(vec![inserted(batch.bookings.len())])
            }
            Command::DeletePattern { id } => {
                let count = engine.delete_recurring_pattern(id).await.map_err(engine_err)?;
                Ok(vec![deleted(count)])
            }
            Command::SelectAreas => {
                let schema = Arc::new(areas_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_areas()
                    .await
                    .into_iter()
                    .map(|area| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&area.id.to_string())?;
                        encoder.encode_field(&area.name)?;
                        encoder.encode_field(&area.base_price)?;
                        encoder.encode_field(&area.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailabilities { area_id } => {
                let windows = engine.get_availabilities(area_id).await.map_err(engine_err)?;
                let schema = Arc::new(availabilities_schema());
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|a| {
                        let (day, date) = match a.window {
                            AvailabilityWindow::Weekly(w) => (Some(w.to_string()), None),
                            AvailabilityWindow::OnDate(d) => (None, Some(d.to_string())),
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.area_id.to_string())?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&time_text(a.range.start))?;
                        encoder.encode_field(&time_text(a.range.end))?;
                        encoder.encode_field(&a.is_available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { area_id, from, to } => {
                let (from, to) = self.booking_window(from, to);
                let bookings = engine.get_bookings(area_id, from, to).await.map_err(engine_err)?;
                self.bookings_response(bookings).await
            }
            Command::SelectPatternBookings { pattern_id } => {
                let bookings = engine.get_pattern_bookings(pattern_id).map_err(engine_err)?;
                self.bookings_response(bookings).await
            }
            Command::SelectBookable {
                area_ids,
                date,
                range,
                exclude,
            } => {
                let verdict = engine.check_booking(&area_ids, date, &range, exclude).await;
                let schema = Arc::new(bookable_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&verdict.is_ok())?;
                encoder.encode_field(&verdict.err().map(|e| e.to_string()))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRecurrence { rule } => {
                let dates = expand_dates(&rule).map_err(engine_err)?;
                let schema = Arc::new(recurrence_schema());
                let rows: Vec<PgWireResult<_>> = dates
                    .into_iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date.to_string())?;
                        encoder.encode_field(&date.weekday().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }

    /// Fill in a missing end of a booking date filter. With neither end given
    /// the window starts today.
    fn booking_window(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
        let span = chrono::Days::new(MAX_QUERY_SPAN_DAYS as u64);
        match (from, to) {
            (Some(from), Some(to)) => (from, to),
            (Some(from), None) => (from, from.checked_add_days(span).unwrap_or(NaiveDate::MAX)),
            (None, Some(to)) => (to.checked_sub_days(span).unwrap_or(NaiveDate::MIN), to),
            (None, None) => {
                let today = DateTime::from_timestamp_millis(self.engine.now_ms())
                    .map(|dt| dt.date_naive())
                    .unwrap_or_default();
                (today, today.checked_add_days(span).unwrap_or(NaiveDate::MAX))
            }
        }
    }

    async fn bookings_response(&self, bookings: Vec<Booking>) -> PgWireResult<Vec<Response>> {
        let schema = Arc::new(bookings_schema());
        let mut rows: Vec<PgWireResult<_>> = Vec::with_capacity(bookings.len());
        for b in bookings {
            let price = self.engine.booking_price(b.id).await.map_err(engine_err)?;
            let is_primary = b
                .recurring_pattern_id
                .and_then(|pid| self.engine.get_pattern(pid))
                .is_some_and(|p| p.primary_booking_id == b.id);
            let area_ids = b
                .areas
                .iter()
                .map(|a| match a.custom_price {
                    Some(cents) => format!("{}:{cents}", a.area_id),
                    None => a.area_id.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");

            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&time_text(b.range.start))?;
            encoder.encode_field(&time_text(b.range.end))?;
            encoder.encode_field(&b.event_type.as_str().to_string())?;
            encoder.encode_field(&b.event_type.color().to_string())?;
            encoder.encode_field(&b.payment_status.as_str().to_string())?;
            encoder.encode_field(&area_ids)?;
            encoder.encode_field(&price)?;
            encoder.encode_field(&b.recurring_pattern_id.map(|p| p.to_string()))?;
            encoder.encode_field(&is_primary)?;
            encoder.encode_field(&b.created_at)?;
            rows.push(Ok(encoder.take_row()));
        }
        Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn time_text(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn areas_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("base_price".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn availabilities_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("area_id"),
        text_field("day_of_week"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        FieldInfo::new("is_available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("event_type"),
        text_field("color"),
        text_field("payment_status"),
        text_field("area_ids"),
        FieldInfo::new("price".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("pattern_id"),
        FieldInfo::new("is_primary".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn bookable_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("bookable".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("reason"),
    ]
}

fn recurrence_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), text_field("weekday")]
}

/// Result columns for a statement, chosen by the table it selects from.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("areas") => areas_schema(),
        Some("availabilities") => availabilities_schema(),
        Some("bookings") => bookings_schema(),
        Some("bookable") => bookable_schema(),
        Some("recurrence") => recurrence_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CurlbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CurlbookQueryParser;

#[async_trait]
impl QueryParser for CurlbookQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CurlbookHandler {
    type Statement = String;
    type QueryParser = CurlbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
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
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
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

// ── Factory ──────────────────────────────────────────────────────

pub struct CurlbookFactory {
    handler: Arc<CurlbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CurlbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CurlbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CurlbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CurlbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CurlbookFactory {
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

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
