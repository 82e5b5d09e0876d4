use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use tokio::net::TcpStream;

use crate::auth::ParkdAuthSource;
use crate::engine::Engine;
use crate::model::lot_key;
use crate::observability;
use crate::sql::{self, Command};

pub struct ParkdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::ProvisionLot {
                name,
                capacity,
                rate_per_hour,
            } => {
                self.engine
                    .provision_lot(&name, capacity, rate_per_hour)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Book {
                lot,
                requester,
                span,
            } => {
                let ticket = self
                    .engine
                    .book(&lot, requester, span)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(ticket_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(ticket.slot as i32))?;
                encoder.encode_field(&ticket.booking_id.to_string())?;
                let row = encoder.take_row();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::FreeSlot { lot, slot } => {
                self.engine.free_slot(&lot, slot).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectLots => {
                let lots = self.engine.list_lots().await;
                let schema = Arc::new(lots_schema());
                let rows: Vec<PgWireResult<_>> = lots
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.key)?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&(info.capacity as i32))?;
                        encoder.encode_field(&(info.rate_per_hour as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { lot } => {
                let slots = self.engine.list_slots(&lot).await.map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(info.number as i32))?;
                        encoder.encode_field(&info.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { account } => {
                let bookings = self.engine.bookings_for_requester(&account).await;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.lot)?;
                        encoder.encode_field(&(info.slot as i32))?;
                        encoder.encode_field(&info.plate)?;
                        encoder.encode_field(&info.start)?;
                        encoder.encode_field(&info.end)?;
                        encoder.encode_field(&info.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                lot,
                start,
                end,
                min_duration,
            } => {
                let windows = self
                    .engine
                    .lot_availability(&lot, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let key = lot_key(&lot);
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&key)?;
                        encoder.encode_field(&w.start)?;
                        encoder.encode_field(&w.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let key = channel.strip_prefix("lot_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected lot_{{key}})"),
                    )))
                })?;
                if self.engine.get_lot(key).is_none() {
                    return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("unknown lot in channel: {key}"),
                    ))));
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

fn ticket_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("slot".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new(
            "booking_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
    ]
}

fn lots_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("lot".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("rate".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("slot".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("lot".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("slot".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("plate".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "created_at".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("lot".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Result schema guess for Describe, from the raw SQL text. Checked in
/// order because "SLOTS" and "LOTS" overlap as substrings.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("INSERT") && upper.contains("BOOKINGS") {
        ticket_schema()
    } else if upper.contains("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("SELECT") && upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SELECT") && upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("SELECT") && upper.contains("LOTS") {
        lots_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(cmd).await?;
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
            schema_for_sql(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
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

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ParkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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

/// Drive one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ParkdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
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
