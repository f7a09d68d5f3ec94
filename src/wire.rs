use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use ulid::Ulid;

use crate::auth::RentdAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape};
use crate::tenant::TenantManager;

pub struct RentdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RentdQueryParser),
        }
    }

    /// One marketplace per database name.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// The acting user is the connection's user name, read as a ULID.
    /// `None` for connections that only register users.
    fn resolve_caller<C: ClientInfo>(client: &C) -> Option<Ulid> {
        client
            .metadata()
            .get("user")
            .and_then(|name| Ulid::from_string(name).ok())
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let caller = Self::resolve_caller(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, caller, cmd).await;
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, name, email } => {
                engine
                    .register_user(id, name, email)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertItem {
                id,
                name,
                description,
                available,
            } => {
                let owner_id = require_caller(caller)?;
                engine
                    .list_item(id, owner_id, name, description, available)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking {
                item_id,
                start,
                end,
            } => {
                let renter_id = require_caller(caller)?;
                let booking = engine
                    .create_booking(renter_id, item_id, start, end)
                    .await
                    .map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::DeleteBooking { id } => {
                let renter_id = require_caller(caller)?;
                let booking = engine
                    .delete_booking(id, renter_id)
                    .await
                    .map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::ApproveBooking {
                booking_id,
                approved,
            } => {
                let owner_id = require_caller(caller)?;
                let booking = engine
                    .set_approval(booking_id, owner_id, approved)
                    .await
                    .map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::SelectBooking { id } => {
                let user_id = require_caller(caller)?;
                let booking = engine.get_booking(id, user_id).map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::SelectBookings {
                perspective,
                state,
                from,
                size,
            } => {
                let user_id = require_caller(caller)?;
                let bookings = engine
                    .list_bookings(user_id, perspective, &state, from, size)
                    .map_err(engine_err)?;
                booking_rows(bookings)
            }
            Command::InsertComment { item_id, text } => {
                let author_id = require_caller(caller)?;
                let comment = engine
                    .add_comment(author_id, item_id, text)
                    .await
                    .map_err(engine_err)?;
                comment_rows(vec![comment])
            }
            Command::SelectComments { item_id } => {
                let comments = engine.list_comments(item_id).map_err(engine_err)?;
                comment_rows(comments)
            }
            Command::SelectItem { id } => {
                let viewer_id = require_caller(caller)?;
                let view = engine.view_item(id, viewer_id).map_err(engine_err)?;
                item_rows(vec![view])
            }
            Command::SelectItems { from, size } => {
                let owner_id = require_caller(caller)?;
                let views = engine
                    .list_items(owner_id, from, size)
                    .map_err(engine_err)?;
                item_rows(views)
            }
        }
    }
}

fn require_caller(caller: Option<Ulid>) -> PgWireResult<Ulid> {
    caller.ok_or_else(|| user_error("28000", "connect with your user id (a ULID) as user name"))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("item_id"),
        text_field("renter_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
    ]
}

fn comment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("item_id"),
        text_field("author_id"),
        text_field("text"),
        int8_field("created_at"),
    ]
}

fn item_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("owner_id"),
        text_field("name"),
        text_field("description"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("last_booking_id"),
        text_field("next_booking_id"),
        int8_field("comment_count"),
    ]
}

/// Row shape of a statement whose parameters may still be unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let sql = rewrite_placeholders(sql, |_| "NULL".to_string());
    match sql::row_shape(&sql) {
        RowShape::Booking => booking_schema(),
        RowShape::Comment => comment_schema(),
        RowShape::Item => item_schema(),
        RowShape::Tag => vec![],
    }
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.item_id.to_string())?;
            encoder.encode_field(&b.renter_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn comment_rows(comments: Vec<Comment>) -> PgWireResult<Response> {
    let schema = Arc::new(comment_schema());
    let rows: Vec<PgWireResult<_>> = comments
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.item_id.to_string())?;
            encoder.encode_field(&c.author_id.to_string())?;
            encoder.encode_field(&c.text)?;
            encoder.encode_field(&c.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn item_rows(views: Vec<ItemView>) -> PgWireResult<Response> {
    let schema = Arc::new(item_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|view| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&view.item.id.to_string())?;
            encoder.encode_field(&view.item.owner_id.to_string())?;
            encoder.encode_field(&view.item.name)?;
            encoder.encode_field(&view.item.description)?;
            encoder.encode_field(&view.item.available)?;
            encoder.encode_field(&view.last_booking.map(|b| b.id.to_string()))?;
            encoder.encode_field(&view.next_booking.map(|b| b.id.to_string()))?;
            encoder.encode_field(&(view.comments.len() as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Rewrite every `$N` placeholder with `bind(N)` in one pass. Text inside
/// `'...'` literals and `"..."` identifiers is copied unchanged, and bound
/// values are never rescanned.
fn rewrite_placeholders(sql: &str, mut bind: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            // A doubled quote closes and reopens, which copies it intact.
            if c == q {
                quote = None;
            }
            out.push(c);
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                match sql[i + 1..end].parse::<usize>() {
                    Ok(n) => out.push_str(&bind(n)),
                    Err(_) => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        String::new()
    });
    max
}

/// Bind the portal's text parameters, quoted, in place of `$1`, `$2`, ...
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn bind_params(sql: &str, parameters: &[Option<bytes::Bytes>]) -> String {
    rewrite_placeholders(sql, |n| match n.checked_sub(1).and_then(|i| parameters.get(i)) {
        Some(Some(bytes)) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
        Some(None) => "NULL".to_string(),
        None => format!("${n}"),
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(RentdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RentdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RentdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message.into(),
    )))
}

/// SQLSTATE for each engine error category.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::Validation => "22023",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Conflict => "55000",
        ErrorKind::BusinessRule => "P0001",
        ErrorKind::Fatal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
