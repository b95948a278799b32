use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

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
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;

use crate::auth::RoostAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes. The pgwire database name
/// selects the tenant.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    process_socket(socket, tls, RoostFactory::new(tenant_manager, password)).await
}

pub struct RoostHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoostQueryParser>,
}

impl RoostHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoostQueryParser),
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

    /// Parse and run one statement, recording its outcome and latency.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "invalid", "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, username, email, phone } => {
                engine
                    .register_user(id, username, email, phone)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UpdateUser { id, username, email, phone } => {
                engine
                    .update_user(id, username, email, phone)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectUsers => {
                let users = engine.list_users().await;
                user_rows(&users)
            }
            Command::SelectUser { id } => {
                let users = match engine.get_user(id).await {
                    Ok(user) => vec![user],
                    Err(EngineError::NotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                user_rows(&users)
            }
            Command::InsertListing { id, host_id, title, location, capacity, description } => {
                engine
                    .create_listing(id, host_id, title, location, description, capacity, Vec::new())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteListing { id } => {
                engine.delete_listing(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectListings => {
                let listings = engine.list_listings().await;
                listing_rows(&listings)
            }
            Command::SelectListing { id } => {
                let listings = match engine.get_listing_info(id).await {
                    Ok(listing) => vec![listing],
                    Err(EngineError::NotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                listing_rows(&listings)
            }
            Command::InsertAvailability { listing_id, range } => {
                engine
                    .add_availability(listing_id, range)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability { listing_id } => {
                let ranges = engine
                    .list_available_ranges(listing_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let id_str = listing_id.to_string();
                let rows: Vec<PgWireResult<_>> = ranges
                    .iter()
                    .map(|range| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id_str)?;
                        encoder.encode_field(&range.start().to_string())?;
                        encoder.encode_field(&range.end().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking { id, listing_id, user_id, range } => {
                engine
                    .request_booking(id, listing_id, user_id, range)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::TransitionBooking { id, event } => {
                engine
                    .transition_booking(id, event)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { listing_id } => {
                let bookings = engine.get_bookings(listing_id).await.map_err(engine_err)?;
                booking_rows(&bookings)
            }
            Command::SelectBooking { id } => {
                let bookings = match engine.get_booking(id).await {
                    Ok(booking) => vec![booking],
                    Err(EngineError::NotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                booking_rows(&bookings)
            }
            Command::ToggleFavorite { user_id, listing_id } => {
                let tag = match engine
                    .toggle_favorite(user_id, listing_id)
                    .await
                    .map_err(engine_err)?
                {
                    FavoriteToggle::Added => Tag::new("INSERT"),
                    FavoriteToggle::Removed => Tag::new("DELETE"),
                };
                Ok(Response::Execution(tag.with_rows(1)))
            }
            Command::SelectFavorites { user_id } => {
                let favorites = engine.get_favorites(user_id).await.map_err(engine_err)?;
                let schema = Arc::new(favorites_schema());
                let user_str = user_id.to_string();
                let rows: Vec<PgWireResult<_>> = favorites
                    .iter()
                    .map(|(listing_id, title)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&user_str)?;
                        encoder.encode_field(&listing_id.to_string())?;
                        encoder.encode_field(title)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn user_rows(users: &[UserInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(users_schema());
    let rows: Vec<PgWireResult<_>> = users
        .iter()
        .map(|u| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.username)?;
            encoder.encode_field(&u.email)?;
            encoder.encode_field(&u.phone)?;
            encoder.encode_field(&(u.favorites as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn listing_rows(listings: &[ListingInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(listings_schema());
    let rows: Vec<PgWireResult<_>> = listings
        .iter()
        .map(|l| {
            let available = serde_json::to_string(&l.available)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&l.id.to_string())?;
            encoder.encode_field(&l.host_id.to_string())?;
            encoder.encode_field(&l.title)?;
            encoder.encode_field(&l.location)?;
            encoder.encode_field(&(l.capacity as i32))?;
            encoder.encode_field(&l.description)?;
            encoder.encode_field(&available)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.listing_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.range.start().to_string())?;
            encoder.encode_field(&b.range.end().to_string())?;
            encoder.encode_field(&b.status.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("username", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("favorites", Type::INT8),
    ]
}

fn listings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("capacity", Type::INT4),
        field("description", Type::VARCHAR),
        field("available", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("listing_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn favorites_schema() -> Vec<FieldInfo> {
    vec![
        field("user_id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
    ]
}

/// Result columns for a statement, empty for anything but a SELECT.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    match sql::select_table(stmt).as_deref() {
        Some("users") => users_schema(),
        Some("listings") => listings_schema(),
        Some("availability") => availability_schema(),
        Some("bookings") => bookings_schema(),
        Some("favorites") => favorites_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoostHandler {
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
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoostQueryParser;

#[async_trait]
impl QueryParser for RoostQueryParser {
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
impl ExtendedQueryHandler for RoostHandler {
    type Statement = String;
    type QueryParser = RoostQueryParser;

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
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: quoted literals and identifiers are copied as is,
/// inserted values are never rescanned, and a placeholder with no bound
/// value stays as written.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote closes and reopens, which lands in the same place.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                if let Some(value) = bound {
                    out.push_str(&sql[copied..i]);
                    match value {
                        Some(v) => {
                            let text = String::from_utf8_lossy(v.as_ref());
                            out.push('\'');
                            out.push_str(&text.replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoostFactory {
    handler: Arc<RoostHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoostAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoostFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoostAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoostHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoostFactory {
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
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
