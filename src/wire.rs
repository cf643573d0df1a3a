use std::fmt::Debug;
use std::io;
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

use crate::auth::SpacebookAuthSource;
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter, SqlError};

pub struct SpacebookHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<SpacebookQueryParser>,
}

impl SpacebookHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(SpacebookQueryParser),
        }
    }

    /// The startup `user` is either the admin login or the ULID of an
    /// active catalog user. Resolved on every query so deactivation and
    /// role changes take effect immediately.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        if login == self.admin_user {
            return Ok(Actor::admin(Ulid::nil()));
        }
        let actor = Ulid::from_string(&login)
            .ok()
            .and_then(|id| self.engine.catalog.user(&id))
            .filter(|u| u.is_active)
            .map(|u| Actor::new(u.id, u.role));
        actor.ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("unknown or inactive user: {login}"))
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let result = match self.resolve_actor(client) {
            Ok(actor) => self.execute_command(&actor, cmd, now_ms()).await,
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command, now: Ms) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SaveBuilding {
                id,
                name,
                address,
                is_active,
                max_concurrent,
                check_in_window,
            } => {
                let current = engine.catalog.building(&id).map(|b| b.rules).unwrap_or_default();
                let rules = BookingRules {
                    max_concurrent_reservations: max_concurrent.unwrap_or(current.max_concurrent_reservations),
                    check_in_window_minutes: check_in_window.unwrap_or(current.check_in_window_minutes),
                };
                let building = Building {
                    id,
                    name,
                    address,
                    is_active,
                    rules,
                };
                engine.save_building(actor, building, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SaveFloor {
                id,
                building_id,
                floor_number,
                is_active,
            } => {
                let floor = Floor {
                    id,
                    building_id,
                    floor_number,
                    is_active,
                };
                engine.save_floor(actor, floor, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SaveSpace {
                id,
                floor_id,
                name,
                kind,
                capacity,
                is_active,
                is_bookable,
            } => {
                let space = Space {
                    id,
                    floor_id,
                    name,
                    kind,
                    capacity,
                    is_active,
                    is_bookable,
                };
                engine.save_space(actor, space, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SaveUser {
                id,
                name,
                email,
                role,
                is_active,
            } => {
                let user = User {
                    id,
                    name,
                    email,
                    role,
                    is_active,
                };
                engine.save_user(actor, user).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeactivateBuilding { id } => {
                engine.deactivate_building(actor, id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeactivateFloor { id } => {
                engine.deactivate_floor(actor, id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeactivateSpace { id } => {
                engine.deactivate_space(actor, id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::CreateReservation(request) => {
                engine.create_reservation(actor, request, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateReservation { id, patch } => {
                engine
                    .update_reservation(actor, id, patch, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(actor, id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::CheckIn { reservation_id } => {
                engine.check_in(actor, reservation_id, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CheckOut { reservation_id } => {
                engine.check_out(actor, reservation_id, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectReservations {
                filter,
                status,
                start,
                end,
            } => {
                let mut reservations = match filter {
                    ReservationFilter::Id(id) => engine.get_reservation(&id).await.into_iter().collect(),
                    ReservationFilter::Space(id) => engine
                        .reservations_for_space(id, status)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::User(id) => engine.reservations_for_user(id, status).await,
                    ReservationFilter::Window => {
                        let (Some(start), Some(end)) = (start, end) else {
                            return Err(sql_err(SqlError::MissingFilter("start/end")));
                        };
                        engine
                            .reservations_starting_in(start, end)
                            .await
                            .map_err(engine_err)?
                    }
                };
                reservations.retain(|r| {
                    status.is_none_or(|s| r.status == s)
                        && start.is_none_or(|s| r.span.start >= s)
                        && end.is_none_or(|e| r.span.end <= e)
                });
                Ok(vec![reservation_rows(&reservations)?])
            }
            Command::SelectOccupancy { scope, start, end } => {
                let stats = engine
                    .occupancy_report(scope, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![occupancy_row(&stats)?])
            }
        }
    }
}

fn inserted(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(rows))]
}

fn deleted(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("DELETE").with_rows(rows))]
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("space_id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("attendees_count", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("checked_in_at", Type::INT8),
        text_field("checked_out_at", Type::INT8),
        text_field("cancelled_at", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        text_field("total_reservations", Type::INT8),
        text_field("total_hours", Type::FLOAT8),
        text_field("occupancy_rate", Type::FLOAT8),
    ]
}

fn reservation_rows(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.space_id.to_string())?;
            encoder.encode_field(&r.user_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.title)?;
            encoder.encode_field(&r.description)?;
            encoder.encode_field(&(r.attendees_count as i64))?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.checked_in_at)?;
            encoder.encode_field(&r.checked_out_at)?;
            encoder.encode_field(&r.cancelled_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn occupancy_row(stats: &OccupancyStats) -> PgWireResult<Response> {
    let schema = Arc::new(occupancy_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&(stats.total_reservations as i64))?;
    encoder.encode_field(&stats.total_hours)?;
    encoder.encode_field(&stats.occupancy_rate)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, from the table it reads.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("OCCUPANCY") {
        occupancy_schema()
    } else {
        reservation_schema()
    }
}

#[async_trait]
impl SimpleQueryHandler for SpacebookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&*client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpacebookQueryParser;

#[async_trait]
impl QueryParser for SpacebookQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpacebookHandler {
    type Statement = String;
    type QueryParser = SpacebookQueryParser;

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
        let responses = self.run(&*client, &sql).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Inline bound text parameters as quoted literals, highest index first
/// so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&placeholder, &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SpacebookFactory {
    handler: Arc<SpacebookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SpacebookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SpacebookFactory {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        Self {
            handler: Arc::new(SpacebookHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SpacebookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpacebookFactory {
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
    factory: Arc<SpacebookFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory.as_ref().clone()).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine rejection.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ScheduleConflict(_) => "23P01",
        EngineError::QuotaExceeded { .. } => "53400",
        EngineError::Forbidden => "42501",
        EngineError::InvalidState(_) => "55000",
        EngineError::NotFound(_) => "02000",
        EngineError::Validation(_) => "22023",
        EngineError::SpaceUnavailable(_) | EngineError::HasActiveReservations(_) => "55006",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StoreFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
