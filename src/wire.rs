use std::fmt::Debug;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::AllocdAuthSource;
use crate::engine::{Engine, EngineError, ErrorClass, LogPage};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};

pub struct AllocdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<AllocdQueryParser>,
}

impl AllocdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(AllocdQueryParser),
        }
    }

    /// The login user name is the caller's user id.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        let id = Ulid::from_string(&user).map_err(|_| {
            user_error("28000", format!("login user must be a user id, got {user:?}"))
        })?;
        self.engine.caller_for(id).map_err(engine_err)
    }

    /// Parse, run and meter one statement.
    async fn run(&self, caller: &Caller, sql: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { user } => {
                engine.register_user(caller, user).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertRoom { room } => {
                engine.create_room(caller, room).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertResource { resource } => {
                engine.create_resource(caller, resource).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteResource { id } => {
                engine.remove_resource(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertRequest { request } => {
                engine
                    .submit_resource_request(caller, request)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertBooking { booking } => {
                engine.submit_room_booking(caller, booking).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::ApplyAction {
                entity_type,
                entity_id,
                action,
            } => {
                let entity = engine
                    .apply_action(entity_type, entity_id, action, caller)
                    .await
                    .map_err(engine_err)?;
                match entity {
                    Entity::Request(r) => rows(RowShape::Requests, [r], request_row),
                    Entity::Booking(b) => rows(RowShape::Bookings, [b], booking_row),
                }
            }
            Command::SelectRooms => rows(RowShape::Rooms, engine.list_rooms().await, room_row),
            Command::SelectResources => {
                rows(RowShape::Resources, engine.list_resources(caller).await, resource_row)
            }
            Command::SelectRequests { filter } => rows(
                RowShape::Requests,
                engine.list_requests(caller, &filter).await,
                request_row,
            ),
            Command::SelectBookings { filter } => {
                rows(RowShape::Bookings, engine.list_bookings(&filter).await, booking_row)
            }
            Command::SelectCalendar { start, end } => {
                let window = checked_span(start, end)?;
                rows(RowShape::Bookings, engine.approved_bookings(window).await, booking_row)
            }
            Command::SelectResourceAvailability {
                resource_id,
                start,
                end,
            } => {
                let available = engine
                    .available_quantity(resource_id, start, end, None)
                    .await
                    .map_err(engine_err)?;
                rows(RowShape::ResourceAvailability, [()], |schema, _| {
                    let mut encoder = DataRowEncoder::new(schema);
                    encoder.encode_field(&resource_id.to_string())?;
                    encoder.encode_field(&start)?;
                    encoder.encode_field(&end)?;
                    encoder.encode_field(&i64::from(available))?;
                    Ok(encoder.take_row())
                })
            }
            Command::SelectRoomConflict { room_id, start, end } => {
                let span = checked_span(start, end)?;
                let conflict = engine.room_has_conflict(room_id, span, None).await;
                rows(RowShape::RoomConflict, [()], |schema, _| {
                    let mut encoder = DataRowEncoder::new(schema);
                    encoder.encode_field(&room_id.to_string())?;
                    encoder.encode_field(&start)?;
                    encoder.encode_field(&end)?;
                    encoder.encode_field(&conflict)?;
                    Ok(encoder.take_row())
                })
            }
            Command::SelectLogs { filter, page, limit } => {
                let LogPage { entries, total, .. } = engine
                    .list_logs(caller, &filter, page, limit)
                    .await
                    .map_err(engine_err)?;
                let total = total as i64;
                rows(RowShape::Logs, entries, move |schema, log| log_row(schema, log, total))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn checked_span(start: Ms, end: Ms) -> PgWireResult<Span> {
    Span::checked(start, end)
        .ok_or_else(|| engine_err(EngineError::Validation("start time must be before end time".into())))
}

/// Encode `items` as a result set of the given shape.
fn rows<T>(
    shape: RowShape,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(Arc<Vec<FieldInfo>>, T) -> PgWireResult<DataRow>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(shape));
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| encode(schema.clone(), item))
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn room_row(schema: Arc<Vec<FieldInfo>>, room: Room) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&room.id.to_string())?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&i64::from(room.capacity))?;
    Ok(encoder.take_row())
}

fn resource_row(schema: Arc<Vec<FieldInfo>>, resource: Resource) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&resource.id.to_string())?;
    encoder.encode_field(&resource.name)?;
    encoder.encode_field(&i64::from(resource.quantity))?;
    encoder.encode_field(&resource.owner.type_str())?;
    encoder.encode_field(&resource.owner.id().to_string())?;
    Ok(encoder.take_row())
}

fn request_row(schema: Arc<Vec<FieldInfo>>, r: ResourceRequest) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.resource_id.to_string())?;
    encoder.encode_field(&r.requester_id.to_string())?;
    encoder.encode_field(&i64::from(r.quantity))?;
    encoder.encode_field(&r.span.start)?;
    encoder.encode_field(&r.span.end)?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&r.roll_number)?;
    encoder.encode_field(&r.reason)?;
    encoder.encode_field(&r.created_at)?;
    Ok(encoder.take_row())
}

fn booking_row(schema: Arc<Vec<FieldInfo>>, b: RoomBooking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.room_id.to_string())?;
    encoder.encode_field(&b.requester_id.to_string())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.purpose)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.queue_position.map(i64::from))?;
    encoder.encode_field(&b.created_at)?;
    Ok(encoder.take_row())
}

fn log_row(schema: Arc<Vec<FieldInfo>>, log: LogEntry, total: i64) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&log.id.to_string())?;
    encoder.encode_field(&log.user_id.to_string())?;
    encoder.encode_field(&log.role.as_str())?;
    encoder.encode_field(&log.action.as_str())?;
    encoder.encode_field(&log.entity_type.as_str())?;
    encoder.encode_field(&log.entity_id.to_string())?;
    encoder.encode_field(&log.old_state)?;
    encoder.encode_field(&log.new_state)?;
    encoder.encode_field(&log.created_at)?;
    encoder.encode_field(&total)?;
    Ok(encoder.take_row())
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn schema_for(shape: RowShape) -> Vec<FieldInfo> {
    match shape {
        RowShape::Rooms => vec![text("id"), text("name"), int("capacity")],
        RowShape::Resources => vec![
            text("id"),
            text("name"),
            int("quantity"),
            text("owner_type"),
            text("owner_id"),
        ],
        RowShape::Requests => vec![
            text("id"),
            text("resource_id"),
            text("requester_id"),
            int("quantity"),
            int("start"),
            int("end"),
            text("status"),
            text("roll_number"),
            text("reason"),
            int("created_at"),
        ],
        RowShape::Bookings => vec![
            text("id"),
            text("room_id"),
            text("requester_id"),
            int("start"),
            int("end"),
            text("purpose"),
            text("status"),
            int("queue_position"),
            int("created_at"),
        ],
        RowShape::ResourceAvailability => {
            vec![text("resource_id"), int("start"), int("end"), int("available")]
        }
        RowShape::RoomConflict => vec![
            text("room_id"),
            int("start"),
            int("end"),
            FieldInfo::new("conflict".into(), None, None, Type::BOOL, FieldFormat::Text),
        ],
        RowShape::Logs => vec![
            text("id"),
            text("user_id"),
            text("role"),
            text("action"),
            text("entity_type"),
            text("entity_id"),
            text("old_state"),
            text("new_state"),
            int("created_at"),
            int("total"),
        ],
    }
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::describe_sql(sql).map(schema_for).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for AllocdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        Ok(vec![self.run(&caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllocdQueryParser;

#[async_trait]
impl QueryParser for AllocdQueryParser {
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
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllocdHandler {
    type Statement = String;
    type QueryParser = AllocdQueryParser;

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
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        self.run(&caller, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement)))
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
        // Bound parameters can settle a shape the bare statement leaves open.
        let schema = match sql::describe_sql(&substitute_params(target)) {
            Some(shape) => schema_for(shape),
            None => describe(&target.statement.statement),
        };
        Ok(DescribePortalResponse::new(schema))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
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

pub struct AllocdFactory {
    handler: Arc<AllocdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<AllocdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllocdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = AllocdAuthSource::new(engine.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllocdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllocdFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(AllocdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

pub fn sqlstate(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Validation => "22023",
        ErrorClass::Forbidden => "42501",
        ErrorClass::NotFound => "02000",
        ErrorClass::Conflict => "40001",
        ErrorClass::Store => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.class()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(
            count_params("SELECT * FROM availability WHERE room_id = $1 AND start >= $3 AND \"end\" <= $2"),
            3
        );
        assert_eq!(count_params("INSERT INTO rooms VALUES ($10, $2, $1)"), 10);
    }

    #[test]
    fn error_classes_map_to_distinct_sqlstates() {
        let classes = [
            ErrorClass::Validation,
            ErrorClass::Forbidden,
            ErrorClass::NotFound,
            ErrorClass::Conflict,
            ErrorClass::Store,
        ];
        let mut codes: Vec<_> = classes.iter().map(|c| sqlstate(*c)).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert_eq!(sqlstate(EngineError::Forbidden("x").class()), "42501");
    }

    #[test]
    fn every_shape_has_a_schema() {
        for shape in [
            RowShape::Rooms,
            RowShape::Resources,
            RowShape::Requests,
            RowShape::Bookings,
            RowShape::ResourceAvailability,
            RowShape::RoomConflict,
            RowShape::Logs,
        ] {
            assert!(!schema_for(shape).is_empty());
        }
    }
}
