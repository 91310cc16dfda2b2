use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, LogFilter, NewResourceRequest, NewRoomBooking, RequestFilter};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        user: User,
    },
    InsertRoom {
        room: Room,
    },
    InsertResource {
        resource: Resource,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertRequest {
        request: NewResourceRequest,
    },
    InsertBooking {
        booking: NewRoomBooking,
    },
    ApplyAction {
        entity_type: EntityType,
        entity_id: Ulid,
        action: Action,
    },
    SelectRooms,
    SelectResources,
    SelectRequests {
        filter: RequestFilter,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectResourceAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectRoomConflict {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectCalendar {
        start: Ms,
        end: Ms,
    },
    SelectLogs {
        filter: LogFilter,
        page: Option<usize>,
        limit: Option<usize>,
    },
}

/// Shape of the rows a statement returns, known before its parameters are
/// bound. Used to describe prepared statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Rooms,
    Resources,
    Requests,
    Bookings,
    ResourceAvailability,
    RoomConflict,
    Logs,
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape of a statement that may still contain `$n` placeholders.
/// `None` for statements that return no rows or whose shape depends on an
/// unbound parameter.
pub fn describe_sql(sql: &str) -> Option<RowShape> {
    match parse_statement(sql).ok()? {
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            match table.as_str() {
                "rooms" => Some(RowShape::Rooms),
                "resources" => Some(RowShape::Resources),
                "resource_requests" => Some(RowShape::Requests),
                "room_bookings" | "calendar" => Some(RowShape::Bookings),
                "logs" => Some(RowShape::Logs),
                "availability" => {
                    let mut filters = Vec::new();
                    if let Some(selection) = &select.selection {
                        collect_filters(selection, &mut filters);
                    }
                    if filters.iter().any(|f| f.column == "room_id") {
                        Some(RowShape::RoomConflict)
                    } else {
                        Some(RowShape::ResourceAvailability)
                    }
                }
                _ => None,
            }
        }
        Statement::Insert(insert) => {
            if insert_table_name(&insert).ok()? != "actions" {
                return None;
            }
            let row = InsertRow::new(&insert, ACTION_COLUMNS).ok()?;
            let entity_type = parse_string(row.get("entity_type")?).ok()?;
            match EntityType::parse(&entity_type)? {
                EntityType::ResourceRequest => Some(RowShape::Requests),
                EntityType::RoomBooking => Some(RowShape::Bookings),
                EntityType::Resource => None,
            }
        }
        _ => None,
    }
}

// ── INSERT ─────────────────────────────────────────────────────

const USER_COLUMNS: &[&str] = &["id", "name", "email", "role", "department_id", "club_id"];
const ROOM_COLUMNS: &[&str] = &["id", "name", "capacity"];
const RESOURCE_COLUMNS: &[&str] = &["id", "name", "quantity", "owner_type", "owner_id"];
const REQUEST_COLUMNS: &[&str] = &["id", "resource_id", "quantity", "start", "end", "roll_number", "reason"];
const BOOKING_COLUMNS: &[&str] = &["id", "room_id", "start", "end", "purpose"];
const ACTION_COLUMNS: &[&str] = &["entity_type", "entity_id", "action"];

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default column order applies.
struct InsertRow {
    table: &'static str,
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, defaults: &[&str]) -> Result<Self, SqlError> {
        let table = match insert_table_name(insert)?.as_str() {
            "users" => "users",
            "rooms" => "rooms",
            "resources" => "resources",
            "resource_requests" => "resource_requests",
            "room_bookings" => "room_bookings",
            "actions" => "actions",
            other => return Err(SqlError::UnknownTable(other.to_string())),
        };
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() != columns.len() && !(insert.columns.is_empty() && values.len() < columns.len()) {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        for col in &columns {
            if !defaults.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(table, col.clone()));
            }
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_or_null).transpose().map(Option::flatten)
    }

    fn optional_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = InsertRow::new(insert, USER_COLUMNS)?;
            let role = parse_string(row.required("role")?)?;
            Ok(Command::InsertUser {
                user: User {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    email: parse_string(row.required("email")?)?,
                    role: Role::parse(&role).ok_or(SqlError::BadEnum("role", role))?,
                    department_id: row.optional_ulid("department_id")?,
                    club_id: row.optional_ulid("club_id")?,
                },
            })
        }
        "rooms" => {
            let row = InsertRow::new(insert, ROOM_COLUMNS)?;
            Ok(Command::InsertRoom {
                room: Room {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    capacity: parse_u32(row.required("capacity")?)?,
                },
            })
        }
        "resources" => {
            let row = InsertRow::new(insert, RESOURCE_COLUMNS)?;
            let owner_type = parse_string(row.required("owner_type")?)?;
            let owner_id = parse_ulid(row.required("owner_id")?)?;
            Ok(Command::InsertResource {
                resource: Resource {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    quantity: parse_u32(row.required("quantity")?)?,
                    owner: Owner::parse(&owner_type, owner_id).ok_or(SqlError::BadEnum("owner_type", owner_type))?,
                },
            })
        }
        "resource_requests" => {
            let row = InsertRow::new(insert, REQUEST_COLUMNS)?;
            Ok(Command::InsertRequest {
                request: NewResourceRequest {
                    id: parse_ulid(row.required("id")?)?,
                    resource_id: parse_ulid(row.required("resource_id")?)?,
                    quantity: parse_u32(row.required("quantity")?)?,
                    start: parse_i64(row.required("start")?)?,
                    end: parse_i64(row.required("end")?)?,
                    roll_number: row.optional_string("roll_number")?,
                    reason: row.optional_string("reason")?,
                },
            })
        }
        "room_bookings" => {
            let row = InsertRow::new(insert, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                booking: NewRoomBooking {
                    id: parse_ulid(row.required("id")?)?,
                    room_id: parse_ulid(row.required("room_id")?)?,
                    start: parse_i64(row.required("start")?)?,
                    end: parse_i64(row.required("end")?)?,
                    purpose: row.optional_string("purpose")?,
                },
            })
        }
        "actions" => {
            let row = InsertRow::new(insert, ACTION_COLUMNS)?;
            let entity_type = parse_string(row.required("entity_type")?)?;
            let action = parse_string(row.required("action")?)?;
            Ok(Command::ApplyAction {
                entity_type: EntityType::parse(&entity_type).ok_or(SqlError::BadEnum("entity_type", entity_type))?,
                entity_id: parse_ulid(row.required("entity_id")?)?,
                action: Action::parse(&action).ok_or(SqlError::BadEnum("action", action))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// A single `column <op> value` term of an AND-only WHERE clause.
struct Filter<'a> {
    column: String,
    op: Op,
    value: &'a Expr,
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) {
    if let Expr::Nested(inner) = expr {
        return collect_filters(inner, out);
    }
    let Expr::BinaryOp { left, op, right } = expr else {
        return;
    };
    let op = match op {
        ast::BinaryOperator::And => {
            collect_filters(left, out);
            collect_filters(right, out);
            return;
        }
        ast::BinaryOperator::Eq => Op::Eq,
        ast::BinaryOperator::GtEq => Op::GtEq,
        ast::BinaryOperator::LtEq => Op::LtEq,
        _ => return,
    };
    if let Some(column) = expr_column_name(left) {
        out.push(Filter {
            column,
            op,
            value: right.as_ref(),
        });
    }
}

fn find<'a>(filters: &[Filter<'a>], column: &str, op: Op) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|f| f.column == column && f.op == op)
        .map(|f| f.value)
}

fn status_filter(filters: &[Filter<'_>]) -> Result<Option<Status>, SqlError> {
    match find(filters, "status", Op::Eq) {
        None => Ok(None),
        Some(expr) => {
            let s = parse_string(expr)?;
            Status::parse(&s).map(Some).ok_or(SqlError::BadEnum("status", s))
        }
    }
}

fn window(filters: &[Filter<'_>]) -> Result<(Ms, Ms), SqlError> {
    let start = find(filters, "start", Op::GtEq).ok_or(SqlError::MissingFilter("start"))?;
    let end = find(filters, "end", Op::LtEq).ok_or(SqlError::MissingFilter("end"))?;
    Ok((parse_i64(start)?, parse_i64(end)?))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters);
    }
    let ulid_filter = |column: &str| find(&filters, column, Op::Eq).map(parse_ulid).transpose();

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "resources" => Ok(Command::SelectResources),
        "resource_requests" => Ok(Command::SelectRequests {
            filter: RequestFilter {
                resource_id: ulid_filter("resource_id")?,
                status: status_filter(&filters)?,
                requester_id: ulid_filter("requester_id")?,
            },
        }),
        "room_bookings" => Ok(Command::SelectBookings {
            filter: BookingFilter {
                room_id: ulid_filter("room_id")?,
                status: status_filter(&filters)?,
                requester_id: ulid_filter("requester_id")?,
            },
        }),
        "availability" => {
            let (start, end) = window(&filters)?;
            if let Some(room_id) = ulid_filter("room_id")? {
                return Ok(Command::SelectRoomConflict { room_id, start, end });
            }
            Ok(Command::SelectResourceAvailability {
                resource_id: ulid_filter("resource_id")?.ok_or(SqlError::MissingFilter("resource_id"))?,
                start,
                end,
            })
        }
        "calendar" => {
            let (start, end) = window(&filters)?;
            Ok(Command::SelectCalendar { start, end })
        }
        "logs" => {
            let action = match find(&filters, "action", Op::Eq) {
                None => None,
                Some(expr) => {
                    let s = parse_string(expr)?;
                    Some(AuditAction::parse(&s).ok_or(SqlError::BadEnum("action", s))?)
                }
            };
            let entity_type = match find(&filters, "entity_type", Op::Eq) {
                None => None,
                Some(expr) => {
                    let s = parse_string(expr)?;
                    Some(EntityType::parse(&s).ok_or(SqlError::BadEnum("entity_type", s))?)
                }
            };
            let (page, limit) = paging(query)?;
            Ok(Command::SelectLogs {
                filter: LogFilter { action, entity_type },
                page,
                limit,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// LIMIT/OFFSET mapped onto 1-based pages. The offset must fall on a page
/// boundary.
fn paging(query: &ast::Query) -> Result<(Option<usize>, Option<usize>), SqlError> {
    let (limit, offset) = match &query.limit_clause {
        None => (None, None),
        Some(ast::LimitClause::LimitOffset { limit, offset, .. }) => (
            limit.as_ref().map(parse_usize).transpose()?,
            offset.as_ref().map(|o| parse_usize(&o.value)).transpose()?,
        ),
        Some(ast::LimitClause::OffsetCommaLimit { offset, limit }) => {
            (Some(parse_usize(limit)?), Some(parse_usize(offset)?))
        }
    };
    match (limit, offset) {
        (_, None) | (_, Some(0)) => Ok((None, limit)),
        (Some(l), Some(o)) if l > 0 && o % l == 0 => Ok((Some(o / l + 1), Some(l))),
        (None, Some(_)) => Err(SqlError::Unsupported("OFFSET without LIMIT".into())),
        (Some(_), Some(_)) => Err(SqlError::Unsupported("OFFSET must be a multiple of LIMIT".into())),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_filters(sel, &mut filters);
    match find(&filters, "id", Op::Eq) {
        Some(expr) => parse_ulid(expr),
        None => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    BadEnum(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadEnum(field, v) => write!(f, "invalid {field}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
