use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which reservations a SELECT asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    Id(Ulid),
    Space(Ulid),
    User(Ulid),
    /// No owner filter; requires a start/end window.
    Window,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SaveBuilding {
        id: Ulid,
        name: String,
        address: Option<String>,
        is_active: bool,
        max_concurrent: Option<u32>,
        check_in_window: Option<u32>,
    },
    SaveFloor {
        id: Ulid,
        building_id: Ulid,
        floor_number: i32,
        is_active: bool,
    },
    SaveSpace {
        id: Ulid,
        floor_id: Ulid,
        name: Option<String>,
        kind: SpaceKind,
        capacity: u32,
        is_active: bool,
        is_bookable: bool,
    },
    SaveUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
        is_active: bool,
    },
    DeactivateBuilding {
        id: Ulid,
    },
    DeactivateFloor {
        id: Ulid,
    },
    DeactivateSpace {
        id: Ulid,
    },
    CreateReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    CancelReservation {
        id: Ulid,
    },
    CheckIn {
        reservation_id: Ulid,
    },
    CheckOut {
        reservation_id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
        status: Option<ReservationStatus>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectOccupancy {
        scope: OccupancyScope,
        start: Ms,
        end: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "buildings" => &["id", "name", "address", "is_active", "max_concurrent", "check_in_window"],
        "floors" => &["id", "building_id", "floor_number", "is_active"],
        "spaces" => &["id", "floor_id", "name", "kind", "capacity", "is_active", "is_bookable"],
        "users" => &["id", "name", "email", "role", "is_active"],
        "reservations" => &["id", "space_id", "start", "end", "title", "description", "attendees_count"],
        "reservation_changes" => &["id", "start", "end", "title", "description", "attendees_count"],
        "check_ins" | "check_outs" => &["reservation_id"],
        _ => return None,
    })
}

/// One VALUES row keyed by column name.
struct Row {
    table: String,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| e)
            .filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or_else(|| SqlError::MissingColumn(self.table.clone(), column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(column)?)
    }

    fn opt_i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64_expr).transpose()
    }

    fn opt_u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.get(column).map(parse_u32).transpose()
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(self.required(column)?)
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string).transpose()
    }

    fn bool_or(&self, column: &str, default: bool) -> Result<bool, SqlError> {
        self.get(column).map(parse_bool).transpose().map(|b| b.unwrap_or(default))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let row = extract_insert_row(insert, &table, defaults)?;

    match table.as_str() {
        "buildings" => Ok(Command::SaveBuilding {
            id: row.ulid("id")?,
            name: row.string("name")?,
            address: row.opt_string("address")?,
            is_active: row.bool_or("is_active", true)?,
            max_concurrent: row.opt_u32("max_concurrent")?,
            check_in_window: row.opt_u32("check_in_window")?,
        }),
        "floors" => Ok(Command::SaveFloor {
            id: row.ulid("id")?,
            building_id: row.ulid("building_id")?,
            floor_number: parse_i32(row.required("floor_number")?)?,
            is_active: row.bool_or("is_active", true)?,
        }),
        "spaces" => {
            let kind = match row.opt_string("kind")? {
                Some(k) => SpaceKind::parse(&k).ok_or_else(|| SqlError::Parse(format!("bad space kind: {k}")))?,
                None => SpaceKind::Desk,
            };
            Ok(Command::SaveSpace {
                id: row.ulid("id")?,
                floor_id: row.ulid("floor_id")?,
                name: row.opt_string("name")?,
                kind,
                capacity: row.opt_u32("capacity")?.unwrap_or(1),
                is_active: row.bool_or("is_active", true)?,
                is_bookable: row.bool_or("is_bookable", true)?,
            })
        }
        "users" => {
            let role = match row.opt_string("role")? {
                Some(r) => Role::parse(&r).ok_or_else(|| SqlError::Parse(format!("bad role: {r}")))?,
                None => Role::User,
            };
            Ok(Command::SaveUser {
                id: row.ulid("id")?,
                name: row.string("name")?,
                email: row.string("email")?,
                role,
                is_active: row.bool_or("is_active", true)?,
            })
        }
        "reservations" => Ok(Command::CreateReservation(NewReservation {
            id: row.ulid("id")?,
            space_id: row.ulid("space_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            title: row.opt_string("title")?,
            description: row.opt_string("description")?,
            attendees_count: row.opt_u32("attendees_count")?,
        })),
        "reservation_changes" => Ok(Command::UpdateReservation {
            id: row.ulid("id")?,
            patch: ReservationPatch {
                start: row.opt_i64("start")?,
                end: row.opt_i64("end")?,
                title: row.opt_string("title")?,
                description: row.opt_string("description")?,
                attendees_count: row.opt_u32("attendees_count")?,
            },
        }),
        "check_ins" => Ok(Command::CheckIn {
            reservation_id: row.ulid("reservation_id")?,
        }),
        "check_outs" => Ok(Command::CheckOut {
            reservation_id: row.ulid("reservation_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "buildings" => Ok(Command::DeactivateBuilding { id }),
        "floors" => Ok(Command::DeactivateFloor { id }),
        "spaces" => Ok(Command::DeactivateSpace { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    space_id: Option<Ulid>,
    user_id: Option<Ulid>,
    floor_id: Option<Ulid>,
    building_id: Option<Ulid>,
    status: Option<ReservationStatus>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "reservations" => {
            let filter = match (f.id, f.space_id, f.user_id) {
                (Some(id), _, _) => ReservationFilter::Id(id),
                (None, Some(space), _) => ReservationFilter::Space(space),
                (None, None, Some(user)) => ReservationFilter::User(user),
                (None, None, None) if f.start.is_some() && f.end.is_some() => ReservationFilter::Window,
                _ => return Err(SqlError::MissingFilter("space_id, user_id or start/end")),
            };
            Ok(Command::SelectReservations {
                filter,
                status: f.status,
                start: f.start,
                end: f.end,
            })
        }
        "occupancy" => {
            let scope = if let Some(id) = f.space_id {
                OccupancyScope::Space(id)
            } else if let Some(id) = f.user_id {
                OccupancyScope::User(id)
            } else if let Some(id) = f.floor_id {
                OccupancyScope::Floor(id)
            } else if let Some(id) = f.building_id {
                OccupancyScope::Building(id)
            } else {
                return Err(SqlError::MissingFilter("space_id, user_id, floor_id or building_id"));
            };
            Ok(Command::SelectOccupancy {
                scope,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, f)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, f)?;
                extract_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => f.id = Some(parse_ulid_expr(right)?),
                Some("space_id") => f.space_id = Some(parse_ulid_expr(right)?),
                Some("user_id") => f.user_id = Some(parse_ulid_expr(right)?),
                Some("floor_id") => f.floor_id = Some(parse_ulid_expr(right)?),
                Some("building_id") => f.building_id = Some(parse_ulid_expr(right)?),
                Some("status") => {
                    let s = parse_string(right)?;
                    f.status = Some(
                        ReservationStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                    );
                }
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    f.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    f.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// Pair the single VALUES row with its column names: the explicit column
/// list when given, the table's default order otherwise.
fn extract_insert_row(
    insert: &ast::Insert,
    table: &str,
    defaults: &'static [&'static str],
) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let [row] = values.rows.as_slice() else {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    if insert.columns.len() > row.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
    }

    Ok(Row {
        table: table.to_string(),
        cells: columns.into_iter().zip(row.iter().cloned()).collect(),
    })
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64_expr(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(String, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
