use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        username: String,
        email: String,
        phone: String,
    },
    DeleteUser {
        id: Ulid,
    },
    /// Fields left `None` keep their current value.
    UpdateUser {
        id: Ulid,
        username: Option<String>,
        email: Option<String>,
        phone: Option<String>,
    },
    SelectUsers,
    SelectUser {
        id: Ulid,
    },
    InsertListing {
        id: Ulid,
        host_id: Ulid,
        title: String,
        location: Option<String>,
        capacity: u32,
        description: Option<String>,
    },
    DeleteListing {
        id: Ulid,
    },
    SelectListings,
    SelectListing {
        id: Ulid,
    },
    InsertAvailability {
        listing_id: Ulid,
        range: DateRange,
    },
    SelectAvailability {
        listing_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        listing_id: Ulid,
        user_id: Ulid,
        range: DateRange,
    },
    TransitionBooking {
        id: Ulid,
        event: BookingEvent,
    },
    /// `DELETE FROM bookings` cancels; bookings are never erased.
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        listing_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    ToggleFavorite {
        user_id: Ulid,
        listing_id: Ulid,
    },
    SelectFavorites {
        user_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::Parse("query too long".into()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update { .. } => parse_update(sql),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without interpreting its filters. Works on
/// statements that still contain `$n` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_single_row(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "users" => {
            arity(4)?;
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                username: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
                phone: parse_string(&values[3])?,
            })
        }
        "listings" => {
            arity(3)?;
            let location = match values.get(3) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            let capacity = match values.get(4) {
                Some(v) => parse_u32(v)?,
                None => 1,
            };
            let description = match values.get(5) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertListing {
                id: parse_ulid(&values[0])?,
                host_id: parse_ulid(&values[1])?,
                title: parse_string(&values[2])?,
                location,
                capacity,
                description,
            })
        }
        "availability" => {
            arity(3)?;
            Ok(Command::InsertAvailability {
                listing_id: parse_ulid(&values[0])?,
                range: parse_range(&values[1], &values[2])?,
            })
        }
        "bookings" => {
            arity(5)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                range: parse_range(&values[3], &values[4])?,
            })
        }
        "booking_transitions" => {
            arity(2)?;
            let event = parse_string(&values[1])?;
            Ok(Command::TransitionBooking {
                id: parse_ulid(&values[0])?,
                event: BookingEvent::parse(&event)
                    .ok_or_else(|| SqlError::Parse(format!("unknown booking event: {event}")))?,
            })
        }
        "favorites" => {
            arity(2)?;
            Ok(Command::ToggleFavorite {
                user_id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;
    filters.allow(&["id"])?;
    let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "listings" => Ok(Command::DeleteListing { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE users SET col = 'v', ... WHERE id = '...'`, read token by token so
/// aliases, FROM and RETURNING are refused.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parser_error)?;
    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let name = parser.parse_object_name(false).map_err(parser_error)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Unsupported(format!("UPDATE {table} {}", parser.peek_token())));
    }
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parser_error)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parser_error)?)
    } else {
        None
    };
    let _ = parser.consume_token(&Token::SemiColon);
    let rest = parser.peek_token();
    if rest.token != Token::EOF {
        return Err(SqlError::Unsupported(format!("UPDATE clause {rest}")));
    }

    match table.as_str() {
        "users" => {}
        "listings" | "availability" | "bookings" | "booking_transitions" | "favorites" => {
            return Err(SqlError::Unsupported(format!("UPDATE {table}")));
        }
        _ => return Err(SqlError::UnknownTable(table)),
    }

    let (mut username, mut email, mut phone) = (None, None, None);
    for assignment in &assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("assignment to {}", assignment.target)))?;
        let slot = match col.as_str() {
            "username" => &mut username,
            "email" => &mut email,
            "phone" => &mut phone,
            _ => return Err(SqlError::Unsupported(format!("UPDATE of users.{col}"))),
        };
        *slot = Some(parse_string(&assignment.value)?);
    }

    let filters = where_filters(selection.as_ref())?;
    filters.allow(&["id"])?;
    let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::UpdateUser { id, username, email, phone })
}

fn parser_error(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;
    let allowed: &[&str] = match table.as_str() {
        "availability" => &["listing_id"],
        "bookings" => &["id", "listing_id"],
        "favorites" => &["user_id"],
        _ => &["id"],
    };
    filters.allow(allowed)?;

    match table.as_str() {
        "users" => Ok(match filters.ulid("id")? {
            Some(id) => Command::SelectUser { id },
            None => Command::SelectUsers,
        }),
        "listings" => Ok(match filters.ulid("id")? {
            Some(id) => Command::SelectListing { id },
            None => Command::SelectListings,
        }),
        "availability" => Ok(Command::SelectAvailability {
            listing_id: filters.ulid("listing_id")?.ok_or(SqlError::MissingFilter("listing_id"))?,
        }),
        "bookings" => {
            if let Some(id) = filters.ulid("id")? {
                return Ok(Command::SelectBooking { id });
            }
            Ok(Command::SelectBookings {
                listing_id: filters.ulid("listing_id")?.ok_or(SqlError::MissingFilter("listing_id"))?,
            })
        }
        "favorites" => Ok(Command::SelectFavorites {
            user_id: filters.ulid("user_id")?.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` conditions joined by AND. Any other shape is an error.
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl Filters<'_> {
    fn allow(&self, cols: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !cols.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::Unsupported(format!("filter on {c}"))),
            None => Ok(()),
        }
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.0
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, e)| parse_ulid(e))
            .transpose()
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    fn collect<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                collect(left, out)?;
                collect(right, out)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            Expr::Nested(inner) => collect(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect(expr, &mut out)?;
    }
    Ok(Filters(out))
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "users" => "users",
        "listings" => "listings",
        "availability" => "availability",
        "bookings" => "bookings",
        "booking_transitions" => "booking_transitions",
        "favorites" => "favorites",
        _ => "table",
    }
}

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

/// The one VALUES row of an INSERT. Multi-row inserts are refused because
/// each row is its own engine operation and they would not commit together.
fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_range(start: &Expr, end: &Expr) -> Result<DateRange, SqlError> {
    let (start, end) = (parse_date(start)?, parse_date(end)?);
    DateRange::new(start, end).ok_or(SqlError::InvertedRange(start, end))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    InvertedRange(NaiveDate, NaiveDate),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::MissingFilter(_) => "42703",
            SqlError::InvertedRange(..) => "22008",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvertedRange(start, end) => write!(f, "end date {end} is before start date {start}"),
        }
    }
}

impl std::error::Error for SqlError {}
