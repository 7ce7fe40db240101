use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use thiserror::Error;

use crate::model::*;

/// Parsed command from SQL input. Values are carried raw; the engine validates them.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability(AvailabilityRequest),
    InsertBooking(BookingRequest),
    SelectBookingByToken { token: String },
    CheckIn { token: String },
    SelectBookings(BookingFilter),
    SelectCourts { id: Option<i64> },
    InsertCourt { id: Option<i64>, name: String },
    UpdateCourt { id: i64, name: String },
    DeleteCourt { id: i64 },
}

const BOOKING_COLUMNS: [&str; 5] = ["court_id", "date", "start_hour", "end_hour", "people_count"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(parse_err)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update { .. } => parse_update(sql),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "bookings" => {
            let row = insert_row(insert, "bookings", &BOOKING_COLUMNS)?;
            row.only(&BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(BookingRequest {
                court_id: parse_i64_expr(row.require("court_id")?)?,
                date: parse_string_expr(row.require("date")?)?,
                start_hour: parse_i64_expr(row.require("start_hour")?)?,
                end_hour: parse_i64_expr(row.require("end_hour")?)?,
                people_count: parse_i64_expr(row.require("people_count")?)?,
            }))
        }
        "courts" => {
            let row = insert_row(insert, "courts", &["name"])?;
            row.only(&["id", "name"])?;
            Ok(Command::InsertCourt {
                id: row.get("id").map(parse_i64_expr).transpose()?,
                name: parse_string_expr(row.require("name")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt {
            id: parse_i64_expr(extract_where_eq(&delete.selection, "id")?)?,
        }),
        "bookings" => Err(SqlError::Unsupported("bookings are never deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    match table.as_str() {
        "availability" => {
            let (mut court_id, mut date) = (None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut court_id, &mut date)?;
            }
            Ok(Command::SelectAvailability(AvailabilityRequest {
                court_id: court_id.ok_or(SqlError::MissingFilter("court_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            }))
        }
        "bookings" => {
            let mut selection = BookingSelection::default();
            if let Some(expr) = &select.selection {
                collect_booking_filters(expr, &mut selection)?;
            }
            match selection.token {
                Some(token) if selection.filter == BookingFilter::default() => {
                    Ok(Command::SelectBookingByToken { token })
                }
                Some(_) => Err(SqlError::Unsupported(
                    "token lookup cannot be combined with other filters".into(),
                )),
                None => Ok(Command::SelectBookings(selection.filter)),
            }
        }
        "courts" => {
            let id = match &select.selection {
                Some(_) => Some(parse_i64_expr(extract_where_eq(&select.selection, "id")?)?),
                None => None,
            };
            Ok(Command::SelectCourts { id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE` is parsed clause by clause, after `parse_sql` has accepted the statement.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;
    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let table_name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&table_name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parse_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parse_err)?)
    } else {
        None
    };

    let [assignment] = assignments.as_slice() else {
        return Err(SqlError::Unsupported("exactly one SET assignment is supported".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
    .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;

    match (table.as_str(), column.as_str()) {
        ("bookings", "used_at") => {
            if !is_now(&assignment.value) {
                return Err(SqlError::Unsupported("used_at can only be set to now()".into()));
            }
            Ok(Command::CheckIn {
                token: parse_string_expr(extract_where_eq(&selection, "token")?)?,
            })
        }
        ("courts", "name") => Ok(Command::UpdateCourt {
            id: parse_i64_expr(extract_where_eq(&selection, "id")?)?,
            name: parse_string_expr(&assignment.value)?,
        }),
        ("bookings", _) | ("courts", _) => Err(SqlError::Unsupported(format!("cannot update {table}.{column}"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    court_id: &mut Option<i64>,
    date: &mut Option<String>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_availability_filters(inner, court_id, date),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_availability_filters(left, court_id, date)?;
            extract_availability_filters(right, court_id, date)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left).as_deref() {
            Some("court_id") => {
                *court_id = Some(parse_i64_expr(right)?);
                Ok(())
            }
            Some("date") => {
                *date = Some(parse_string_expr(right)?);
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("availability filter {expr}"))),
        },
        _ => Err(SqlError::Unsupported(format!("availability filter {expr}"))),
    }
}

#[derive(Debug, Default)]
struct BookingSelection {
    filter: BookingFilter,
    token: Option<String>,
}

/// Accepts `date = d`, `date >= d`, `date <= d`, `date BETWEEN a AND b`,
/// `court_id = n`, `used_at IS NULL` and `token = t`, joined by `AND`.
fn collect_booking_filters(expr: &Expr, sel: &mut BookingSelection) -> Result<(), SqlError> {
    let unsupported = || SqlError::Unsupported(format!("bookings filter {expr}"));
    match expr {
        Expr::Nested(inner) => collect_booking_filters(inner, sel),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_booking_filters(left, sel)?;
            collect_booking_filters(right, sel)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left).ok_or_else(unsupported)?;
            match (column.as_str(), op) {
                ("date", ast::BinaryOperator::Eq) => sel.filter.date = Some(parse_string_expr(right)?),
                ("date", ast::BinaryOperator::GtEq) => sel.filter.from = Some(parse_string_expr(right)?),
                ("date", ast::BinaryOperator::LtEq) => sel.filter.to = Some(parse_string_expr(right)?),
                ("court_id", ast::BinaryOperator::Eq) => sel.filter.court_id = Some(parse_i64_expr(right)?),
                ("token", ast::BinaryOperator::Eq) => sel.token = Some(parse_string_expr(right)?),
                _ => return Err(unsupported()),
            }
            Ok(())
        }
        Expr::Between {
            expr: column,
            negated: false,
            low,
            high,
        } if expr_column_name(column).as_deref() == Some("date") => {
            sel.filter.from = Some(parse_string_expr(low)?);
            sel.filter.to = Some(parse_string_expr(high)?);
            Ok(())
        }
        Expr::IsNull(column) if expr_column_name(column).as_deref() == Some("used_at") => {
            sel.filter.pending_only = true;
            Ok(())
        }
        _ => Err(unsupported()),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn parse_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
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

/// One `VALUES` row keyed by column name.
struct InsertRow {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl InsertRow {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.cells.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((column, _)) => Err(SqlError::UnknownColumn {
                table: self.table,
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Pair the single `VALUES` row with its column list, or with `default_columns`
/// when the statement names none.
fn insert_row(insert: &ast::Insert, table: &'static str, default_columns: &[&str]) -> Result<InsertRow, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let [row] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!("{table}: exactly one VALUES row is supported")));
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    Ok(InsertRow {
        table,
        cells: columns.into_iter().zip(row.iter().cloned()).collect(),
    })
}

/// The right-hand side of a `WHERE <column> = <value>` clause.
fn extract_where_eq<'a>(selection: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::Nested(inner) => extract_where_eq_expr(inner, column),
        other => extract_where_eq_expr(other, column),
    }
}

fn extract_where_eq_expr<'a>(expr: &'a Expr, column: &'static str) -> Result<&'a Expr, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn is_now(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => matches!(
            object_name_last(&f.name).as_deref(),
            Some("now" | "current_timestamp")
        ),
        _ => false,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
