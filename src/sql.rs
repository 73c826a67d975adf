use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::validate::{AppointmentChanges, AppointmentDraft};

/// Column order assumed by `INSERT INTO appointments VALUES (...)` without a column list.
pub const APPOINTMENT_COLUMNS: [&str; 9] = [
    "id",
    "inspector_id",
    "date",
    "start_time",
    "end_time",
    "status",
    "property",
    "client",
    "notes",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAppointment {
        draft: AppointmentDraft,
        returning: bool,
    },
    UpdateAppointment {
        id: AppointmentId,
        changes: AppointmentChanges,
        returning: bool,
    },
    /// `UPDATE ... SET status = 'confirmed' | 'cancelled'` on its own.
    SetStatus {
        id: AppointmentId,
        status: AppointmentStatus,
        returning: bool,
    },
    /// `DELETE` cancels; the row stays in history.
    CancelAppointment {
        id: AppointmentId,
        returning: bool,
    },
    SelectAppointments {
        inspector_id: InspectorId,
        date: Option<NaiveDate>,
    },
    SelectConflicts {
        inspector_id: Option<InspectorId>,
        date: Option<NaiveDate>,
    },
    SelectWorkload {
        inspector_id: InspectorId,
        from: NaiveDate,
        to: NaiveDate,
    },
}

/// Row shape a statement produces, known before parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Appointments,
    Conflicts,
    Workload,
    /// `... RETURNING` on a write.
    WriteResult,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_one(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(&table.relation, &assignments, &selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Classify without converting any values, so `$n` placeholders are fine.
pub fn result_shape(sql: &str) -> Option<ResultShape> {
    match parse_one(sql).ok()? {
        Statement::Insert(insert) => insert.returning.map(|_| ResultShape::WriteResult),
        Statement::Update { returning, .. } => returning.map(|_| ResultShape::WriteResult),
        Statement::Delete(delete) => delete.returning.map(|_| ResultShape::WriteResult),
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            match table.as_str() {
                "appointments" => Some(ResultShape::Appointments),
                "conflicts" => Some(ResultShape::Conflicts),
                "workload" => Some(ResultShape::Workload),
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_one(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let columns: Vec<String> = if insert.columns.is_empty() {
        APPOINTMENT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let values = extract_insert_row(insert)?;
    // Positional inserts may stop after any column; a column list must match exactly.
    let arity_ok = if insert.columns.is_empty() {
        values.len() <= columns.len()
    } else {
        values.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }

    let mut draft = AppointmentDraft::default();
    for (column, value) in columns.iter().zip(values.iter()) {
        match column.as_str() {
            "id" => draft.id = parse_optional(value, column, parse_ulid)?,
            "inspector_id" => draft.inspector_id = parse_optional(value, column, parse_ulid)?,
            "date" => draft.date = parse_optional(value, column, parse_date)?,
            "start_time" => draft.start = parse_optional(value, column, parse_time)?,
            "end_time" => draft.end = parse_optional(value, column, parse_time)?,
            "status" => draft.status = parse_optional(value, column, parse_status)?,
            "property" => draft.details.property = text(value, column)?,
            "client" => draft.details.client = text(value, column)?,
            "notes" => draft.details.notes = text(value, column)?,
            _ => return Err(SqlError::UnknownColumn(column.clone())),
        }
    }

    Ok(Command::InsertAppointment {
        draft,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut status = None;
    let mut changes = AppointmentChanges::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "status" => status = Some(required(value, &column, parse_status)?),
            "inspector_id" => changes.inspector_id = Some(required(value, &column, parse_ulid)?),
            "date" => changes.date = Some(required(value, &column, parse_date)?),
            "start_time" => changes.start = Some(required(value, &column, parse_time)?),
            "end_time" => changes.end = Some(required(value, &column, parse_time)?),
            "property" => changes.property = Some(required(value, &column, |s| Ok(s.to_string()))?),
            "client" => changes.client = Some(required(value, &column, |s| Ok(s.to_string()))?),
            "notes" => changes.notes = Some(required(value, &column, |s| Ok(s.to_string()))?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    match status {
        None => Ok(Command::UpdateAppointment {
            id,
            changes,
            returning,
        }),
        Some(_) if !changes.is_empty() => Err(SqlError::Unsupported(
            "status must be changed on its own".into(),
        )),
        Some(AppointmentStatus::Tentative) => Err(SqlError::Unsupported(
            "an appointment cannot be moved back to tentative".into(),
        )),
        Some(status) => Ok(Command::SetStatus {
            id,
            status,
            returning,
        }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::CancelAppointment {
        id: extract_where_id(&delete.selection)?,
        returning: delete.returning.is_some(),
    })
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "appointments" => Ok(Command::SelectAppointments {
            inspector_id: filters
                .inspector_id
                .ok_or(SqlError::MissingFilter("inspector_id"))?,
            date: filters.date,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            inspector_id: filters.inspector_id,
            date: filters.date,
        }),
        "workload" => {
            let inspector_id = filters
                .inspector_id
                .ok_or(SqlError::MissingFilter("inspector_id"))?;
            // A single `date = ...` is a one-day range.
            let from = filters
                .date_from
                .or(filters.date)
                .ok_or(SqlError::MissingFilter("date >="))?;
            let to = filters
                .date_to
                .or(filters.date)
                .ok_or(SqlError::MissingFilter("date <="))?;
            Ok(Command::SelectWorkload {
                inspector_id,
                from,
                to,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    inspector_id: Option<InspectorId>,
    date: Option<NaiveDate>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
}

impl Filters {
    /// Walk an `AND` chain of simple comparisons. Anything else is refused
    /// rather than silently ignored.
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                match (column.as_str(), op) {
                    ("inspector_id", ast::BinaryOperator::Eq) => {
                        self.inspector_id = Some(required(right, &column, parse_ulid)?);
                    }
                    ("date", ast::BinaryOperator::Eq) => {
                        self.date = Some(required(right, &column, parse_date)?);
                    }
                    ("date", ast::BinaryOperator::GtEq) => {
                        self.date_from = Some(required(right, &column, parse_date)?);
                    }
                    ("date", ast::BinaryOperator::LtEq) => {
                        self.date_to = Some(required(right, &column, parse_date)?);
                    }
                    _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
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

fn extract_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => required(right, "id", parse_ulid),
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

/// Literal as text. `NULL` is `None`.
fn text(expr: &Expr, column: &str) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            other => Err(SqlError::bad_value(column, format!("unexpected literal {other}"))),
        },
        other => Err(SqlError::bad_value(column, format!("expected a literal, got {other}"))),
    }
}

fn parse_optional<T>(
    expr: &Expr,
    column: &str,
    convert: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, SqlError> {
    text(expr, column)?
        .map(|s| convert(&s).map_err(|e| SqlError::bad_value(column, e)))
        .transpose()
}

fn required<T>(
    expr: &Expr,
    column: &str,
    convert: impl Fn(&str) -> Result<T, String>,
) -> Result<T, SqlError> {
    parse_optional(expr, column, convert)?
        .ok_or_else(|| SqlError::bad_value(column, "cannot be NULL".into()))
}

fn parse_ulid(s: &str) -> Result<Ulid, String> {
    Ulid::from_string(s.trim()).map_err(|e| format!("bad ULID: {e}"))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s:?}: {e}"))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(s: &str) -> Result<NaiveTime, String> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| format!("bad time {s:?}: {e}"))
}

fn parse_status(s: &str) -> Result<AppointmentStatus, String> {
    s.parse()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
    BadValue { column: String, message: String },
}

impl SqlError {
    fn bad_value(column: &str, message: String) -> Self {
        SqlError::BadValue {
            column: column.to_string(),
            message,
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "appointments: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue { column, message } => write!(f, "{column}: {message}"),
        }
    }
}

impl std::error::Error for SqlError {}
