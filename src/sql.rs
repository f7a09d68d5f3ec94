use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_PAGE_SIZE;
use crate::model::*;

/// Parsed command from SQL input. The caller's identity comes from the
/// connection, not from the statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    /// Owned by the caller.
    InsertItem {
        id: Ulid,
        name: String,
        description: Option<String>,
        available: bool,
    },
    InsertBooking {
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteBooking {
        id: Ulid,
    },
    ApproveBooking {
        booking_id: Ulid,
        approved: bool,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        perspective: Perspective,
        state: String,
        from: i64,
        size: i64,
    },
    InsertComment {
        item_id: Ulid,
        text: String,
    },
    SelectComments {
        item_id: Ulid,
    },
    SelectItem {
        id: Ulid,
    },
    /// The caller's own items.
    SelectItems {
        from: i64,
        size: i64,
    },
}

/// Kind of rows a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// Command tag only.
    Tag,
    Booking,
    Comment,
    Item,
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

/// Row shape from the statement kind and table alone, without reading any
/// values. Anything that doesn't parse answers with a tag.
pub fn row_shape(sql: &str) -> RowShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return RowShape::Tag;
    };
    match stmts.first() {
        Some(Statement::Insert(insert)) => match insert_table_name(insert).as_deref() {
            Ok("bookings" | "approvals") => RowShape::Booking,
            Ok("comments") => RowShape::Comment,
            _ => RowShape::Tag,
        },
        Some(Statement::Delete(delete)) => match delete_table_name(delete).as_deref() {
            Ok("bookings") => RowShape::Booking,
            _ => RowShape::Tag,
        },
        Some(Statement::Query(query)) => match select_table_name(query).as_deref() {
            Ok("bookings" | "owner_bookings") => RowShape::Booking,
            Ok("comments") => RowShape::Comment,
            Ok("items") => RowShape::Item,
            _ => RowShape::Tag,
        },
        _ => RowShape::Tag,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = Row::from_insert(insert, "users", &["id", "name", "email"])?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                email: row.get("email").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "items" => {
            let row = Row::from_insert(insert, "items", &["id", "name", "description", "available"])?;
            Ok(Command::InsertItem {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                description: row
                    .get("description")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
                available: row.get("available").map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "bookings" => {
            let row = Row::from_insert(insert, "bookings", &["item_id", "start", "end"])?;
            Ok(Command::InsertBooking {
                item_id: parse_ulid(row.require("item_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
            })
        }
        "approvals" => {
            let row = Row::from_insert(insert, "approvals", &["booking_id", "approved"])?;
            Ok(Command::ApproveBooking {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                approved: parse_bool(row.require("approved")?)?,
            })
        }
        "comments" => {
            let row = Row::from_insert(insert, "comments", &["item_id", "text"])?;
            Ok(Command::InsertComment {
                item_id: parse_ulid(row.require("item_id")?)?,
                text: parse_string(row.require("text")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(filters.require("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let table = select_table_name(query)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "bookings" if filters.get("id").is_some() => Ok(Command::SelectBooking {
            id: parse_ulid(filters.require("id")?)?,
        }),
        "bookings" => select_bookings(Perspective::Renter, &filters),
        "owner_bookings" => select_bookings(Perspective::Owner, &filters),
        "comments" => Ok(Command::SelectComments {
            item_id: parse_ulid(filters.require("item_id")?)?,
        }),
        "items" if filters.get("id").is_some() => Ok(Command::SelectItem {
            id: parse_ulid(filters.require("id")?)?,
        }),
        "items" => {
            let (from, size) = page_filters(&filters)?;
            Ok(Command::SelectItems { from, size })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `state` defaults to ALL.
fn select_bookings(perspective: Perspective, filters: &Row) -> Result<Command, SqlError> {
    let (from, size) = page_filters(filters)?;
    Ok(Command::SelectBookings {
        perspective,
        state: filters
            .get("state")
            .map(parse_string)
            .transpose()?
            .unwrap_or_else(|| Bucket::All.as_str().to_string()),
        from,
        size,
    })
}

/// `"from"` defaults to 0 and `size` to 10.
fn page_filters(filters: &Row) -> Result<(i64, i64), SqlError> {
    let from = filters.get("from").map(parse_i64).transpose()?.unwrap_or(0);
    let size = filters
        .get("size")
        .map(parse_i64)
        .transpose()?
        .unwrap_or(DEFAULT_PAGE_SIZE as i64);
    Ok((from, size))
}

// ── Rows ──────────────────────────────────────────────────────

/// Column name → value pairs from one VALUES row or from `col = value` filters.
#[derive(Debug, Default)]
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    /// Pair the first VALUES row with the column list, or with `positional`
    /// when the statement names no columns.
    fn from_insert(
        insert: &ast::Insert,
        table: &'static str,
        positional: &[&str],
    ) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!(
                "{table}: multi-row INSERT ({} rows)",
                rows.len()
            )));
        }
        let values = &rows[0];
        let names: Vec<String> = if insert.columns.is_empty() {
            positional.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values.iter().cloned()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(if self.table.is_empty() {
            SqlError::MissingFilter(column)
        } else {
            SqlError::MissingColumn(self.table, column)
        })
    }
}

/// Collect `col = value` terms joined by AND.
fn where_filters(selection: &Option<Expr>) -> Result<Row, SqlError> {
    let mut row = Row::default();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut row.cells)?;
    }
    Ok(row)
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("filter: {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn select_table_name(query: &ast::Query) -> Result<String, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    match select.from.first() {
        Some(from) => table_factor_name(&from.relation),
        None => Err(SqlError::Parse("SELECT without FROM".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
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
        Some(Value::Number(n, _)) => match n.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {n}"))),
        },
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
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
