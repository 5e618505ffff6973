use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertArea {
        area: Area,
    },
    DeleteArea {
        id: Ulid,
    },
    UpsertAvailability {
        availability: Availability,
    },
    DeleteAvailability {
        id: Ulid,
    },
    UpsertBooking {
        id: Ulid,
        date: NaiveDate,
        template: BookingTemplate,
    },
    DeleteBooking {
        id: Ulid,
    },
    UpsertPattern {
        id: Ulid,
        template: BookingTemplate,
        rule: RecurrenceRule,
    },
    DeletePattern {
        id: Ulid,
    },
    SelectAreas,
    SelectAvailabilities {
        area_id: Ulid,
    },
    SelectBookings {
        area_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectPatternBookings {
        pattern_id: Ulid,
    },
    SelectBookable {
        area_ids: Vec<Ulid>,
        date: NaiveDate,
        range: TimeRange,
        exclude: Option<Ulid>,
    },
    SelectRecurrence {
        rule: RecurrenceRule,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table named in the FROM clause of a SELECT, if `sql` is one. Works on
/// statements that still contain `$n` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let v = Row(&values);

    match table.as_str() {
        // (id, name, base_price, active)
        "areas" => {
            v.require("areas", 2)?;
            Ok(Command::UpsertArea {
                area: Area {
                    id: parse_ulid(v.get(0))?,
                    name: parse_string(v.get(1))?,
                    base_price: v.opt(2).map(parse_i64).transpose()?.unwrap_or(0),
                    active: v.opt(3).map(parse_bool).transpose()?.unwrap_or(true),
                },
            })
        }
        // (id, area_id, day_of_week, date, start_time, end_time, is_available)
        "availabilities" => {
            v.require("availabilities", 6)?;
            let day = v.opt(2).map(parse_weekday).transpose()?;
            let date = v.opt(3).map(parse_date).transpose()?;
            let window = match (day, date) {
                (Some(day), None) => AvailabilityWindow::Weekly(day),
                (None, Some(date)) => AvailabilityWindow::OnDate(date),
                _ => {
                    return Err(SqlError::Parse(
                        "exactly one of day_of_week and date must be set".into(),
                    ));
                }
            };
            Ok(Command::UpsertAvailability {
                availability: Availability {
                    id: parse_ulid(v.get(0))?,
                    area_id: parse_ulid(v.get(1))?,
                    window,
                    range: TimeRange::new(parse_time(v.get(4))?, parse_time(v.get(5))?),
                    is_available: v.opt(6).map(parse_bool).transpose()?.unwrap_or(true),
                },
            })
        }
        // (id, user_id, date, start_time, end_time, event_type, payment_status, area_ids)
        "bookings" => {
            v.require("bookings", 8)?;
            Ok(Command::UpsertBooking {
                id: parse_ulid(v.get(0))?,
                date: parse_date(v.get(2))?,
                template: parse_template(&v, 1, 3)?,
            })
        }
        // (id, user_id, start_time, end_time, event_type, payment_status, area_ids,
        //  frequency, interval, start_date, end_date, days_of_week, excluded_dates)
        "recurring_patterns" => {
            v.require("recurring_patterns", 11)?;
            let rule = RecurrenceRule {
                frequency: parse_enum(v.get(7))?,
                interval: v.opt(8).map(parse_u32).transpose()?.unwrap_or(1),
                start_date: parse_date(v.get(9))?,
                end_date: parse_date(v.get(10))?,
                days_of_week: v.opt(11).map(parse_weekday_list).transpose()?.unwrap_or_default(),
                excluded_dates: v.opt(12).map(parse_date_list).transpose()?.unwrap_or_default(),
            };
            Ok(Command::UpsertPattern {
                id: parse_ulid(v.get(0))?,
                template: parse_template(&v, 1, 2)?,
                rule,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Template columns: `user_id` at `user`, then `start_time, end_time,
/// event_type, payment_status, area_ids` from `times` on.
fn parse_template(v: &Row<'_>, user: usize, times: usize) -> Result<BookingTemplate, SqlError> {
    Ok(BookingTemplate {
        user_id: parse_ulid(v.get(user))?,
        range: TimeRange::new(parse_time(v.get(times))?, parse_time(v.get(times + 1))?),
        event_type: parse_enum(v.get(times + 2))?,
        payment_status: v
            .opt(times + 3)
            .map(parse_enum)
            .transpose()?
            .unwrap_or(PaymentStatus::Pending),
        areas: parse_area_list(v.get(times + 4))?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "areas" => Ok(Command::DeleteArea { id }),
        "availabilities" => Ok(Command::DeleteAvailability { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "recurring_patterns" => Ok(Command::DeletePattern { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let f = Filters(filters);

    match table.as_str() {
        "areas" => Ok(Command::SelectAreas),
        "availabilities" => Ok(Command::SelectAvailabilities {
            area_id: parse_ulid(f.eq("area_id")?)?,
        }),
        "bookings" => {
            if let Some(pid) = f.find("pattern_id", Op::Eq) {
                return Ok(Command::SelectPatternBookings {
                    pattern_id: parse_ulid(pid)?,
                });
            }
            let area_id = parse_ulid(f.eq("area_id")?)?;
            let (mut from, mut to) = (None, None);
            if let Some(on) = f.find("date", Op::Eq) {
                let date = parse_date(on)?;
                from = Some(date);
                to = Some(date);
            }
            if let Some(e) = f.find("date", Op::GtEq) {
                from = Some(parse_date(e)?);
            }
            if let Some(e) = f.find("date", Op::LtEq) {
                to = Some(parse_date(e)?);
            }
            Ok(Command::SelectBookings { area_id, from, to })
        }
        "bookable" => Ok(Command::SelectBookable {
            area_ids: parse_area_list(f.eq("area_ids")?)?
                .into_iter()
                .map(|a| a.area_id)
                .collect(),
            date: parse_date(f.eq("date")?)?,
            range: TimeRange::new(parse_time(f.eq("start_time")?)?, parse_time(f.eq("end_time")?)?),
            exclude: f.find("exclude_id", Op::Eq).map(parse_ulid).transpose()?,
        }),
        "recurrence" => {
            let interval = f.find("interval", Op::Eq).or_else(|| f.find("every", Op::Eq));
            Ok(Command::SelectRecurrence {
                rule: RecurrenceRule {
                    frequency: parse_enum(f.eq("frequency")?)?,
                    interval: interval.map(parse_u32).transpose()?.unwrap_or(1),
                    start_date: parse_date(f.eq("start_date")?)?,
                    end_date: parse_date(f.eq("end_date")?)?,
                    days_of_week: f
                        .find("days_of_week", Op::Eq)
                        .map(parse_weekday_list)
                        .transpose()?
                        .unwrap_or_default(),
                    excluded_dates: f
                        .find("excluded_dates", Op::Eq)
                        .map(parse_date_list)
                        .transpose()?
                        .unwrap_or_default(),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

struct Filter<'a> {
    column: String,
    op: Op,
    value: &'a Expr,
}

struct Filters<'a>(Vec<Filter<'a>>);

impl<'a> Filters<'a> {
    fn find(&self, column: &str, op: Op) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|f| f.column == column && f.op == op)
            .map(|f| f.value)
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column, Op::Eq).ok_or(SqlError::MissingFilter(column))
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Positional VALUES row. Missing trailing values and NULLs read as absent.
struct Row<'a>(&'a [Expr]);

impl<'a> Row<'a> {
    fn require(&self, table: &'static str, n: usize) -> Result<(), SqlError> {
        if self.0.len() < n {
            return Err(SqlError::WrongArity(table, n, self.0.len()));
        }
        Ok(())
    }

    /// Only called for indexes below the `require`d arity.
    fn get(&self, i: usize) -> &'a Expr {
        &self.0[i]
    }

    fn opt(&self, i: usize) -> Option<&'a Expr> {
        self.0.get(i).filter(|e| !is_null(e))
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
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

/// Text of a string or bare number literal.
fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
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

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_enum<T: FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn date_from_str(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    date_from_str(&parse_string(expr)?)
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// `mon`..`sun` (any case, full names too) or ISO numbers `1`..`7`.
fn weekday_from_str(s: &str) -> Result<Weekday, SqlError> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u8>() {
        return match n {
            1..=7 => Weekday::try_from(n - 1)
                .map_err(|_| SqlError::Parse(format!("bad weekday number: {n}"))),
            _ => Err(SqlError::Parse(format!("bad weekday number: {n}"))),
        };
    }
    s.parse()
        .map_err(|_| SqlError::Parse(format!("bad weekday: {s:?}")))
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    weekday_from_str(&parse_string(expr)?)
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}

fn parse_weekday_list(expr: &Expr) -> Result<Vec<Weekday>, SqlError> {
    let s = parse_string(expr)?;
    split_list(&s).map(weekday_from_str).collect()
}

fn parse_date_list(expr: &Expr) -> Result<Vec<NaiveDate>, SqlError> {
    let s = parse_string(expr)?;
    split_list(&s).map(date_from_str).collect()
}

/// `ID[:cents],ID[:cents],...`
fn parse_area_list(expr: &Expr) -> Result<Vec<BookingArea>, SqlError> {
    let s = parse_string(expr)?;
    split_list(&s)
        .map(|entry| {
            let (id, price) = match entry.split_once(':') {
                Some((id, price)) => (id, Some(price)),
                None => (entry, None),
            };
            let area_id = Ulid::from_string(id.trim())
                .map_err(|e| SqlError::Parse(format!("bad ULID in area list: {e}")))?;
            let custom_price = price
                .map(|p| {
                    p.trim()
                        .parse::<Cents>()
                        .map_err(|e| SqlError::Parse(format!("bad price {p:?}: {e}")))
                })
                .transpose()?;
            Ok(BookingArea {
                area_id,
                custom_price,
            })
        })
        .collect()
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
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
