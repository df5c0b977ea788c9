use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_INSERT_ROWS;
use crate::model::{BookingRequest, ChargeFilter, ChargeRequest, InspectionKind};
use crate::records::{Furnishing, Rates};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertInspector {
        id: Ulid,
        name: String,
        slot_minutes: Option<u32>,
    },
    UpdateInspector {
        id: Ulid,
        name: Option<String>,
        slot_minutes: Option<u32>,
    },
    DeleteInspector {
        id: Ulid,
    },
    InsertTemplate {
        id: Ulid,
        inspector_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    DeleteTemplate {
        id: Ulid,
    },
    /// Empty `ranges` closes the day.
    SetOverride {
        inspector_id: Ulid,
        date: NaiveDate,
        ranges: Vec<(NaiveTime, NaiveTime)>,
    },
    ClearOverride {
        inspector_id: Ulid,
        date: NaiveDate,
    },
    InsertClient {
        id: Ulid,
        name: String,
        email: String,
        phone: Option<String>,
    },
    DeleteClient {
        id: Ulid,
    },
    InsertAgency {
        id: Ulid,
        name: String,
        rates: Rates,
    },
    DeleteAgency {
        id: Ulid,
    },
    InsertProperty {
        id: Ulid,
        code: String,
        client_id: Ulid,
        agency_id: Ulid,
        address: String,
        size_m2: f64,
        furnishing: Furnishing,
    },
    DeleteProperty {
        id: Ulid,
    },
    InsertAppointment {
        id: Ulid,
        slot_id: Ulid,
        request: BookingRequest,
    },
    DeleteAppointment {
        id: Ulid,
    },
    MarkUnproductive {
        slot_id: Ulid,
        reason: String,
        charge: Option<ChargeRequest>,
    },
    PayCharge {
        id: Ulid,
    },
    ResetSlot {
        slot_id: Ulid,
    },
    SelectSlots {
        inspector_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectAppointments {
        inspector_id: Option<Ulid>,
        agency_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectCharges {
        filter: ChargeFilter,
    },
    SelectInspectors,
    SelectTemplates {
        inspector_id: Ulid,
    },
    SelectOverrides {
        inspector_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectClients,
    SelectAgencies,
    SelectProperties,
    /// `LISTEN inspector_<id>`.
    Listen {
        channel: String,
    },
    /// `UNLISTEN <channel>`, or `UNLISTEN *` (`None`).
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_channel_command(sql) {
        return Ok(cmd);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    parse_statement(stmt)
}

/// Every statement of a `;`-separated batch, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    if let Some(cmd) = parse_channel_command(sql) {
        return Ok(vec![cmd]);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// LISTEN and UNLISTEN are matched by prefix, ahead of the SQL parser.
fn parse_channel_command(sql: &str) -> Option<Command> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let channel = |keyword: &str| {
        let head = trimmed.get(..keyword.len())?;
        if !head.eq_ignore_ascii_case(keyword) {
            return None;
        }
        let rest = &trimmed[keyword.len()..];
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Some(rest.trim().trim_matches('"').to_string())
    };
    if let Some(channel) = channel("LISTEN") {
        return Some(Command::Listen { channel });
    }
    channel("UNLISTEN").map(|channel| Command::Unlisten {
        channel: (channel != "*").then_some(channel),
    })
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    if table == "overrides" {
        return parse_override_rows(&rows);
    }
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let values = &rows[0];

    match table.as_str() {
        "inspectors" => {
            require_arity("inspectors", values, 2)?;
            Ok(Command::InsertInspector {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                slot_minutes: match values.get(2) {
                    Some(v) if !is_null(v) => Some(parse_u32(v)?),
                    _ => None,
                },
            })
        }
        "templates" => {
            require_arity("templates", values, 5)?;
            Ok(Command::InsertTemplate {
                id: parse_ulid(&values[0])?,
                inspector_id: parse_ulid(&values[1])?,
                weekday: parse_weekday(&values[2])?,
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
            })
        }
        "clients" => {
            require_arity("clients", values, 3)?;
            Ok(Command::InsertClient {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
                phone: match values.get(3) {
                    Some(v) => parse_string_or_null(v)?,
                    None => None,
                },
            })
        }
        "agencies" => {
            require_arity("agencies", values, 5)?;
            Ok(Command::InsertAgency {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                rates: Rates {
                    unfurnished: parse_i64(&values[2])?,
                    semi_furnished: parse_i64(&values[3])?,
                    furnished: parse_i64(&values[4])?,
                },
            })
        }
        "properties" => {
            require_arity("properties", values, 7)?;
            Ok(Command::InsertProperty {
                id: parse_ulid(&values[0])?,
                code: parse_string(&values[1])?,
                client_id: parse_ulid(&values[2])?,
                agency_id: parse_ulid(&values[3])?,
                address: parse_string(&values[4])?,
                size_m2: parse_f64(&values[5])?,
                furnishing: parse_string(&values[6])?
                    .parse::<Furnishing>()
                    .map_err(|e| SqlError::Parse(e.to_string()))?,
            })
        }
        "appointments" => {
            require_arity("appointments", values, 6)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(&values[0])?,
                slot_id: parse_ulid(&values[1])?,
                request: BookingRequest {
                    client_id: parse_ulid(&values[2])?,
                    agency_id: parse_ulid(&values[3])?,
                    property_id: parse_ulid(&values[4])?,
                    kind: parse_string(&values[5])?
                        .parse::<InspectionKind>()
                        .map_err(SqlError::Parse)?,
                },
            })
        }
        // (slot_id, reason) or, billed,
        // (slot_id, reason, charge_id, client_id, agency_id, property_id, amount_cents)
        "unproductive" => {
            require_arity("unproductive", values, 2)?;
            let charge = if values.len() > 2 {
                require_arity("unproductive", values, 7)?;
                Some(ChargeRequest {
                    id: parse_ulid(&values[2])?,
                    client_id: parse_ulid(&values[3])?,
                    agency_id: parse_ulid_or_null(&values[4])?,
                    property_id: parse_ulid_or_null(&values[5])?,
                    amount_cents: parse_i64(&values[6])?,
                })
            } else {
                None
            };
            Ok(Command::MarkUnproductive {
                slot_id: parse_ulid(&values[0])?,
                reason: parse_string(&values[1])?,
                charge,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(inspector_id, day, start, "end")` rows for one inspector and day. A
/// single row with NULL start and end closes the day.
fn parse_override_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    if rows.len() > MAX_INSERT_ROWS {
        return Err(SqlError::TooManyRows(rows.len()));
    }
    let mut target: Option<(Ulid, NaiveDate)> = None;
    let mut ranges = Vec::with_capacity(rows.len());
    let mut closed = false;

    for (i, row) in rows.iter().enumerate() {
        require_arity("overrides", row, 4)?;
        let key = (
            parse_ulid(&row[0]).map_err(|e| e.in_row(i))?,
            parse_date(&row[1]).map_err(|e| e.in_row(i))?,
        );
        match target {
            None => target = Some(key),
            Some(t) if t != key => {
                return Err(SqlError::Parse(
                    "override rows must share inspector_id and day".into(),
                ));
            }
            Some(_) => {}
        }
        if is_null(&row[2]) && is_null(&row[3]) {
            closed = true;
            continue;
        }
        ranges.push((
            parse_time(&row[2]).map_err(|e| e.in_row(i))?,
            parse_time(&row[3]).map_err(|e| e.in_row(i))?,
        ));
    }
    if closed && !ranges.is_empty() {
        return Err(SqlError::Parse(
            "a closed day (NULL start and end) cannot also have ranges".into(),
        ));
    }

    let (inspector_id, date) = target.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::SetOverride {
        inspector_id,
        date,
        ranges,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_eq(selection, "id")?;
    match table.as_str() {
        "inspectors" => parse_update_inspector(id, assignments),
        "charges" => parse_update_charge(id, assignments),
        _ => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
    .ok_or_else(|| SqlError::Parse("bad SET target".into()))
}

fn parse_update_inspector(id: Ulid, assignments: &[ast::Assignment]) -> Result<Command, SqlError> {

    let (mut name, mut slot_minutes) = (None, None);
    for assignment in assignments {
        match assignment_column(assignment)?.as_str() {
            "name" => name = Some(parse_string(&assignment.value)?),
            "slot_minutes" => slot_minutes = Some(parse_u32(&assignment.value)?),
            other => return Err(SqlError::Unsupported(format!("SET {other}"))),
        }
    }
    Ok(Command::UpdateInspector {
        id,
        name,
        slot_minutes,
    })
}

/// `SET paid = true` is the only change a charge takes.
fn parse_update_charge(id: Ulid, assignments: &[ast::Assignment]) -> Result<Command, SqlError> {
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE charges must SET paid = true".into()));
    };
    match assignment_column(assignment)?.as_str() {
        "paid" if parse_bool(&assignment.value)? => Ok(Command::PayCharge { id }),
        "paid" => Err(SqlError::Unsupported("a paid charge cannot be reopened".into())),
        other => Err(SqlError::Unsupported(format!("SET {other}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "unproductive" => Ok(Command::ResetSlot {
            slot_id: extract_where_eq(&delete.selection, "slot_id")?,
        }),
        "overrides" => {
            let selection = delete
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("inspector_id"))?;
            let filters = collect_filters(selection)?;
            let inspector_id = parse_ulid(
                find_filter(&filters, "inspector_id", Op::Eq)
                    .ok_or(SqlError::MissingFilter("inspector_id"))?,
            )?;
            let date = parse_date(
                find_filter(&filters, "day", Op::Eq).ok_or(SqlError::MissingFilter("day"))?,
            )?;
            Ok(Command::ClearOverride { inspector_id, date })
        }
        _ => {
            let id = extract_where_eq(&delete.selection, "id")?;
            match table.as_str() {
                "inspectors" => Ok(Command::DeleteInspector { id }),
                "templates" => Ok(Command::DeleteTemplate { id }),
                "clients" => Ok(Command::DeleteClient { id }),
                "agencies" => Ok(Command::DeleteAgency { id }),
                "properties" => Ok(Command::DeleteProperty { id }),
                "appointments" => Ok(Command::DeleteAppointment { id }),
                _ => Err(SqlError::UnknownTable(table)),
            }
        }
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let filters = match &select.selection {
        Some(selection) => collect_filters(selection)?,
        None => Vec::new(),
    };
    let inspector_filter = find_filter(&filters, "inspector_id", Op::Eq)
        .map(parse_ulid)
        .transpose()?;
    let require_inspector = || inspector_filter.ok_or(SqlError::MissingFilter("inspector_id"));

    match table.as_str() {
        "slots" => {
            let (from, to) = day_window(&filters)?;
            Ok(Command::SelectSlots {
                inspector_id: require_inspector()?,
                from,
                to,
            })
        }
        "appointments" => {
            let (from, to) = day_window(&filters)?;
            Ok(Command::SelectAppointments {
                inspector_id: inspector_filter,
                agency_id: optional_ulid(&filters, "agency_id")?,
                from,
                to,
            })
        }
        "charges" => {
            let (from, to) = match find_filter(&filters, "day", Op::Eq) {
                Some(day) => {
                    let day = parse_date(day)?;
                    (Some(day), Some(day))
                }
                None => (
                    find_filter(&filters, "day", Op::GtEq).map(parse_date).transpose()?,
                    find_filter(&filters, "day", Op::LtEq).map(parse_date).transpose()?,
                ),
            };
            Ok(Command::SelectCharges {
                filter: ChargeFilter {
                    from,
                    to,
                    client_id: optional_ulid(&filters, "client_id")?,
                    agency_id: optional_ulid(&filters, "agency_id")?,
                    paid: find_filter(&filters, "paid", Op::Eq)
                        .map(parse_bool)
                        .transpose()?,
                },
            })
        }
        "overrides" => {
            let (from, to) = day_window(&filters)?;
            Ok(Command::SelectOverrides {
                inspector_id: require_inspector()?,
                from,
                to,
            })
        }
        "templates" => Ok(Command::SelectTemplates {
            inspector_id: require_inspector()?,
        }),
        "inspectors" => Ok(Command::SelectInspectors),
        "clients" => Ok(Command::SelectClients),
        "agencies" => Ok(Command::SelectAgencies),
        "properties" => Ok(Command::SelectProperties),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `day = D`, or `day >= A AND day <= B`.
fn day_window(filters: &[Filter<'_>]) -> Result<(NaiveDate, NaiveDate), SqlError> {
    if let Some(day) = find_filter(filters, "day", Op::Eq) {
        let day = parse_date(day)?;
        return Ok((day, day));
    }
    let from = find_filter(filters, "day", Op::GtEq).ok_or(SqlError::MissingFilter("day >="))?;
    let to = find_filter(filters, "day", Op::LtEq).ok_or(SqlError::MissingFilter("day <="))?;
    Ok((parse_date(from)?, parse_date(to)?))
}

// ── WHERE filters ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// One `column <op> value` term of an AND-only WHERE clause.
#[derive(Debug)]
struct Filter<'a> {
    column: String,
    op: Op,
    value: &'a Expr,
}

fn collect_filters(expr: &Expr) -> Result<Vec<Filter<'_>>, SqlError> {
    let mut out = Vec::new();
    collect_into(expr, &mut out)?;
    Ok(out)
}

fn collect_into<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_into(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_into(left, out)?;
                    return collect_into(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
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

fn optional_ulid(filters: &[Filter<'_>], column: &str) -> Result<Option<Ulid>, SqlError> {
    find_filter(filters, column, Op::Eq).map(parse_ulid).transpose()
}

fn find_filter<'a>(filters: &[Filter<'a>], column: &str, op: Op) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|f| f.column == column && f.op == op)
        .map(|f| f.value)
}

fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    let filters = collect_filters(sel)?;
    let value = find_filter(&filters, column, Op::Eq).ok_or(SqlError::MissingFilter(column))?;
    parse_ulid(value)
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn require_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
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

/// Quoted strings and bare numbers both count as text, since bound
/// parameters arrive quoted.
fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_text(expr).map(str::to_string)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

/// `true`/`false`, or their quoted spellings from bound parameters.
fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(Value::Boolean(b)) = extract_value(expr) {
        return Ok(*b);
    }
    match parse_text(expr)?.trim().to_ascii_lowercase().as_str() {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        other => Err(SqlError::Parse(format!("bad boolean {other:?}"))),
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
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `'HH:MM'` or `'HH:MM:SS'`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// ISO day number (1 = Monday) or an English day name.
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_text(expr)?.trim();
    if let Ok(n) = s.parse::<u8>() {
        return match n {
            1 => Ok(Weekday::Mon),
            2 => Ok(Weekday::Tue),
            3 => Ok(Weekday::Wed),
            4 => Ok(Weekday::Thu),
            5 => Ok(Weekday::Fri),
            6 => Ok(Weekday::Sat),
            7 => Ok(Weekday::Sun),
            _ => Err(SqlError::Parse(format!("weekday {n} out of 1..=7"))),
        };
    }
    s.parse()
        .map_err(|_| SqlError::Parse(format!("bad weekday {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("too many rows: {0}")]
    TooManyRows(usize),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        SqlError::Parse(format!("row {row}: {self}"))
    }
}
