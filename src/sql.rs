use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
///
/// The dialect is deliberately tiny: three writable tables (`lots`,
/// `bookings`, `slots`) and three readable ones (`lots`, `slots`,
/// `bookings`, `availability`), plus LISTEN. Dates and times-of-day
/// arrive as separate literals and are combined into one UTC-millisecond
/// instant here — never by string concatenation.
#[derive(Debug, PartialEq)]
pub enum Command {
    ProvisionLot {
        name: String,
        capacity: u32,
        rate_per_hour: u32,
    },
    Book {
        lot: String,
        requester: Requester,
        span: Span,
    },
    /// `UPDATE slots SET status = 'free' ...` — the owner override.
    FreeSlot {
        lot: String,
        slot: u32,
    },
    SelectLots,
    SelectSlots {
        lot: String,
    },
    SelectBookings {
        account: String,
    },
    SelectAvailability {
        lot: String,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "lots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("lots", 3, values.len()));
            }
            Ok(Command::ProvisionLot {
                name: parse_string(&values[0])?,
                capacity: parse_u32(&values[1])?,
                rate_per_hour: parse_u32(&values[2])?,
            })
        }
        "bookings" => {
            // (lot, plate, date, start, end, driver, phone, owner_name,
            //  owner_phone, account) — first five required.
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            let lot = parse_string(&values[0])?;
            let plate = parse_string(&values[1])?;
            let date = parse_date(&values[2])?;
            let start = parse_time(&values[3])?;
            let end = parse_time(&values[4])?;

            let opt = |i: usize| -> Result<Option<String>, SqlError> {
                match values.get(i) {
                    Some(expr) => parse_string_or_null(expr),
                    None => Ok(None),
                }
            };
            let requester = Requester {
                plate,
                driver_name: opt(5)?,
                phone: opt(6)?,
                owner_name: opt(7)?,
                owner_phone: opt(8)?,
                account_key: opt(9)?,
            };

            // The engine validates the span; a backwards interval must
            // reach it intact rather than blow up here.
            let span = Span {
                start: instant_ms(date, start),
                end: instant_ms(date, end),
            };
            Ok(Command::Book {
                lot,
                requester,
                span,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut to_free = false;
    for assignment in assignments {
        let col = assignment_column(&assignment.target);
        if col.as_deref() == Some("status") {
            let status = parse_string(&assignment.value)?;
            match status.as_str() {
                "free" => to_free = true,
                other => {
                    return Err(SqlError::Unsupported(format!(
                        "status assignment '{other}' (only 'free' is supported)"
                    )));
                }
            }
        }
    }
    if !to_free {
        return Err(SqlError::MissingFilter("status"));
    }

    let (mut lot, mut slot) = (None, None);
    if let Some(sel) = selection {
        extract_slot_filters(sel, &mut lot, &mut slot)?;
    }
    Ok(Command::FreeSlot {
        lot: lot.ok_or(SqlError::MissingFilter("lot"))?,
        slot: slot.ok_or(SqlError::MissingFilter("slot"))?,
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

    match table.as_str() {
        "lots" => Ok(Command::SelectLots),
        "slots" => {
            let mut lot = None;
            let mut slot = None;
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut lot, &mut slot)?;
            }
            Ok(Command::SelectSlots {
                lot: lot.ok_or(SqlError::MissingFilter("lot"))?,
            })
        }
        "bookings" => {
            let mut account = None;
            if let Some(selection) = &select.selection {
                extract_string_eq(selection, "account", &mut account)?;
            }
            Ok(Command::SelectBookings {
                account: account.ok_or(SqlError::MissingFilter("account"))?,
            })
        }
        "availability" => {
            let (mut lot, mut date, mut min_duration) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut lot, &mut date, &mut min_duration)?;
            }
            let date = date.ok_or(SqlError::MissingFilter("date"))?;
            let day_start = instant_ms(date, NaiveTime::MIN);
            Ok(Command::SelectAvailability {
                lot: lot.ok_or(SqlError::MissingFilter("lot"))?,
                start: day_start,
                end: day_start + 24 * 3_600_000,
                min_duration,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_slot_filters(
    expr: &Expr,
    lot: &mut Option<String>,
    slot: &mut Option<u32>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, lot, slot)?;
                extract_slot_filters(right, lot, slot)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("lot") {
                    *lot = Some(parse_string(right)?);
                } else if col.as_deref() == Some("slot") {
                    *slot = Some(parse_u32(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_string_eq(
    expr: &Expr,
    column: &str,
    out: &mut Option<String>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_string_eq(left, column, out)?;
                extract_string_eq(right, column, out)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some(column) {
                    *out = Some(parse_string(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_availability_filters(
    expr: &Expr,
    lot: &mut Option<String>,
    date: &mut Option<NaiveDate>,
    min_duration: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, lot, date, min_duration)?;
                extract_availability_filters(right, lot, date, min_duration)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("lot") {
                    *lot = Some(parse_string(right)?);
                } else if col.as_deref() == Some("date") {
                    *date = Some(parse_date(right)?);
                } else if col.as_deref() == Some("min_duration") {
                    *min_duration = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

/// Combine a calendar date and a time-of-day into one UTC instant.
fn instant_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(target: &ast::AssignmentTarget) -> Option<String> {
    match target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
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

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
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
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_2024_01_01: Ms = 1_704_067_200_000; // 2024-01-01T00:00:00Z
    const H: Ms = 3_600_000;

    #[test]
    fn parse_insert_lot() {
        let sql = "INSERT INTO lots (name, capacity, rate) VALUES ('Alpha Garage', 20, 40)";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::ProvisionLot {
                name: "Alpha Garage".into(),
                capacity: 20,
                rate_per_hour: 40,
            }
        );
    }

    #[test]
    fn parse_insert_lot_wrong_arity() {
        let sql = "INSERT INTO lots (name) VALUES ('Alpha Garage')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::WrongArity("lots", 3, 1))
        ));
    }

    #[test]
    fn parse_insert_booking_minimal() {
        let sql = r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha', 'KA-01-1234', '2024-01-01', '09:00', '10:00')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::Book {
                lot,
                requester,
                span,
            } => {
                assert_eq!(lot, "alpha");
                assert_eq!(requester.plate, "KA-01-1234");
                assert_eq!(requester.driver_name, None);
                assert_eq!(span.start, DAY_2024_01_01 + 9 * H);
                assert_eq!(span.end, DAY_2024_01_01 + 10 * H);
            }
            _ => panic!("expected Book, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_full() {
        let sql = r#"INSERT INTO bookings (lot, plate, date, start, "end", driver, phone, owner_name, owner_phone, account)
            VALUES ('alpha', 'KA-01-1234', '2024-01-01', '09:00', '10:30', 'Asha', '555-0101', NULL, NULL, 'asha@example.com')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::Book { requester, span, .. } => {
                assert_eq!(requester.driver_name, Some("Asha".into()));
                assert_eq!(requester.phone, Some("555-0101".into()));
                assert_eq!(requester.owner_name, None);
                assert_eq!(requester.account_key, Some("asha@example.com".into()));
                assert_eq!(span.end - span.start, 90 * 60_000);
            }
            _ => panic!("expected Book, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_seconds_time_format() {
        let sql = r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha', 'P1', '2024-01-01', '09:00:00', '09:45:00')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::Book { span, .. } => {
                assert_eq!(span.duration_ms(), 45 * 60_000);
            }
            _ => panic!("expected Book, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_backwards_interval_passes_through() {
        // Interval validation belongs to the engine, not the parser.
        let sql = r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha', 'P1', '2024-01-01', '10:00', '09:00')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::Book { span, .. } => assert!(span.end < span.start),
            _ => panic!("expected Book, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_bad_date() {
        let sql = r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha', 'P1', '01/02/2024', '09:00', '10:00')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_free_slot() {
        let sql = "UPDATE slots SET status = 'free' WHERE lot = 'alpha' AND slot = 2";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::FreeSlot {
                lot: "alpha".into(),
                slot: 2
            }
        );
    }

    #[test]
    fn parse_free_slot_requires_slot_filter() {
        let sql = "UPDATE slots SET status = 'free' WHERE lot = 'alpha'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("slot"))));
    }

    #[test]
    fn parse_update_rejects_occupied() {
        // Only the free override exists; occupancy comes from bookings.
        let sql = "UPDATE slots SET status = 'occupied' WHERE lot = 'alpha' AND slot = 2";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_lots() {
        assert_eq!(parse_sql("SELECT * FROM lots").unwrap(), Command::SelectLots);
    }

    #[test]
    fn parse_select_slots() {
        let cmd = parse_sql("SELECT * FROM slots WHERE lot = 'alpha'").unwrap();
        assert_eq!(cmd, Command::SelectSlots { lot: "alpha".into() });
    }

    #[test]
    fn parse_select_slots_requires_lot() {
        assert!(matches!(
            parse_sql("SELECT * FROM slots"),
            Err(SqlError::MissingFilter("lot"))
        ));
    }

    #[test]
    fn parse_select_bookings() {
        let cmd = parse_sql("SELECT * FROM bookings WHERE account = 'asha@example.com'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                account: "asha@example.com".into()
            }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql =
            "SELECT * FROM availability WHERE lot = 'alpha' AND date = '2024-01-01' AND min_duration = 1800000";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SelectAvailability {
                lot,
                start,
                end,
                min_duration,
            } => {
                assert_eq!(lot, "alpha");
                assert_eq!(start, DAY_2024_01_01);
                assert_eq!(end, DAY_2024_01_01 + 24 * H);
                assert_eq!(min_duration, Some(1_800_000));
            }
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_listen() {
        let cmd = parse_sql("LISTEN lot_alpha").unwrap();
        assert_eq!(
            cmd,
            Command::Listen {
                channel: "lot_alpha".into()
            }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO foobar (id) VALUES ('x')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_delete_unsupported() {
        // The ledger is append-only; there is no DELETE.
        let sql = "DELETE FROM bookings WHERE id = 'x'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
