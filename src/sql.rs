use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Multi-row seat generation for one showtime.
    InsertSeats {
        room_id: Ulid,
        schedule_id: Ulid,
        seats: Vec<SeatSpec>,
    },
    /// SELECT intent on a seat.
    InsertHold {
        room_id: Ulid,
        schedule_id: Ulid,
        seat_id: String,
        holder_id: String,
    },
    /// RELEASE intent on a seat.
    DeleteHold {
        room_id: Ulid,
        schedule_id: Ulid,
        seat_id: String,
        holder_id: String,
    },
    InsertBooking {
        booking: BookingRequest,
    },
    /// Payment confirmation signal.
    UpdatePayment {
        booking_id: Ulid,
        payment_id: String,
        status: PaymentStatus,
    },
    /// The seating chart for one showtime.
    SelectSeats {
        room_id: Ulid,
        schedule_id: Ulid,
    },
    SelectHolds {
        room_id: Ulid,
        schedule_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectShowtimes,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();

    // Channel names carry slashes, so they arrive double-quoted; sqlparser
    // never sees LISTEN/UNLISTEN.
    if let Some(rest) = keyword_rest(trimmed, "UNLISTEN") {
        let channel = strip_channel(rest);
        if channel.is_empty() || channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }
    if let Some(rest) = keyword_rest(trimmed, "LISTEN") {
        let channel = strip_channel(rest);
        if channel.is_empty() {
            return Err(SqlError::Parse("LISTEN without a channel".into()));
        }
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_channel(rest: &str) -> String {
    rest.trim().trim_end_matches(';').trim().trim_matches('"').to_string()
}

/// Rest of the statement after a leading `keyword`, matched as a whole word
/// so `UNLISTENFOO` is not an UNLISTEN.
fn keyword_rest<'a>(stmt: &'a str, keyword: &str) -> Option<&'a str> {
    let head = stmt.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &stmt[keyword.len()..];
    if rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == ';') {
        Some(rest)
    } else {
        None
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "seats" => {
            let rows = extract_all_insert_rows(insert)?;
            let first = &rows[0];
            if first.len() < 4 {
                return Err(SqlError::WrongArity("seats", 4, first.len()));
            }
            let room_id = parse_ulid(&first[0])?;
            let schedule_id = parse_ulid(&first[1])?;
            let mut seats = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 4 {
                    return Err(SqlError::WrongArity("seats row", 4, row.len()));
                }
                let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                if parse_ulid(&row[0]).map_err(row_err)? != room_id
                    || parse_ulid(&row[1]).map_err(row_err)? != schedule_id
                {
                    return Err(SqlError::Parse(
                        "all seat rows must target one showtime".into(),
                    ));
                }
                seats.push(SeatSpec {
                    seat_id: parse_string(&row[2]).map_err(row_err)?,
                    price: parse_i64(&row[3]).map_err(row_err)?,
                });
            }
            Ok(Command::InsertSeats { room_id, schedule_id, seats })
        }
        "holds" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 4 {
                return Err(SqlError::WrongArity("holds", 4, values.len()));
            }
            Ok(Command::InsertHold {
                room_id: parse_ulid(&values[0])?,
                schedule_id: parse_ulid(&values[1])?,
                seat_id: parse_string(&values[2])?,
                holder_id: parse_string(&values[3])?,
            })
        }
        "bookings" => {
            let rows = extract_all_insert_rows(insert)?;
            if rows.len() > 1 {
                return Err(SqlError::Unsupported("one booking per statement".into()));
            }
            let values = &rows[0];
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            let seat_ids = parse_string_array(&values[4])?;
            let food = if values.len() >= 6 {
                parse_food_array(&values[5])?
            } else {
                Vec::new()
            };
            Ok(Command::InsertBooking {
                booking: BookingRequest {
                    id: parse_ulid(&values[0])?,
                    purchaser: parse_string(&values[1])?,
                    room_id: parse_ulid(&values[2])?,
                    schedule_id: parse_ulid(&values[3])?,
                    seat_ids,
                    food,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "holds" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut filters = EqFilters::default();
    if let Some(selection) = &delete.selection {
        extract_eq_filters(selection, &mut filters)?;
    }
    Ok(Command::DeleteHold {
        room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
        schedule_id: filters.schedule_id.ok_or(SqlError::MissingFilter("schedule_id"))?,
        seat_id: filters.seat_id.ok_or(SqlError::MissingFilter("seat_id"))?,
        holder_id: filters.holder_id.ok_or(SqlError::MissingFilter("holder_id"))?,
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

    let mut filters = EqFilters::default();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "seats" => Ok(Command::SelectSeats {
            room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            schedule_id: filters.schedule_id.ok_or(SqlError::MissingFilter("schedule_id"))?,
        }),
        "holds" => Ok(Command::SelectHolds {
            room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            schedule_id: filters.schedule_id.ok_or(SqlError::MissingFilter("schedule_id"))?,
        }),
        "bookings" => Ok(Command::SelectBooking {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "showtimes" => Ok(Command::SelectShowtimes),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    let mut payment_id = None;
    for assignment in assignments {
        match assignment_column(assignment).as_deref() {
            Some("payment_status") => {
                status = Some(parse_payment_status(&assignment.value)?);
            }
            Some("payment_id") => {
                payment_id = Some(parse_string(&assignment.value)?);
            }
            _ => {}
        }
    }

    let mut filters = EqFilters::default();
    if let Some(selection) = selection {
        extract_eq_filters(selection, &mut filters)?;
    }

    Ok(Command::UpdatePayment {
        booking_id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        payment_id: payment_id.ok_or(SqlError::MissingFilter("payment_id"))?,
        status: status.ok_or(SqlError::MissingFilter("payment_status"))?,
    })
}

// ── WHERE filters ─────────────────────────────────────────────

#[derive(Default)]
struct EqFilters {
    room_id: Option<Ulid>,
    schedule_id: Option<Ulid>,
    seat_id: Option<String>,
    holder_id: Option<String>,
    id: Option<Ulid>,
}

fn extract_eq_filters(expr: &Expr, filters: &mut EqFilters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            extract_eq_filters(left, filters)?;
            extract_eq_filters(right, filters)?;
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            match expr_column_name(left).as_deref() {
                Some("room_id") => filters.room_id = Some(parse_ulid(right)?),
                Some("schedule_id") => filters.schedule_id = Some(parse_ulid(right)?),
                Some("seat_id") => filters.seat_id = Some(parse_string(right)?),
                Some("holder_id") => filters.holder_id = Some(parse_string(right)?),
                Some("id") => filters.id = Some(parse_ulid(right)?),
                _ => {}
            }
        }
        Expr::Nested(inner) => extract_eq_filters(inner, filters)?,
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

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    Ok(extract_all_insert_rows(insert)?.swap_remove(0))
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
    } else if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_array(expr: &Expr) -> Result<Vec<String>, SqlError> {
    match expr {
        Expr::Array(array) => array.elem.iter().map(parse_string).collect(),
        _ => Err(SqlError::Parse(format!("expected ARRAY, got {expr:?}"))),
    }
}

/// Food lines ride in as `'name:qty:unit_price_cents'` array elements.
fn parse_food_array(expr: &Expr) -> Result<Vec<FoodLine>, SqlError> {
    parse_string_array(expr)?.iter().map(|s| parse_food_line(s)).collect()
}

fn parse_food_line(s: &str) -> Result<FoodLine, SqlError> {
    // Split from the right so item names may contain colons.
    let mut parts = s.rsplitn(3, ':');
    let price = parts.next();
    let qty = parts.next();
    let name = parts.next();
    match (name, qty, price) {
        (Some(name), Some(qty), Some(price)) if !name.is_empty() => Ok(FoodLine {
            name: name.to_string(),
            qty: qty
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad food qty in {s:?}: {e}")))?,
            unit_price: price
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad food price in {s:?}: {e}")))?,
        }),
        _ => Err(SqlError::Parse(format!(
            "expected 'name:qty:unit_price', got {s:?}"
        ))),
    }
}

fn parse_payment_status(expr: &Expr) -> Result<PaymentStatus, SqlError> {
    let s = parse_string(expr)?;
    match s.as_str() {
        "SUCCESS" => Ok(PaymentStatus::Success),
        "FAILED" => Ok(PaymentStatus::Failed),
        "PENDING" => Ok(PaymentStatus::Pending),
        other => Err(SqlError::Parse(format!("bad payment status: {other}"))),
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

    const ROOM: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const SCHEDULE: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_seats_multi_row() {
        let sql = format!(
            "INSERT INTO seats (room_id, schedule_id, seat_id, price) VALUES \
             ('{ROOM}', '{SCHEDULE}', 'A1', 12000), ('{ROOM}', '{SCHEDULE}', 'A2', 15000)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSeats { room_id, schedule_id, seats } => {
                assert_eq!(room_id.to_string(), ROOM);
                assert_eq!(schedule_id.to_string(), SCHEDULE);
                assert_eq!(seats.len(), 2);
                assert_eq!(seats[0], SeatSpec { seat_id: "A1".into(), price: 12000 });
                assert_eq!(seats[1], SeatSpec { seat_id: "A2".into(), price: 15000 });
            }
            _ => panic!("expected InsertSeats, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_seats_rejects_mixed_showtimes() {
        let sql = format!(
            "INSERT INTO seats (room_id, schedule_id, seat_id, price) VALUES \
             ('{ROOM}', '{SCHEDULE}', 'A1', 12000), ('{SCHEDULE}', '{ROOM}', 'A2', 15000)"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_insert_hold() {
        let sql = format!(
            "INSERT INTO holds (room_id, schedule_id, seat_id, holder_id) VALUES \
             ('{ROOM}', '{SCHEDULE}', 'B7', 'session-42')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertHold { seat_id, holder_id, .. } => {
                assert_eq!(seat_id, "B7");
                assert_eq!(holder_id, "session-42");
            }
            _ => panic!("expected InsertHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_hold_wrong_arity() {
        let sql = format!("INSERT INTO holds (room_id) VALUES ('{ROOM}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("holds", 4, 1))));
    }

    #[test]
    fn parse_delete_hold() {
        let sql = format!(
            "DELETE FROM holds WHERE room_id = '{ROOM}' AND schedule_id = '{SCHEDULE}' \
             AND seat_id = 'B7' AND holder_id = 'session-42'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DeleteHold { room_id, seat_id, holder_id, .. } => {
                assert_eq!(room_id.to_string(), ROOM);
                assert_eq!(seat_id, "B7");
                assert_eq!(holder_id, "session-42");
            }
            _ => panic!("expected DeleteHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_hold_requires_holder() {
        let sql = format!(
            "DELETE FROM holds WHERE room_id = '{ROOM}' AND schedule_id = '{SCHEDULE}' AND seat_id = 'B7'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("holder_id"))));
    }

    #[test]
    fn parse_insert_booking_with_food() {
        let sql = format!(
            "INSERT INTO bookings (id, purchaser, room_id, schedule_id, seats, food) VALUES \
             ('{ROOM}', 'alice', '{ROOM}', '{SCHEDULE}', ARRAY['A1', 'A2'], ARRAY['popcorn:2:4500', 'soda:1:2500'])"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { booking } => {
                assert_eq!(booking.purchaser, "alice");
                assert_eq!(booking.seat_ids, vec!["A1".to_string(), "A2".to_string()]);
                assert_eq!(booking.food.len(), 2);
                assert_eq!(
                    booking.food[0],
                    FoodLine { name: "popcorn".into(), qty: 2, unit_price: 4500 }
                );
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_without_food() {
        let sql = format!(
            "INSERT INTO bookings (id, purchaser, room_id, schedule_id, seats) VALUES \
             ('{ROOM}', 'bob', '{ROOM}', '{SCHEDULE}', ARRAY['C3'])"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { booking } => {
                assert_eq!(booking.seat_ids, vec!["C3".to_string()]);
                assert!(booking.food.is_empty());
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_rejects_batch() {
        let sql = format!(
            "INSERT INTO bookings (id, purchaser, room_id, schedule_id, seats) VALUES \
             ('{ROOM}', 'a', '{ROOM}', '{SCHEDULE}', ARRAY['A1']), \
             ('{SCHEDULE}', 'b', '{ROOM}', '{SCHEDULE}', ARRAY['A2'])"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_food_line_shapes() {
        assert_eq!(
            parse_food_line("nachos grande:3:5500").unwrap(),
            FoodLine { name: "nachos grande".into(), qty: 3, unit_price: 5500 }
        );
        // Names may carry colons; qty and price split from the right
        assert_eq!(
            parse_food_line("combo: large:1:9900").unwrap().name,
            "combo: large"
        );
        assert!(parse_food_line("popcorn").is_err());
        assert!(parse_food_line("popcorn:x:100").is_err());
        assert!(parse_food_line(":1:100").is_err());
    }

    #[test]
    fn parse_update_payment() {
        let sql = format!(
            "UPDATE bookings SET payment_status = 'SUCCESS', payment_id = 'pay_9f' WHERE id = '{ROOM}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdatePayment { booking_id, payment_id, status } => {
                assert_eq!(booking_id.to_string(), ROOM);
                assert_eq!(payment_id, "pay_9f");
                assert_eq!(status, PaymentStatus::Success);
            }
            _ => panic!("expected UpdatePayment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_payment_requires_both_fields() {
        let sql =
            format!("UPDATE bookings SET payment_status = 'SUCCESS' WHERE id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("payment_id"))));

        let sql = format!("UPDATE bookings SET payment_id = 'pay_9f' WHERE id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("payment_status"))));
    }

    #[test]
    fn parse_update_payment_bad_status() {
        let sql = format!(
            "UPDATE bookings SET payment_status = 'MAYBE', payment_id = 'p' WHERE id = '{ROOM}'"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_select_seats() {
        let sql = format!(
            "SELECT * FROM seats WHERE room_id = '{ROOM}' AND schedule_id = '{SCHEDULE}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectSeats { room_id, schedule_id } => {
                assert_eq!(room_id.to_string(), ROOM);
                assert_eq!(schedule_id.to_string(), SCHEDULE);
            }
            _ => panic!("expected SelectSeats, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_seats_requires_showtime() {
        let sql = format!("SELECT * FROM seats WHERE room_id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("schedule_id"))));
    }

    #[test]
    fn parse_select_holds() {
        let sql = format!(
            "SELECT * FROM holds WHERE room_id = '{ROOM}' AND schedule_id = '{SCHEDULE}'"
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectHolds { .. }));
    }

    #[test]
    fn parse_select_booking() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectBooking { .. }));
    }

    #[test]
    fn parse_select_showtimes() {
        assert_eq!(parse_sql("SELECT * FROM showtimes").unwrap(), Command::SelectShowtimes);
    }

    #[test]
    fn parse_listen_quoted_channel() {
        let sql = format!("LISTEN \"seats/{ROOM}/{SCHEDULE}\"");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::Listen { channel } => {
                assert_eq!(channel, format!("seats/{ROOM}/{SCHEDULE}"));
            }
            _ => panic!("expected Listen, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_listen_strips_semicolon() {
        let cmd = parse_sql("LISTEN \"seats/a/b\";").unwrap();
        assert_eq!(cmd, Command::Listen { channel: "seats/a/b".into() });
    }

    #[test]
    fn parse_unlisten_variants() {
        assert_eq!(
            parse_sql("UNLISTEN \"seats/a/b\"").unwrap(),
            Command::Unlisten { channel: "seats/a/b".into() }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
        assert_eq!(parse_sql("UNLISTEN *;").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn parse_listen_keywords_are_whole_words() {
        assert!(parse_sql("UNLISTENFOO").is_err());
        assert!(parse_sql("LISTENERS").is_err());
        assert_eq!(parse_sql("unlisten *").unwrap(), Command::UnlistenAll);
        assert_eq!(
            parse_sql("listen \"seats/a/b\"").unwrap(),
            Command::Listen { channel: "seats/a/b".into() }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO screenings (id) VALUES ('{ROOM}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(
            parse_sql("SELECT * FROM screenings"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(parse_sql("").is_err());
    }

    #[test]
    fn parse_garbage_errors() {
        assert!(matches!(parse_sql("EXPLAIN SELECT 1 FRM"), Err(SqlError::Parse(_))));
    }
}
