use crate::reconciliation::StatementLine;
use crate::reference::PaymentReference;
use crate::request::{NewPaymentRequest, PaymentRequest, PaymentStatus, RequestError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Event for audit trail (every change is an event)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases silently keep "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Payment requests
    // The AUTOINCREMENT row id is the sequence number behind the reference,
    // so it is never reused, even after deletes.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_uuid TEXT UNIQUE NOT NULL,
            reference TEXT UNIQUE,
            recipient TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'EUR',
            message TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TEXT NOT NULL,
            paid_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Imported bank statement lines (idempotent re-import)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS statement_lines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            communication TEXT NOT NULL,
            counterparty TEXT NOT NULL,
            matched_request_uuid TEXT,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_status ON payment_requests(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// PAYMENT REQUESTS
// ============================================================================

const REQUEST_COLUMNS: &str = "id, request_uuid, reference, recipient, amount_cents, currency,
                               message, status, created_at, paid_at";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Map a row back to a request. The stored reference is re-validated,
/// never regenerated.
fn row_to_request(row: &Row<'_>) -> rusqlite::Result<PaymentRequest> {
    let row_id: i64 = row.get(0)?;
    let reference_str: String = row.get(2)?;
    let status_str: String = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let paid_at_str: Option<String> = row.get(9)?;

    let reference: PaymentReference = reference_str
        .parse()
        .map_err(|e| conversion_error(2, e))?;
    if reference.sequence_number() != row_id as u64 {
        return Err(conversion_error(
            2,
            RequestError::Validation(format!(
                "reference {} does not belong to row {}",
                reference, row_id
            )),
        ));
    }

    let status: PaymentStatus = status_str.parse().map_err(|e| conversion_error(7, e))?;

    Ok(PaymentRequest {
        id: row.get(1)?,
        sequence_number: reference.sequence_number(),
        reference,
        recipient: row.get(3)?,
        amount_cents: row.get(4)?,
        currency: row.get(5)?,
        message: row.get(6)?,
        status,
        created_at: parse_timestamp(8, &created_at_str)?,
        paid_at: paid_at_str
            .as_deref()
            .map(|s| parse_timestamp(9, s))
            .transpose()?,
    })
}

/// Insert a request, derive its reference from the fresh row id, log the event.
pub fn create_payment_request(
    conn: &Connection,
    new: &NewPaymentRequest,
) -> Result<PaymentRequest> {
    let new = new.normalized()?;
    let request_uuid = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO payment_requests (
            request_uuid, recipient, amount_cents, currency, message, status, created_at
        ) VALUES (?1, ?2, ?3, 'EUR', ?4, ?5, ?6)",
        params![
            request_uuid,
            new.recipient,
            new.amount_cents,
            new.message,
            PaymentStatus::Pending.as_str(),
            now.to_rfc3339(),
        ],
    )?;

    let row_id = tx.last_insert_rowid();
    let reference = PaymentReference::try_from(row_id)
        .with_context(|| format!("Sequence number {} cannot be turned into a reference", row_id))?;

    tx.execute(
        "UPDATE payment_requests SET reference = ?1 WHERE id = ?2",
        params![reference.formatted(), row_id],
    )?;

    let event = Event::new(
        "payment_request_created",
        "payment_request",
        &request_uuid,
        serde_json::json!({
            "reference": reference.formatted(),
            "amount_cents": new.amount_cents,
            "recipient": new.recipient,
        }),
        "payment_requests",
    );
    insert_event(&tx, &event)?;

    tx.commit()?;

    info!(
        id = %request_uuid,
        reference = %reference,
        amount_cents = new.amount_cents,
        "payment request created"
    );

    Ok(PaymentRequest {
        id: request_uuid,
        sequence_number: reference.sequence_number(),
        reference,
        recipient: new.recipient,
        amount_cents: new.amount_cents,
        currency: "EUR".to_string(),
        message: new.message,
        status: PaymentStatus::Pending,
        created_at: now,
        paid_at: None,
    })
}

pub fn get_payment_request(conn: &Connection, id: &str) -> Result<Option<PaymentRequest>> {
    let sql = format!(
        "SELECT {} FROM payment_requests WHERE request_uuid = ?1",
        REQUEST_COLUMNS
    );

    let request = conn
        .query_row(&sql, [id], row_to_request)
        .optional()
        .context("Failed to load payment request")?;

    Ok(request)
}

/// Look up by reference; the row id is the sequence number
pub fn find_by_reference(
    conn: &Connection,
    reference: &PaymentReference,
) -> Result<Option<PaymentRequest>> {
    let sql = format!("SELECT {} FROM payment_requests WHERE id = ?1", REQUEST_COLUMNS);
    let row_id = i64::try_from(reference.sequence_number())?;

    let request = conn
        .query_row(&sql, [row_id], row_to_request)
        .optional()
        .context("Failed to look up payment request by reference")?;

    Ok(request)
}

pub fn list_payment_requests(conn: &Connection) -> Result<Vec<PaymentRequest>> {
    let sql = format!("SELECT {} FROM payment_requests ORDER BY id", REQUEST_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;

    let requests = stmt
        .query_map([], row_to_request)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(requests)
}

pub fn count_payment_requests(conn: &Connection) -> Result<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM payment_requests", [], |row| row.get(0))?;

    Ok(count)
}

/// Apply a status transition. Errors carry a [`RequestError`] so callers can
/// tell "not found" and "invalid transition" apart with `downcast_ref`.
pub fn update_status(
    conn: &Connection,
    id: &str,
    status: PaymentStatus,
    actor: &str,
) -> Result<PaymentRequest> {
    let tx = conn.unchecked_transaction()?;
    let request = update_status_in(&tx, id, status, actor)?;
    tx.commit()?;
    Ok(request)
}

/// Same as [`update_status`] but runs inside a transaction the caller owns.
pub fn update_status_in(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    status: PaymentStatus,
    actor: &str,
) -> Result<PaymentRequest> {
    let mut request = get_payment_request(tx, id)?
        .ok_or_else(|| RequestError::NotFound(id.to_string()))?;

    let previous = request.status;
    let next = previous.transition_to(status)?;

    if next == previous {
        debug!(id, status = %next, "status unchanged");
        return Ok(request);
    }

    let paid_at = (next == PaymentStatus::Paid).then(Utc::now);

    tx.execute(
        "UPDATE payment_requests SET status = ?1, paid_at = ?2 WHERE request_uuid = ?3",
        params![next.as_str(), paid_at.map(|dt| dt.to_rfc3339()), id],
    )?;

    let event = Event::new(
        "payment_request_status_changed",
        "payment_request",
        id,
        serde_json::json!({
            "from": previous.as_str(),
            "to": next.as_str(),
            "reference": request.reference.formatted(),
        }),
        actor,
    );
    insert_event(tx, &event)?;

    info!(
        id,
        reference = %request.reference,
        from = %previous,
        to = %next,
        "payment request status changed"
    );

    request.status = next;
    request.paid_at = paid_at;
    Ok(request)
}

// ============================================================================
// STATEMENT LINES
// ============================================================================

/// Remember an imported statement line. Returns false when the same line
/// was imported before.
pub fn record_statement_line(
    conn: &Connection,
    line: &StatementLine,
    matched_request: Option<&str>,
) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO statement_lines (
            idempotency_hash, date, amount_cents, communication, counterparty,
            matched_request_uuid, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            line.compute_idempotency_hash(),
            line.date,
            line.amount_cents,
            line.communication,
            line.counterparty,
            matched_request,
            Utc::now().to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            debug!(
                date = %line.date,
                amount_cents = line.amount_cents,
                "statement line already imported"
            );
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
