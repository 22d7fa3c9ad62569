// ⚖️ Reconciliation Engine - match incoming bank transfers to payment requests
//
// Every credit on a bank statement carries a free-text communication. When it
// holds a valid structured reference that points at an open request with the
// right amount, the request is settled. Everything else stays "unreconciled"
// for a human to look at.

use crate::db;
use crate::reference::{self, PaymentReference, ReferenceError};
use crate::request::{parse_amount_cents, PaymentRequest, PaymentStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use rusqlite::Connection;
use tracing::{debug, info, warn};

// ============================================================================
// STATEMENT LINE (from bank exports)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawStatementLine {
    #[serde(rename = "Date")]
    date: String,

    #[serde(rename = "Amount")]
    amount: String,

    #[serde(rename = "Communication", default)]
    communication: String,

    #[serde(rename = "Counterparty", default)]
    counterparty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub date: String,

    /// Positive for credits, negative for debits
    pub amount_cents: i64,

    pub communication: String,
    pub counterparty: String,
}

impl StatementLine {
    /// Hash used to skip lines that were already imported
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}",
            self.date, self.amount_cents, self.communication, self.counterparty
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// Read a statement CSV with `Date,Amount,Communication,Counterparty` headers
pub fn read_statement<R: Read>(reader: R) -> Result<Vec<StatementLine>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut lines = Vec::new();

    for (index, result) in rdr.deserialize().enumerate() {
        // +2: header row, 1-based
        let row = index + 2;
        let raw: RawStatementLine =
            result.with_context(|| format!("Failed to read statement row {}", row))?;

        let amount_cents = parse_amount_cents(&raw.amount)
            .with_context(|| format!("Invalid amount on statement row {}", row))?;

        lines.push(StatementLine {
            date: raw.date.trim().to_string(),
            amount_cents,
            communication: raw.communication.trim().to_string(),
            counterparty: raw.counterparty.trim().to_string(),
        });
    }

    Ok(lines)
}

pub fn load_statement_csv(path: &Path) -> Result<Vec<StatementLine>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open statement file: {:?}", path))?;

    read_statement(file)
}

// ============================================================================
// FINDING A REFERENCE IN FREE TEXT
// ============================================================================

const DELIMITERS: [&str; 2] = ["+++", "***"];

/// Look for a structured reference in a communication field.
///
/// - `None`: nothing that looks like a reference
/// - `Some(Err(..))`: something reference-shaped that fails validation
pub fn find_reference(text: &str) -> Option<Result<PaymentReference, ReferenceError>> {
    // Only a bare reference is read as a whole; free text must use delimiters
    if text.chars().all(is_reference_char) {
        match reference::parse(text) {
            Ok(found) => return Some(Ok(found)),
            Err(err @ ReferenceError::ChecksumMismatch { .. }) => return Some(Err(err)),
            Err(_) => {}
        }
    }

    for delimiter in DELIMITERS {
        let mut rest = text;
        while let Some(start) = rest.find(delimiter) {
            let after = &rest[start + delimiter.len()..];
            match after.find(delimiter) {
                Some(end) => {
                    let inner = &after[..end];
                    if inner.chars().any(|c| c.is_ascii_digit()) {
                        return Some(reference::parse(inner));
                    }
                    rest = &after[end + delimiter.len()..];
                }
                None => break,
            }
        }
    }

    None
}

fn is_reference_char(c: char) -> bool {
    c.is_ascii_digit() || c.is_whitespace() || matches!(c, '+' | '*' | '/')
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LineOutcome {
    /// Valid reference, open request, amount within tolerance
    Matched {
        request_id: String,
        reference: PaymentReference,
    },

    /// Right request, wrong amount
    AmountMismatch {
        request_id: String,
        reference: PaymentReference,
        expected_cents: i64,
        received_cents: i64,
    },

    /// Request was already paid or cancelled (or matched earlier in this batch)
    AlreadySettled {
        request_id: String,
        reference: PaymentReference,
        status: PaymentStatus,
    },

    /// Valid reference that no request carries
    UnknownReference { reference: PaymentReference },

    /// Reference-shaped but fails the format or checksum check
    InvalidReference { reason: String },

    /// No reference in the communication
    NoReference,

    /// Outgoing money, never matched
    Debit,
}

impl LineOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, LineOutcome::Matched { .. })
    }

    pub fn matched_request_id(&self) -> Option<&str> {
        match self {
            LineOutcome::Matched { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledLine {
    pub line: StatementLine,
    pub outcome: LineOutcome,
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub lines: Vec<ReconciledLine>,
    pub matched_count: usize,
    pub unreconciled_count: usize,
    pub debit_count: usize,
    pub total_matched_cents: i64,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ReconciliationReport {
    pub fn is_fully_reconciled(&self) -> bool {
        self.unreconciled_count == 0
    }

    pub fn unreconciled(&self) -> impl Iterator<Item = &ReconciledLine> {
        self.lines
            .iter()
            .filter(|l| !l.outcome.is_matched() && l.outcome != LineOutcome::Debit)
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation: {} lines, {} matched (EUR {}), {} unreconciled, {} debits",
            self.lines.len(),
            self.matched_count,
            crate::request::format_amount(self.total_matched_cents),
            self.unreconciled_count,
            self.debit_count
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Accepted |received - expected| in cents (default: 0, exact match)
    pub tolerance_cents: i64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine { tolerance_cents: 0 }
    }

    pub fn with_tolerance_cents(tolerance_cents: i64) -> Self {
        ReconciliationEngine {
            tolerance_cents: tolerance_cents.max(0),
        }
    }

    /// Classify every statement line against the known requests.
    ///
    /// A request matches at most once per batch; a second transfer with the
    /// same reference comes back as `AlreadySettled`.
    pub fn reconcile(
        &self,
        lines: &[StatementLine],
        requests: &[PaymentRequest],
    ) -> ReconciliationReport {
        let by_reference: HashMap<PaymentReference, &PaymentRequest> =
            requests.iter().map(|r| (r.reference, r)).collect();
        let mut settled_in_batch: HashSet<&str> = HashSet::new();

        let mut reconciled = Vec::with_capacity(lines.len());
        let mut matched_count = 0;
        let mut unreconciled_count = 0;
        let mut debit_count = 0;
        let mut total_matched_cents: i64 = 0;

        for line in lines {
            let outcome = self.classify(line, &by_reference, &mut settled_in_batch);

            match &outcome {
                LineOutcome::Matched { .. } => {
                    matched_count += 1;
                    total_matched_cents = total_matched_cents.saturating_add(line.amount_cents);
                }
                LineOutcome::Debit => debit_count += 1,
                other => {
                    debug!(date = %line.date, outcome = ?other, "statement line not reconciled");
                    unreconciled_count += 1;
                }
            }

            reconciled.push(ReconciledLine {
                line: line.clone(),
                outcome,
            });
        }

        ReconciliationReport {
            lines: reconciled,
            matched_count,
            unreconciled_count,
            debit_count,
            total_matched_cents,
            reconciled_at: chrono::Utc::now(),
        }
    }

    fn classify<'a>(
        &self,
        line: &StatementLine,
        by_reference: &HashMap<PaymentReference, &'a PaymentRequest>,
        settled_in_batch: &mut HashSet<&'a str>,
    ) -> LineOutcome {
        if line.amount_cents <= 0 {
            return LineOutcome::Debit;
        }

        let reference = match find_reference(&line.communication) {
            None => return LineOutcome::NoReference,
            Some(Err(err)) => {
                return LineOutcome::InvalidReference {
                    reason: err.to_string(),
                }
            }
            Some(Ok(reference)) => reference,
        };

        let request = match by_reference.get(&reference) {
            Some(request) => *request,
            None => return LineOutcome::UnknownReference { reference },
        };

        if request.status.is_terminal() || settled_in_batch.contains(request.id.as_str()) {
            let status = if request.is_open() {
                PaymentStatus::Paid
            } else {
                request.status
            };
            return LineOutcome::AlreadySettled {
                request_id: request.id.clone(),
                reference,
                status,
            };
        }

        if line.amount_cents.abs_diff(request.amount_cents) > self.tolerance_cents.unsigned_abs() {
            return LineOutcome::AmountMismatch {
                request_id: request.id.clone(),
                reference,
                expected_cents: request.amount_cents,
                received_cents: line.amount_cents,
            };
        }

        settled_in_batch.insert(request.id.as_str());
        LineOutcome::Matched {
            request_id: request.id.clone(),
            reference,
        }
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// APPLYING A REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub imported: usize,
    pub duplicates: usize,
    pub marked_paid: usize,
    /// Matched lines whose request was no longer open when the report was applied
    pub settled_elsewhere: usize,
}

/// Store the statement lines and mark matched requests PAID.
///
/// Each line is stored together with its status change in one transaction.
/// Lines imported by an earlier run are skipped entirely. A request that left
/// PENDING after the report was built is not touched; its line is stored
/// unmatched.
pub fn apply_report(conn: &Connection, report: &ReconciliationReport) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    for reconciled in &report.lines {
        let tx = conn.unchecked_transaction()?;

        let mut matched = reconciled.outcome.matched_request_id();
        let mut settled_elsewhere = false;
        if let Some(request_id) = matched {
            let still_open = db::get_payment_request(&tx, request_id)?
                .map(|request| request.is_open())
                .unwrap_or(false);
            if !still_open {
                warn!(id = request_id, "matched request is no longer open, storing line unmatched");
                matched = None;
                settled_elsewhere = true;
            }
        }

        if !db::record_statement_line(&tx, &reconciled.line, matched)? {
            summary.duplicates += 1;
            continue;
        }
        summary.imported += 1;

        if let Some(request_id) = matched {
            db::update_status_in(&tx, request_id, PaymentStatus::Paid, "reconciliation")?;
            summary.marked_paid += 1;
        }
        if settled_elsewhere {
            summary.settled_elsewhere += 1;
        }

        tx.commit()?;
    }

    if summary.duplicates > 0 {
        warn!(duplicates = summary.duplicates, "skipped statement lines imported earlier");
    }
    info!(
        imported = summary.imported,
        marked_paid = summary.marked_paid,
        settled_elsewhere = summary.settled_elsewhere,
        "reconciliation applied"
    );

    Ok(summary)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::generate;
    use chrono::Utc;

    fn create_test_request(
        sequence: u64,
        amount_cents: i64,
        status: PaymentStatus,
    ) -> PaymentRequest {
        PaymentRequest {
            id: format!("req-{}", sequence),
            sequence_number: sequence,
            reference: generate(sequence).unwrap(),
            recipient: "Test Client".to_string(),
            amount_cents,
            currency: "EUR".to_string(),
            message: None,
            status,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    fn create_test_line(amount_cents: i64, communication: &str) -> StatementLine {
        StatementLine {
            date: "2025-03-14".to_string(),
            amount_cents,
            communication: communication.to_string(),
            counterparty: "Test Payer".to_string(),
        }
    }

    #[test]
    fn test_find_reference_variants() {
        let expected = generate(1).unwrap();

        assert_eq!(find_reference("+++000/0000/00101+++"), Some(Ok(expected)));
        assert_eq!(find_reference("000000000101"), Some(Ok(expected)));
        assert_eq!(
            find_reference("Factuur 2025-14 +++000/0000/00101+++ bedankt"),
            Some(Ok(expected))
        );
        assert_eq!(find_reference("ref ***000/0000/00101*** 3 plans"), Some(Ok(expected)));
        assert_eq!(find_reference("Factuur 2025-14"), None);
        assert_eq!(find_reference(""), None);
        assert!(matches!(
            find_reference("+++000/0000/00199+++"),
            Some(Err(ReferenceError::ChecksumMismatch { .. }))
        ));
        assert!(matches!(
            find_reference("betaling +++000/0000/001+++ plan 7"),
            Some(Err(ReferenceError::Format { found: 10 }))
        ));
    }

    #[test]
    fn test_find_reference_ignores_digits_scattered_in_free_text() {
        // The digits alone would spell +++202/5030/00192+++, a valid reference
        assert!(reference::is_valid("202503000192"));

        assert_eq!(find_reference("Factuur 2025030 perceel 00192"), None);
        assert_eq!(find_reference("invoice 202503000192"), None);
        assert_eq!(find_reference(" 202/5030/00192 "), Some(reference::parse("202503000192")));
    }

    #[test]
    fn test_reconcile_total_saturates() {
        let engine = ReconciliationEngine::with_tolerance_cents(i64::MAX);
        let requests = vec![
            create_test_request(1, 1, PaymentStatus::Pending),
            create_test_request(2, 1, PaymentStatus::Pending),
        ];
        let huge = i64::MAX / 2 + 10;
        let lines = vec![
            create_test_line(huge, "+++000/0000/00101+++"),
            create_test_line(huge, "+++000/0000/00202+++"),
        ];

        let report = engine.reconcile(&lines, &requests);

        assert_eq!(report.matched_count, 2);
        assert_eq!(report.total_matched_cents, i64::MAX);
    }

    #[test]
    fn test_reconcile_matched() {
        let engine = ReconciliationEngine::new();
        let requests = vec![
            create_test_request(1, 12_550, PaymentStatus::Pending),
            create_test_request(2, 45_000, PaymentStatus::Pending),
        ];
        let lines = vec![
            create_test_line(12_550, "+++000/0000/00101+++"),
            create_test_line(45_000, "000/0000/00202"),
        ];

        let report = engine.reconcile(&lines, &requests);

        assert_eq!(report.matched_count, 2);
        assert_eq!(report.unreconciled_count, 0);
        assert_eq!(report.total_matched_cents, 57_550);
        assert!(report.is_fully_reconciled());
        assert_eq!(report.lines[0].outcome.matched_request_id(), Some("req-1"));
    }

    #[test]
    fn test_reconcile_unreconciled_outcomes() {
        let engine = ReconciliationEngine::new();
        let requests = vec![
            create_test_request(1, 12_550, PaymentStatus::Pending),
            create_test_request(2, 100, PaymentStatus::Cancelled),
        ];
        let lines = vec![
            create_test_line(12_000, "+++000/0000/00101+++"), // wrong amount
            create_test_line(100, "+++000/0000/00202+++"),    // cancelled
            create_test_line(500, "+++000/0000/00303+++"),    // unknown
            create_test_line(500, "+++000/0000/00399+++"),    // bad checksum
            create_test_line(500, "thanks for the plans"),    // nothing
            create_test_line(-2_000, "+++000/0000/00101+++"), // debit
        ];

        let report = engine.reconcile(&lines, &requests);
        let outcomes: Vec<&LineOutcome> = report.lines.iter().map(|l| &l.outcome).collect();

        assert!(matches!(
            outcomes[0],
            LineOutcome::AmountMismatch { expected_cents: 12_550, received_cents: 12_000, .. }
        ));
        assert!(matches!(
            outcomes[1],
            LineOutcome::AlreadySettled { status: PaymentStatus::Cancelled, .. }
        ));
        assert!(matches!(outcomes[2], LineOutcome::UnknownReference { .. }));
        assert!(matches!(outcomes[3], LineOutcome::InvalidReference { .. }));
        assert_eq!(outcomes[4], &LineOutcome::NoReference);
        assert_eq!(outcomes[5], &LineOutcome::Debit);

        assert_eq!(report.matched_count, 0);
        assert_eq!(report.unreconciled_count, 5);
        assert_eq!(report.debit_count, 1);
        assert_eq!(report.unreconciled().count(), 5);
    }

    #[test]
    fn test_reconcile_double_payment_in_same_batch() {
        let engine = ReconciliationEngine::new();
        let requests = vec![create_test_request(7, 1_000, PaymentStatus::Pending)];
        let reference = generate(7).unwrap().formatted();
        let lines = vec![
            create_test_line(1_000, &reference),
            create_test_line(1_000, &reference),
        ];

        let report = engine.reconcile(&lines, &requests);

        assert!(report.lines[0].outcome.is_matched());
        assert!(matches!(
            report.lines[1].outcome,
            LineOutcome::AlreadySettled { status: PaymentStatus::Paid, .. }
        ));
    }

    #[test]
    fn test_reconcile_with_tolerance() {
        let engine = ReconciliationEngine::with_tolerance_cents(5);
        let requests = vec![create_test_request(1, 10_000, PaymentStatus::Pending)];

        let close = engine.reconcile(&[create_test_line(9_996, "+++000/0000/00101+++")], &requests);
        assert_eq!(close.matched_count, 1);

        let far = engine.reconcile(&[create_test_line(9_990, "+++000/0000/00101+++")], &requests);
        assert_eq!(far.matched_count, 0);
    }

    #[test]
    fn test_read_statement_csv() {
        let csv = "Date,Amount,Communication,Counterparty\n\
                   2025-03-14,\"125,50\",+++000/0000/00101+++,Jan Peeters\n\
                   2025-03-15,-20.00,Bank costs,\n";

        let lines = read_statement(csv.as_bytes()).unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].amount_cents, 12_550);
        assert_eq!(lines[0].communication, "+++000/0000/00101+++");
        assert_eq!(lines[1].amount_cents, -2_000);
        assert_eq!(lines[1].counterparty, "");
    }

    #[test]
    fn test_read_statement_rejects_bad_amount() {
        let csv = "Date,Amount,Communication,Counterparty\n2025-03-14,lots,x,y\n";

        let err = read_statement(csv.as_bytes()).unwrap_err();

        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_idempotency_hash_is_stable() {
        let a = create_test_line(100, "+++000/0000/00101+++");
        let b = create_test_line(100, "+++000/0000/00101+++");
        let c = create_test_line(101, "+++000/0000/00101+++");

        assert_eq!(a.compute_idempotency_hash(), b.compute_idempotency_hash());
        assert_ne!(a.compute_idempotency_hash(), c.compute_idempotency_hash());
        assert_eq!(a.compute_idempotency_hash().len(), 64);
    }

    #[test]
    fn test_apply_report_marks_paid_once() {
        use crate::request::NewPaymentRequest;

        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let request =
            db::create_payment_request(&conn, &NewPaymentRequest::new("Jan", 12_550, None))
                .unwrap();

        let engine = ReconciliationEngine::new();
        let lines = vec![
            create_test_line(12_550, &request.reference.formatted()),
            create_test_line(300, "unrelated"),
        ];

        let report = engine.reconcile(&lines, &db::list_payment_requests(&conn).unwrap());
        let summary = apply_report(&conn, &report).unwrap();

        assert_eq!(
            summary,
            ApplySummary {
                imported: 2,
                duplicates: 0,
                marked_paid: 1,
                settled_elsewhere: 0,
            }
        );
        let stored = db::get_payment_request(&conn, &request.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);

        // Same statement again: nothing new
        let again = engine.reconcile(&lines, &db::list_payment_requests(&conn).unwrap());
        let summary = apply_report(&conn, &again).unwrap();
        assert_eq!(summary.imported, 0);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.marked_paid, 0);
    }

    #[test]
    fn test_apply_report_skips_requests_closed_after_reconcile() {
        use crate::request::NewPaymentRequest;

        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let cancelled =
            db::create_payment_request(&conn, &NewPaymentRequest::new("Jan", 12_550, None))
                .unwrap();
        let open =
            db::create_payment_request(&conn, &NewPaymentRequest::new("Els", 4_000, None))
                .unwrap();

        let engine = ReconciliationEngine::new();
        let lines = vec![
            create_test_line(12_550, &cancelled.reference.formatted()),
            create_test_line(4_000, &open.reference.formatted()),
        ];
        let report = engine.reconcile(&lines, &db::list_payment_requests(&conn).unwrap());
        assert_eq!(report.matched_count, 2);

        // Cancelled between building the report and applying it
        db::update_status(&conn, &cancelled.id, PaymentStatus::Cancelled, "admin").unwrap();

        let summary = apply_report(&conn, &report).unwrap();

        assert_eq!(summary.imported, 2);
        assert_eq!(summary.marked_paid, 1);
        assert_eq!(summary.settled_elsewhere, 1);

        let stored = db::get_payment_request(&conn, &cancelled.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
        let stored = db::get_payment_request(&conn, &open.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);

        let matched: Option<String> = conn
            .query_row(
                "SELECT matched_request_uuid FROM statement_lines WHERE amount_cents = 12550",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(matched, None);

        let summary = apply_report(&conn, &report).unwrap();
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.marked_paid, 0);
    }
}
