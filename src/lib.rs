// Payment References - Core Library
// Structured payment communications, payment requests, EPC QR payloads and
// bank statement reconciliation. Used by the CLI, the API server and tests.

pub mod reference;      // Structured communication: generate / parse / is_valid
pub mod request;        // Payment request values and status rules
pub mod epc;            // EPC QR payload text
pub mod db;             // SQLite storage + audit trail
pub mod reconciliation; // Bank statement matching
pub mod config;
pub mod logging;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use reference::{
    generate, is_valid, parse, PaymentReference, ReferenceError, MAX_SEQUENCE,
};
pub use request::{
    format_amount, parse_amount_cents, NewPaymentRequest, PaymentRequest, PaymentStatus,
    RequestError,
};
pub use epc::{validate_iban, Creditor, EpcError, EpcPayload};
pub use db::{
    count_payment_requests, create_payment_request, find_by_reference, get_events_for_entity,
    get_payment_request, insert_event, list_payment_requests, record_statement_line,
    setup_database, update_status, update_status_in, Event,
};
pub use reconciliation::{
    apply_report, find_reference, load_statement_csv, read_statement, ApplySummary, LineOutcome,
    ReconciledLine, ReconciliationEngine, ReconciliationReport, StatementLine,
};
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
