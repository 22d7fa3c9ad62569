// 🧾 Payment Request - what a client is asked to pay
//
// The storage layer assigns the sequence number (and therefore the
// reference); this module only holds the values and the status rules.

use crate::reference::PaymentReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// EPC QR caps the amount at 999,999,999.99 EUR
pub const MAX_AMOUNT_CENTS: i64 = 99_999_999_999;
pub const MAX_RECIPIENT_CHARS: usize = 70;
pub const MAX_MESSAGE_CHARS: usize = 140;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid payment request: {0}")]
    Validation(String),

    #[error("unknown payment status: {0}")]
    UnknownStatus(String),

    #[error("cannot change status from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("payment request not found: {0}")]
    NotFound(String),
}

// ============================================================================
// PAYMENT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Only PENDING moves. Re-applying the current status is a no-op.
    pub fn transition_to(self, next: PaymentStatus) -> Result<PaymentStatus, RequestError> {
        match (self, next) {
            (current, next) if current == next => Ok(current),
            (PaymentStatus::Pending, PaymentStatus::Paid)
            | (PaymentStatus::Pending, PaymentStatus::Cancelled) => Ok(next),
            (from, to) => Err(RequestError::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "CANCELLED" | "CANCELED" => Ok(PaymentStatus::Cancelled),
            _ => Err(RequestError::UnknownStatus(s.to_string())),
        }
    }
}

// ============================================================================
// NEW PAYMENT REQUEST (input)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPaymentRequest {
    pub recipient: String,

    /// Minor currency units (euro cents)
    #[serde(rename = "amount")]
    pub amount_cents: i64,

    #[serde(default)]
    pub message: Option<String>,
}

impl NewPaymentRequest {
    pub fn new(recipient: &str, amount_cents: i64, message: Option<&str>) -> Self {
        NewPaymentRequest {
            recipient: recipient.to_string(),
            amount_cents,
            message: message.map(str::to_string),
        }
    }

    /// Trim text fields, drop blank messages, check limits
    pub fn normalized(&self) -> Result<NewPaymentRequest, RequestError> {
        let recipient = self.recipient.trim().to_string();
        if recipient.is_empty() {
            return Err(RequestError::Validation("recipient is required".to_string()));
        }
        if recipient.chars().count() > MAX_RECIPIENT_CHARS {
            return Err(RequestError::Validation(format!(
                "recipient is longer than {} characters",
                MAX_RECIPIENT_CHARS
            )));
        }

        if self.amount_cents <= 0 || self.amount_cents > MAX_AMOUNT_CENTS {
            return Err(RequestError::Validation(format!(
                "amount must be between 1 and {} cents, got {}",
                MAX_AMOUNT_CENTS, self.amount_cents
            )));
        }

        let message = self
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        if let Some(m) = &message {
            if m.chars().count() > MAX_MESSAGE_CHARS {
                return Err(RequestError::Validation(format!(
                    "message is longer than {} characters",
                    MAX_MESSAGE_CHARS
                )));
            }
        }

        Ok(NewPaymentRequest {
            recipient,
            amount_cents: self.amount_cents,
            message,
        })
    }
}

// ============================================================================
// PAYMENT REQUEST (stored)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Public identity (UUID)
    pub id: String,

    /// Storage-assigned ordinal, source of the reference
    pub sequence_number: u64,

    pub reference: PaymentReference,
    pub recipient: String,

    #[serde(rename = "amount")]
    pub amount_cents: i64,

    pub currency: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentRequest {
    pub fn is_open(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    /// Amount as "12.50"
    pub fn display_amount(&self) -> String {
        format_amount(self.amount_cents)
    }
}

// ============================================================================
// AMOUNTS
// ============================================================================

pub fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a decimal amount into cents.
///
/// Accepts `.` or `,` as decimal separator, a leading sign and spaces as
/// thousands separators ("1 234,56"). At most two decimals.
pub fn parse_amount_cents(input: &str) -> Result<i64, RequestError> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();

    let invalid = || RequestError::InvalidAmount(input.to_string());

    let (negative, body) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(cleaned.as_str())),
    };

    if body.is_empty() {
        return Err(invalid());
    }

    let (whole, fraction) = match body.find(|c: char| c == '.' || c == ',') {
        Some(pos) => (&body[..pos], &body[pos + 1..]),
        None => (body, ""),
    };

    if whole.is_empty()
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
        || fraction.len() > 2
    {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let fraction: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };

    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(fraction))
        .ok_or_else(invalid)?;

    Ok(if negative { -cents } else { cents })
}
