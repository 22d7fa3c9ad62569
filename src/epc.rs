// 📱 EPC QR Payload - SEPA credit transfer QR code text (EPC069-12, version 002)
//
// The payload is plain text, one element per line:
//
//   BCD / 002 / 1 / SCT / BIC / name / IBAN / EUR<amount> / purpose /
//   structured remittance / unstructured remittance / information
//
// Trailing empty elements are left out. Rendering the QR image itself is the
// client's job; this module only produces and checks the text.

use crate::request::{format_amount, PaymentRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SERVICE_TAG: &str = "BCD";
const VERSION: &str = "002";
const CHARSET_UTF8: &str = "1";
const IDENTIFICATION: &str = "SCT";

pub const MAX_NAME_CHARS: usize = 70;
pub const MAX_STRUCTURED_CHARS: usize = 35;
pub const MAX_UNSTRUCTURED_CHARS: usize = 140;
pub const MAX_INFORMATION_CHARS: usize = 70;
pub const MAX_PAYLOAD_BYTES: usize = 331;
pub const MIN_AMOUNT_CENTS: i64 = 1;
pub const MAX_AMOUNT_CENTS: i64 = 99_999_999_999;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EpcError {
    #[error("invalid IBAN: {0}")]
    InvalidIban(String),

    #[error("invalid BIC: {0}")]
    InvalidBic(String),

    #[error("beneficiary name must be 1-70 characters")]
    InvalidName,

    #[error("amount {0} cents is outside 0.01-999999999.99 EUR")]
    InvalidAmount(i64),

    #[error("purpose code must be 4 alphanumeric characters: {0}")]
    InvalidPurpose(String),

    #[error("{field} is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("structured and unstructured remittance are mutually exclusive")]
    ConflictingRemittance,

    #[error("payload is {0} bytes, limit is 331")]
    PayloadTooLarge(usize),
}

// ============================================================================
// CREDITOR (beneficiary)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creditor {
    pub name: String,
    pub iban: String,
    #[serde(default)]
    pub bic: Option<String>,
}

impl Creditor {
    pub fn validate(&self) -> Result<(), EpcError> {
        check_name(&self.name)?;
        validate_iban(&self.iban)?;
        if let Some(bic) = &self.bic {
            validate_bic(bic)?;
        }
        Ok(())
    }
}

// ============================================================================
// IBAN / BIC
// ============================================================================

/// Remove spaces and uppercase
pub fn normalize_iban(iban: &str) -> String {
    iban.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// ISO 13616 check: move the first 4 chars to the end, letters become
/// 10..35, the resulting number mod 97 must be 1.
pub fn validate_iban(iban: &str) -> Result<String, EpcError> {
    let normalized = normalize_iban(iban);
    let invalid = || EpcError::InvalidIban(iban.to_string());

    if normalized.len() < 15 || normalized.len() > 34 {
        return Err(invalid());
    }

    let bytes = normalized.as_bytes();
    if !bytes[0..2].iter().all(u8::is_ascii_uppercase)
        || !bytes[2..4].iter().all(u8::is_ascii_digit)
        || !bytes.iter().all(u8::is_ascii_alphanumeric)
    {
        return Err(invalid());
    }

    let rearranged = normalized[4..].chars().chain(normalized[..4].chars());
    let mut remainder: u32 = 0;
    for c in rearranged {
        // to_digit(36) maps 0-9 to 0-9 and A-Z to 10-35
        let value = c.to_digit(36).ok_or_else(invalid)?;
        remainder = if value < 10 {
            (remainder * 10 + value) % 97
        } else {
            (remainder * 100 + value) % 97
        };
    }

    if remainder == 1 {
        Ok(normalized)
    } else {
        Err(invalid())
    }
}

pub fn validate_bic(bic: &str) -> Result<(), EpcError> {
    let bic = bic.trim();
    let well_formed = (bic.len() == 8 || bic.len() == 11)
        && bic.chars().all(|c| c.is_ascii_alphanumeric())
        && bic[..6].chars().all(|c| c.is_ascii_alphabetic());

    if well_formed {
        Ok(())
    } else {
        Err(EpcError::InvalidBic(bic.to_string()))
    }
}

fn check_name(name: &str) -> Result<(), EpcError> {
    let count = name.trim().chars().count();
    if count == 0 || count > MAX_NAME_CHARS {
        return Err(EpcError::InvalidName);
    }
    Ok(())
}

fn check_len(value: &str, field: &'static str, max: usize) -> Result<(), EpcError> {
    if value.chars().count() > max {
        return Err(EpcError::TooLong { field, max });
    }
    Ok(())
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

// ============================================================================
// PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpcPayload {
    pub bic: String,
    pub name: String,
    pub iban: String,
    pub amount_cents: i64,
    pub purpose: String,
    pub structured_remittance: String,
    pub unstructured_remittance: String,
    pub information: String,
}

impl EpcPayload {
    pub fn new(creditor: &Creditor, amount_cents: i64) -> Self {
        EpcPayload {
            bic: creditor.bic.clone().unwrap_or_default(),
            name: creditor.name.trim().to_string(),
            iban: normalize_iban(&creditor.iban),
            amount_cents,
            ..Default::default()
        }
    }

    /// Payload for a stored request: reference digits in the structured
    /// field, request message (cut to 70 chars) as information line.
    pub fn for_request(creditor: &Creditor, request: &PaymentRequest) -> Self {
        let mut payload = EpcPayload::new(creditor, request.amount_cents)
            .with_structured_remittance(&request.reference.digits());

        if let Some(message) = &request.message {
            payload = payload.with_information(&truncate_chars(message, MAX_INFORMATION_CHARS));
        }

        payload
    }

    pub fn with_purpose(mut self, purpose: &str) -> Self {
        self.purpose = purpose.trim().to_uppercase();
        self
    }

    pub fn with_structured_remittance(mut self, reference: &str) -> Self {
        self.structured_remittance = reference.trim().to_string();
        self
    }

    pub fn with_unstructured_remittance(mut self, text: &str) -> Self {
        self.unstructured_remittance = text.trim().to_string();
        self
    }

    pub fn with_information(mut self, text: &str) -> Self {
        self.information = text.trim().to_string();
        self
    }

    pub fn validate(&self) -> Result<(), EpcError> {
        check_name(&self.name)?;
        validate_iban(&self.iban)?;

        if !self.bic.is_empty() {
            validate_bic(&self.bic)?;
        }

        if !(MIN_AMOUNT_CENTS..=MAX_AMOUNT_CENTS).contains(&self.amount_cents) {
            return Err(EpcError::InvalidAmount(self.amount_cents));
        }

        if !self.purpose.is_empty()
            && (self.purpose.len() != 4 || !self.purpose.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(EpcError::InvalidPurpose(self.purpose.clone()));
        }

        if !self.structured_remittance.is_empty() && !self.unstructured_remittance.is_empty() {
            return Err(EpcError::ConflictingRemittance);
        }

        check_len(&self.structured_remittance, "structured remittance", MAX_STRUCTURED_CHARS)?;
        check_len(
            &self.unstructured_remittance,
            "unstructured remittance",
            MAX_UNSTRUCTURED_CHARS,
        )?;
        check_len(&self.information, "information", MAX_INFORMATION_CHARS)?;

        Ok(())
    }

    /// Validate and render the payload text
    pub fn encode(&self) -> Result<String, EpcError> {
        self.validate()?;

        let amount = format!("EUR{}", format_amount(self.amount_cents));
        let mut lines = vec![
            SERVICE_TAG,
            VERSION,
            CHARSET_UTF8,
            IDENTIFICATION,
            self.bic.as_str(),
            self.name.as_str(),
            self.iban.as_str(),
            amount.as_str(),
            self.purpose.as_str(),
            self.structured_remittance.as_str(),
            self.unstructured_remittance.as_str(),
            self.information.as_str(),
        ];

        while lines.last().map_or(false, |line| line.is_empty()) {
            lines.pop();
        }

        let text = lines.join("\n");
        if text.len() > MAX_PAYLOAD_BYTES {
            return Err(EpcError::PayloadTooLarge(text.len()));
        }

        Ok(text)
    }
}

// ============================================================================
// TESTS
// ============================================================================
