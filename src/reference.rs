// 🔢 Structured Reference - Belgian structured communication (+++AAA/BBBB/CCCCC+++)
//
// 10 base digits (the sequence number, zero-padded) followed by 2 check digits:
//   check = base mod 97, with a remainder of 0 written as 97
//
// Everything here is pure: no I/O, no shared state. The sequence number is
// handed in by the storage layer, which owns its uniqueness.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest sequence number that fits in the 10 base digits
pub const MAX_SEQUENCE: u64 = 9_999_999_999;

const BASE_DIGITS: usize = 10;
const TOTAL_DIGITS: usize = 12;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// Sequence number outside [0, 9_999_999_999]
    #[error("sequence number {sequence} is out of range (0..={max})")]
    OutOfRange { sequence: i128, max: u64 },

    /// Wrong digit count once non-digits are stripped
    #[error("expected 12 digits, found {found}")]
    Format { found: usize },

    /// Well-formed, but the check digits do not belong to the base digits
    #[error("check digits {claimed:02} do not match expected {expected:02}")]
    ChecksumMismatch { claimed: u8, expected: u8 },
}

// ============================================================================
// PAYMENT REFERENCE
// ============================================================================

/// Immutable structured payment reference.
///
/// Serializes as its formatted string and deserializes through [`parse`],
/// so a stored reference is always re-validated when read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentReference {
    sequence_number: u64,
    check_digits: u8,
}

impl PaymentReference {
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Check digits in 1..=97
    pub fn check_digits(&self) -> u8 {
        self.check_digits
    }

    /// The 12 bare digits, as banks put them in structured remittance fields
    pub fn digits(&self) -> String {
        format!("{:010}{:02}", self.sequence_number, self.check_digits)
    }

    /// Canonical `+++AAA/BBBB/CCCCC+++` form
    pub fn formatted(&self) -> String {
        let digits = self.digits();
        format!("+++{}/{}/{}+++", &digits[0..3], &digits[3..7], &digits[7..12])
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

impl FromStr for PaymentReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl TryFrom<String> for PaymentReference {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse(&value)
    }
}

impl From<PaymentReference> for String {
    fn from(reference: PaymentReference) -> Self {
        reference.formatted()
    }
}

impl TryFrom<i64> for PaymentReference {
    type Error = ReferenceError;

    /// Row ids come out of SQLite as i64
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let sequence = u64::try_from(value).map_err(|_| ReferenceError::OutOfRange {
            sequence: i128::from(value),
            max: MAX_SEQUENCE,
        })?;
        generate(sequence)
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Check digits for a base value: mod 97, zero remainder encoded as 97
pub fn check_digits_for(base: u64) -> u8 {
    match (base % 97) as u8 {
        0 => 97,
        remainder => remainder,
    }
}

/// Build the reference for a sequence number.
///
/// ```
/// let reference = payref::reference::generate(1).unwrap();
/// assert_eq!(reference.formatted(), "+++000/0000/00101+++");
/// ```
pub fn generate(sequence_number: u64) -> Result<PaymentReference, ReferenceError> {
    if sequence_number > MAX_SEQUENCE {
        return Err(ReferenceError::OutOfRange {
            sequence: i128::from(sequence_number),
            max: MAX_SEQUENCE,
        });
    }

    Ok(PaymentReference {
        sequence_number,
        check_digits: check_digits_for(sequence_number),
    })
}

/// Parse a reference, tolerating missing delimiters and whitespace.
///
/// All non-digit characters are dropped before interpretation, so
/// `+++000/0000/00101+++`, `000000000101` and ` 000/0000/00101 ` are equal.
pub fn parse(candidate: &str) -> Result<PaymentReference, ReferenceError> {
    let digits: Vec<u64> = candidate
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(u64::from)
        .collect();

    if digits.len() != TOTAL_DIGITS {
        return Err(ReferenceError::Format {
            found: digits.len(),
        });
    }

    let sequence_number = digits[..BASE_DIGITS]
        .iter()
        .fold(0u64, |acc, d| acc * 10 + d);
    let claimed = (digits[BASE_DIGITS] * 10 + digits[BASE_DIGITS + 1]) as u8;
    let expected = check_digits_for(sequence_number);

    if claimed != expected {
        return Err(ReferenceError::ChecksumMismatch { claimed, expected });
    }

    Ok(PaymentReference {
        sequence_number,
        check_digits: expected,
    })
}

/// True iff [`parse`] succeeds
pub fn is_valid(candidate: &str) -> bool {
    parse(candidate).is_ok()
}

// ============================================================================
// TESTS
// ============================================================================
