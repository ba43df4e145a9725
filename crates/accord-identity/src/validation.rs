//! Validation result accumulator.

use serde::Serialize;

/// Field names shared by every replicated object.
pub mod fields {
    pub const ID: &str = "id";
    pub const REGISTERER: &str = "registerer";
    pub const ADMINISTRATOR: &str = "administrator";
    pub const HISTORY_INDEX: &str = "history_index";
    pub const OLD_OBJECT: &str = "old_object";
}

/// What went wrong with a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required value missing (or left at the unset sentinel).
    Empty,
    /// Value not acceptable for this field.
    Invalid,
    /// Shorter than the minimum.
    TooShort,
    /// Longer than the maximum.
    TooLong,
    /// Numeric value outside its range.
    OutOfRange,
    /// Referenced object does not exist in storage.
    NotFoundReference,
    /// The specified id is already taken in this class.
    IdInUse,
    /// An immutable field differs from the previous version.
    ChangedImmutable,
    /// A monotonic field went backwards.
    Regressed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Invalid => "invalid",
            Self::TooShort => "too short",
            Self::TooLong => "too long",
            Self::OutOfRange => "out of range",
            Self::NotFoundReference => "reference not found",
            Self::IdInUse => "id in use",
            Self::ChangedImmutable => "immutable field changed",
            Self::Regressed => "regressed",
        };
        f.write_str(s)
    }
}

/// A single (field, kind, detail) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: &'static str,
    pub kind: ErrorKind,
    pub detail: Option<String>,
}

/// Accumulates validation errors. Empty means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error without detail.
    pub fn add(&mut self, field: &'static str, kind: ErrorKind) {
        self.errors.push(ValidationError {
            field,
            kind,
            detail: None,
        });
    }

    /// Record an error with a human-readable detail.
    pub fn add_detail(&mut self, field: &'static str, kind: ErrorKind, detail: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            kind,
            detail: Some(detail.into()),
        });
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Whether an error of this kind was recorded for the field.
    pub fn has(&self, field: &str, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.field == field && e.kind == kind)
    }

    /// Append every error from another result.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("valid");
        }
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.kind)?;
            if let Some(detail) = &e.detail {
                write!(f, " ({})", detail)?;
            }
        }
        Ok(())
    }
}
