//! Domain rules checked on every write and on every inbound event.
//!
//! The consumer treats a violation as permanent: the event is parked instead
//! of being retried in place.

use crate::auction::AuctionRecord;
use crate::event::{EventEnvelope, SCHEMA_VERSION};
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;

/// First model year accepted.
pub const EARLIEST_MODEL_YEAR: i32 = 1886;

/// A violated domain rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field is blank.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// Model year outside the accepted range.
    #[error("year {year} outside {min}..={max}")]
    YearOutOfRange {
        /// Rejected year
        year: i32,
        /// Earliest accepted
        min: i32,
        /// Latest accepted
        max: i32,
    },

    /// A numeric field is negative.
    #[error("{field} must not be negative, got {value}")]
    Negative {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: i32,
    },

    /// The auction closes before it opens.
    #[error("auction end must be after its start")]
    EndsBeforeStart,

    /// The envelope and snapshot disagree on identity.
    #[error("snapshot identity does not match envelope identity")]
    IdentityMismatch,

    /// The envelope timestamp differs from the snapshot's last modification.
    #[error("envelope timestamp {envelope} does not match snapshot timestamp {snapshot}")]
    TimestampMismatch {
        /// `modified_at` carried by the envelope
        envelope: DateTime<Utc>,
        /// `updated_at` carried by the snapshot
        snapshot: DateTime<Utc>,
    },

    /// A snapshot-carrying event arrived without one.
    #[error("{0} event is missing its snapshot")]
    MissingSnapshot(&'static str),

    /// The envelope schema is newer than this build understands.
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u16),
}

/// Check an auction record against the domain rules.
///
/// The latest accepted model year is one past the year of the record's
/// last modification.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn validate_record(record: &AuctionRecord) -> Result<(), ValidationError> {
    if record.make.trim().is_empty() {
        return Err(ValidationError::EmptyField("make"));
    }
    if record.model.trim().is_empty() {
        return Err(ValidationError::EmptyField("model"));
    }

    let max_year = record.updated_at.year() + 1;
    if !(EARLIEST_MODEL_YEAR..=max_year).contains(&record.year) {
        return Err(ValidationError::YearOutOfRange {
            year: record.year,
            min: EARLIEST_MODEL_YEAR,
            max: max_year,
        });
    }

    for (field, value) in [
        ("mileage", Some(record.mileage)),
        ("reserve price", Some(record.reserve_price)),
        ("sold amount", record.sold_amount),
        ("current high bid", record.current_high_bid),
    ] {
        if let Some(value) = value.filter(|v| *v < 0) {
            return Err(ValidationError::Negative { field, value });
        }
    }

    if record.auction_end <= record.created_at {
        return Err(ValidationError::EndsBeforeStart);
    }
    Ok(())
}

/// Check an inbound envelope before applying it.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn validate_envelope(envelope: &EventEnvelope) -> Result<(), ValidationError> {
    if envelope.schema_version == 0 || envelope.schema_version > SCHEMA_VERSION {
        return Err(ValidationError::UnsupportedSchema(envelope.schema_version));
    }

    match (&envelope.snapshot, envelope.event_type.carries_snapshot()) {
        (Some(snapshot), _) => {
            if snapshot.id != envelope.auction_id {
                return Err(ValidationError::IdentityMismatch);
            }
            if snapshot.updated_at != envelope.modified_at {
                return Err(ValidationError::TimestampMismatch {
                    envelope: envelope.modified_at,
                    snapshot: snapshot.updated_at,
                });
            }
            validate_record(snapshot)
        }
        (None, true) => Err(ValidationError::MissingSnapshot(envelope.event_type.as_str())),
        (None, false) => Ok(()),
    }
}
