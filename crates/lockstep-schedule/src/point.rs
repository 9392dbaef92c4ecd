//! The unit record of a schedule.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Literal line marking a schedule whose run completed cleanly.
///
/// Its absence tells explore mode the recorded prefix was cut short
/// (crash, or the host never finalized the log) and must be repeated.
pub const END_MARKER: &str = "END";

/// One scheduling decision.
///
/// `available` and `higher` capture enough of the decision context to
/// both validate a replay and drive the depth-first frontier:
/// incrementing `thread_id` is only legal while `higher > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedPoint {
    /// User-assigned id of the thread chosen to run.
    pub thread_id: usize,
    /// Number of subscribed threads at the moment of the decision.
    pub available: usize,
    /// Number of subscribed ids strictly greater than `thread_id`.
    pub higher: usize,
}

/// Errors from parsing one schedule record line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PointParseError {
    #[error("expected three fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid numeric field {field:?}")]
    Numeric { field: String },

    #[error("higher count {higher} must be below available count {available}")]
    Counts { higher: usize, available: usize },
}

impl SchedPoint {
    /// Create a point, asserting the record invariant.
    pub fn new(thread_id: usize, available: usize, higher: usize) -> SchedPoint {
        debug_assert!(higher < available, "higher must be below available");
        SchedPoint {
            thread_id,
            available,
            higher,
        }
    }
}

impl fmt::Display for SchedPoint {
    /// The wire format: three decimal naturals separated by spaces.
    /// The record terminator (newline) is the store's concern.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.thread_id, self.available, self.higher)
    }
}

impl FromStr for SchedPoint {
    type Err = PointParseError;

    fn from_str(line: &str) -> Result<SchedPoint, PointParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(PointParseError::FieldCount {
                found: fields.len(),
            });
        }

        let mut values = [0usize; 3];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().map_err(|_| PointParseError::Numeric {
                field: (*field).to_owned(),
            })?;
        }

        let [thread_id, available, higher] = values;
        if higher >= available {
            return Err(PointParseError::Counts { higher, available });
        }

        Ok(SchedPoint {
            thread_id,
            available,
            higher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let point = SchedPoint::new(3, 5, 1);
        let parsed: SchedPoint = point.to_string().parse().unwrap();
        assert_eq!(parsed, point);
    }

    #[test]
    fn parse_tolerates_extra_spacing() {
        let parsed: SchedPoint = "  7   9  0 ".parse().unwrap();
        assert_eq!(parsed, SchedPoint::new(7, 9, 0));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            "1 2".parse::<SchedPoint>(),
            Err(PointParseError::FieldCount { found: 2 })
        );
        assert_eq!(
            "1 2 3 4".parse::<SchedPoint>(),
            Err(PointParseError::FieldCount { found: 4 })
        );
        assert!(matches!(
            "".parse::<SchedPoint>(),
            Err(PointParseError::FieldCount { found: 0 })
        ));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert_eq!(
            "1 x 0".parse::<SchedPoint>(),
            Err(PointParseError::Numeric {
                field: "x".to_owned()
            })
        );
        assert!("END".parse::<SchedPoint>().is_err());
        assert!("-1 2 0".parse::<SchedPoint>().is_err());
    }

    #[test]
    fn rejects_higher_not_below_available() {
        assert_eq!(
            "1 2 2".parse::<SchedPoint>(),
            Err(PointParseError::Counts {
                higher: 2,
                available: 2
            })
        );
    }
}
