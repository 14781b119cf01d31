use serde::Serialize;
use std::fmt;

/// Answer sent back to the weather station
///
/// The station only needs to know the report was received, so this is sent
/// even when some of the values could not be published.
#[derive(Serialize, Debug, PartialEq)]
pub struct ReportStatus {
    /// Always `accepted`
    pub status: &'static str,

    /// Number of distinct keys in the report
    pub num_values: usize,
}

impl fmt::Display for ReportStatus {
    /// Formats the message to a JSON string
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(str) = serde_json::to_string(&self) else {
            return Err(fmt::Error);
        };
        write!(f, "{str}")
    }
}

impl ReportStatus {
    /// Produces the status for a report of `num_values` keys
    pub fn accepted(num_values: usize) -> ReportStatus {
        ReportStatus {
            status: "accepted",
            num_values,
        }
    }
}
