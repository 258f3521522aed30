use chrono::{Duration, Months};

use super::Request;
use crate::utils::end_of_day;

/// Limits that decide when and how a historical request is split.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    /// Widest span, in days, a provider accepts in one call.
    pub max_window_days: i64,
    /// Overlap added to the remainder so boundary bars are never lost.
    pub buffer_days: i64,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            max_window_days: 365,
            buffer_days: 14,
        }
    }
}

impl PartitionPolicy {
    pub fn needs_partition(&self, request: &Request) -> bool {
        !request.is_partitioned() && request.span_days() > self.max_window_days
    }
}

#[derive(Debug, Clone)]
pub struct PartitionResult {
    /// Whole years ending at the original end.
    pub recent: Request,
    /// Original start through the leftover days plus the buffer.
    pub remainder: Request,
}

/// Split an oversized request in two. Returns `None` for requests that fit the
/// window or were themselves produced by a split.
pub fn partition(request: &Request, policy: &PartitionPolicy) -> Option<PartitionResult> {
    if !policy.needs_partition(request) {
        return None;
    }

    let start = request.start();
    let end = request.end();
    let span_days = request.span_days();

    let years = (span_days / 365).max(1) as u32;
    let recent_start_date = end
        .date()
        .checked_sub_months(Months::new(12 * years))
        .unwrap_or(start.date())
        .max(start.date());
    let recent_start = recent_start_date.and_time(start.time());

    let leftover_days = (recent_start_date - start.date()).num_days();
    let remainder_end_date = start.date() + Duration::days(leftover_days + policy.buffer_days);
    let remainder_end = end_of_day(remainder_end_date).min(end);

    Some(PartitionResult {
        recent: request.derive(recent_start, end),
        remainder: request.derive(start, remainder_end),
    })
}
