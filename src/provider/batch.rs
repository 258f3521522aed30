use std::collections::HashMap;

use chrono::NaiveDate;

use crate::request::{Request, RequestKind};

type BatchKey = (RequestKind, NaiveDate, NaiveDate);

/// Group requests by kind and date range, then cut each group into chunks of at
/// most `max_symbols`. Group order follows first appearance.
pub fn group_requests(requests: Vec<Request>, max_symbols: usize) -> Vec<Vec<Request>> {
    let max_symbols = max_symbols.max(1);
    let mut keys: Vec<BatchKey> = Vec::new();
    let mut groups: HashMap<BatchKey, Vec<Request>> = HashMap::new();

    for request in requests {
        let key = (request.kind(), request.start().date(), request.end().date());
        if !groups.contains_key(&key) {
            keys.push(key);
        }
        groups.entry(key).or_default().push(request);
    }

    let mut batches = Vec::new();
    for key in keys {
        let Some(mut group) = groups.remove(&key) else {
            continue;
        };
        while !group.is_empty() {
            let rest = group.split_off(group.len().min(max_symbols));
            batches.push(group);
            group = rest;
        }
    }
    batches
}
