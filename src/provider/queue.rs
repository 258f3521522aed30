use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::request::{Request, RequestId, RequestStatus};

#[derive(Default)]
struct QueueState {
    order: VecDeque<RequestId>,
    requests: HashMap<RequestId, Request>,
    batches: VecDeque<Vec<RequestId>>,
}

impl QueueState {
    fn insert(&mut self, request: Request, front: bool) {
        let Some(id) = request.id() else {
            log::error!("refusing to queue request without an id: {request}");
            return;
        };
        self.order.retain(|queued| *queued != id);
        if front {
            self.order.push_front(id);
        } else {
            self.order.push_back(id);
        }
        self.requests.insert(id, request);
    }

    fn remove(&mut self, id: RequestId) -> Option<Request> {
        let request = self.requests.remove(&id)?;
        self.order.retain(|queued| *queued != id);
        Some(request)
    }
}

/// Pending collection shared by the dispatcher, transport callbacks and submitters.
///
/// Requests stay here from enqueue until they reach a terminal status, including
/// while a provider call for them is in flight.
#[derive(Default)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_back(&self, request: Request) {
        self.lock().insert(request, false);
    }

    pub fn push_front(&self, request: Request) {
        self.lock().insert(request, true);
    }

    /// Queue a group of requests to be served by one batch call.
    pub fn push_batch(&self, members: Vec<Request>) {
        let mut state = self.lock();
        let ids: Vec<RequestId> = members.iter().filter_map(Request::id).collect();
        for member in members {
            state.insert(member, false);
        }
        if !ids.is_empty() {
            state.batches.push_back(ids);
        }
    }

    /// Remove and return the first request still waiting to be started.
    pub fn pop_pending(&self) -> Option<Request> {
        let mut state = self.lock();
        let id = state.order.iter().copied().find(|id| {
            state
                .requests
                .get(id)
                .map(|req| req.status() == RequestStatus::Pending)
                .unwrap_or(false)
        })?;
        state.remove(id)
    }

    /// Remove and return the members of the oldest queued batch still present.
    pub fn pop_batch(&self) -> Option<Vec<Request>> {
        let mut state = self.lock();
        while let Some(ids) = state.batches.pop_front() {
            let members: Vec<Request> = ids.into_iter().filter_map(|id| state.remove(id)).collect();
            if !members.is_empty() {
                return Some(members);
            }
        }
        None
    }

    pub fn take(&self, id: RequestId) -> Option<Request> {
        self.lock().remove(id)
    }

    /// Run `apply` against a queued request without removing it.
    pub fn with_request<F, R>(&self, id: RequestId, apply: F) -> Option<R>
    where
        F: FnOnce(&mut Request) -> R,
    {
        self.lock().requests.get_mut(&id).map(apply)
    }

    pub fn get(&self, id: RequestId) -> Option<Request> {
        self.lock().requests.get(&id).cloned()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().requests.contains_key(&id)
    }

    /// Empty the collection, returning requests in queue order.
    pub fn drain(&self) -> Vec<Request> {
        let mut state = self.lock();
        state.batches.clear();
        let order: Vec<RequestId> = state.order.drain(..).collect();
        let mut drained: Vec<Request> = order
            .into_iter()
            .filter_map(|id| state.requests.remove(&id))
            .collect();
        drained.extend(state.requests.drain().map(|(_, req)| req));
        drained
    }

    pub fn has_startable(&self) -> bool {
        let state = self.lock();
        !state.batches.is_empty()
            || state
                .requests
                .values()
                .any(|req| req.status() == RequestStatus::Pending)
    }

    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in queue order, for diagnostics and tests.
    pub fn ids(&self) -> Vec<RequestId> {
        self.lock().order.iter().copied().collect()
    }
}
