use std::collections::VecDeque;

/// Serializes inbound `wc_sessionRequest`s: the application sees one at a
/// time and the next is released when the current one is answered or dropped.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    waiting: VecDeque<u64>,
    active: Option<u64>,
}

impl RequestQueue {
    pub fn push(&mut self, id: u64) {
        if self.active != Some(id) && !self.waiting.contains(&id) {
            self.waiting.push_back(id);
        }
    }

    /// Next request to hand out, if none is in flight.
    pub fn next(&mut self) -> Option<u64> {
        if self.active.is_some() {
            return None;
        }
        self.active = self.waiting.pop_front();
        self.active
    }

    /// Forget `id`, freeing the slot if it was the one in flight.
    pub fn finish(&mut self, id: u64) {
        if self.active == Some(id) {
            self.active = None;
        } else {
            self.waiting.retain(|w| *w != id);
        }
    }

    pub fn active(&self) -> Option<u64> {
        self.active
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.active.is_some())
    }
}
