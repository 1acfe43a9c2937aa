use crate::manager::WaitingRequest;
use std::collections::VecDeque;
use strata_interfaces::p2p::priority::Priority;

/// Two bounded FIFO queues of waiting requests, popped high-priority first.
pub(crate) struct RequestQueues {
    high: VecDeque<WaitingRequest>,
    low: VecDeque<WaitingRequest>,
    capacity: usize,
}

impl RequestQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { high: VecDeque::new(), low: VecDeque::new(), capacity }
    }

    /// Push a request at the given priority. Returns the request back when
    /// the queue is at capacity.
    pub(crate) fn push(
        &mut self,
        req: WaitingRequest,
        priority: Priority,
    ) -> Result<(), WaitingRequest> {
        let queue = match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.low,
        };
        if queue.len() >= self.capacity {
            return Err(req)
        }
        queue.push_back(req);
        Ok(())
    }

    /// Pop the highest-priority waiting request.
    pub(crate) fn pop(&mut self) -> Option<WaitingRequest> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    /// Remove a request by its submission token, wherever it is queued.
    pub(crate) fn remove(&mut self, token: u64) -> Option<WaitingRequest> {
        for queue in [&mut self.high, &mut self.low] {
            if let Some(pos) = queue.iter().position(|req| req.token == token) {
                return queue.remove(pos)
            }
        }
        None
    }

    pub(crate) fn clear(&mut self) {
        self.high.clear();
        self.low.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }
}
