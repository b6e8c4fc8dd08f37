//! Keeps downstream responses in request-arrival order.
//!
//! Filters may complete responses out of order (a short-circuited
//! request answers immediately while earlier requests still wait on
//! the upstream broker). A completion for correlation id `c` buffers
//! until every earlier id has been emitted, then flushes in order.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OrdererError {
    #[error("completion for unknown correlation id {0}")]
    UnknownCorrelation(i32),
    #[error("duplicate completion for correlation id {0}")]
    DuplicateCompletion(i32),
}

#[derive(Default)]
pub struct ResponseOrderer {
    /// Correlation ids awaiting a response, in request arrival order.
    pending: VecDeque<i32>,
    /// Responses that completed ahead of an earlier id.
    ready: HashMap<i32, Bytes>,
}

impl ResponseOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a request that will produce a response. Must be called in
    /// arrival order.
    pub fn register(&mut self, correlation_id: i32) {
        self.pending.push_back(correlation_id);
    }

    /// Record the encoded response for `correlation_id` and return
    /// every frame that is now flushable, in order.
    pub fn complete(
        &mut self,
        correlation_id: i32,
        frame: Bytes,
    ) -> Result<Vec<Bytes>, OrdererError> {
        if !self.pending.contains(&correlation_id) {
            return Err(OrdererError::UnknownCorrelation(correlation_id));
        }
        if self.ready.insert(correlation_id, frame).is_some() {
            return Err(OrdererError::DuplicateCompletion(correlation_id));
        }

        Ok(self.drain())
    }

    /// Forget a registered correlation id whose response was dropped,
    /// so it does not block everything behind it.
    pub fn cancel(&mut self, correlation_id: i32) -> Result<Vec<Bytes>, OrdererError> {
        let position = self
            .pending
            .iter()
            .position(|cid| *cid == correlation_id)
            .ok_or(OrdererError::UnknownCorrelation(correlation_id))?;
        self.pending.remove(position);
        self.ready.remove(&correlation_id);
        Ok(self.drain())
    }

    fn drain(&mut self) -> Vec<Bytes> {
        let mut flushable = Vec::new();
        while let Some(head) = self.pending.front() {
            match self.ready.remove(head) {
                Some(frame) => {
                    flushable.push(frame);
                    self.pending.pop_front();
                }
                None => break,
            }
        }
        flushable
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::copy_from_slice(&[tag])
    }

    #[test]
    fn in_order_completions_flush_immediately() {
        let mut orderer = ResponseOrderer::new();
        orderer.register(1);
        orderer.register(2);

        assert_eq!(orderer.complete(1, frame(1)).unwrap(), vec![frame(1)]);
        assert_eq!(orderer.complete(2, frame(2)).unwrap(), vec![frame(2)]);
        assert_eq!(orderer.in_flight(), 0);
    }

    #[test]
    fn out_of_order_completions_flush_in_arrival_order() {
        let mut orderer = ResponseOrderer::new();
        for cid in [1, 2, 3] {
            orderer.register(cid);
        }

        // Completion order r3, r1, r2 must emerge as r1, r2, r3.
        assert!(orderer.complete(3, frame(3)).unwrap().is_empty());
        assert_eq!(orderer.complete(1, frame(1)).unwrap(), vec![frame(1)]);
        assert_eq!(
            orderer.complete(2, frame(2)).unwrap(),
            vec![frame(2), frame(3)]
        );
        assert_eq!(orderer.in_flight(), 0);
    }

    #[test]
    fn buffered_responses_wait_for_the_head() {
        let mut orderer = ResponseOrderer::new();
        for cid in [10, 20, 30] {
            orderer.register(cid);
        }

        assert!(orderer.complete(20, frame(2)).unwrap().is_empty());
        assert!(orderer.complete(30, frame(3)).unwrap().is_empty());
        assert_eq!(orderer.in_flight(), 3);

        assert_eq!(
            orderer.complete(10, frame(1)).unwrap(),
            vec![frame(1), frame(2), frame(3)]
        );
    }

    #[test]
    fn cancelled_ids_unblock_later_responses() {
        let mut orderer = ResponseOrderer::new();
        for cid in [1, 2, 3] {
            orderer.register(cid);
        }

        assert!(orderer.complete(2, frame(2)).unwrap().is_empty());
        assert!(orderer.complete(3, frame(3)).unwrap().is_empty());

        // Dropping r1's response releases r2 and r3.
        assert_eq!(
            orderer.cancel(1).unwrap(),
            vec![frame(2), frame(3)]
        );
        assert_eq!(orderer.in_flight(), 0);
    }

    #[test]
    fn unknown_and_duplicate_completions_are_errors() {
        let mut orderer = ResponseOrderer::new();
        orderer.register(1);
        orderer.register(2);

        assert_eq!(
            orderer.complete(9, frame(9)).unwrap_err(),
            OrdererError::UnknownCorrelation(9)
        );

        assert!(orderer.complete(2, frame(2)).unwrap().is_empty());
        assert_eq!(
            orderer.complete(2, frame(2)).unwrap_err(),
            OrdererError::DuplicateCompletion(2)
        );
    }
}
