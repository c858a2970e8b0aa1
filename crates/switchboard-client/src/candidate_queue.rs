use switchboard_core::NetworkCandidate;

/// Outcome of handing a remote candidate to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// Remote description is already set; apply the candidate now.
    Deliver(NetworkCandidate),
    /// Held until the remote description is set.
    Buffered,
}

/// Holds remote candidates for one side of a negotiation until that side's
/// transport engine has a remote description.
///
/// Candidates come back out in exactly the order they went in. Nothing is
/// reordered or deduplicated.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<NetworkCandidate>,
    ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: NetworkCandidate) -> Enqueued {
        if self.ready {
            Enqueued::Deliver(candidate)
        } else {
            self.pending.push(candidate);
            Enqueued::Buffered
        }
    }

    /// Marks the remote description as set and returns the buffered
    /// candidates in arrival order. Only the first call flushes.
    pub fn set_remote_description_ready(&mut self) -> Vec<NetworkCandidate> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: usize) -> NetworkCandidate {
        NetworkCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test_timeout::timeout]
    fn flush_with_nothing_buffered_is_empty() {
        let mut queue = CandidateQueue::new();
        assert!(queue.set_remote_description_ready().is_empty());
        assert!(queue.is_ready());
    }

    #[test_timeout::timeout]
    fn single_candidate_waits_for_remote_description() {
        let mut queue = CandidateQueue::new();
        assert_eq!(queue.enqueue(candidate(1)), Enqueued::Buffered);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.set_remote_description_ready(), vec![candidate(1)]);
        assert!(queue.is_empty());
    }

    #[test_timeout::timeout]
    fn buffered_candidates_flush_in_arrival_order() {
        let mut queue = CandidateQueue::new();
        for n in 0..5 {
            assert_eq!(queue.enqueue(candidate(n)), Enqueued::Buffered);
        }
        // duplicates are kept as-is
        queue.enqueue(candidate(2));

        let flushed = queue.set_remote_description_ready();
        let expected: Vec<_> = [0, 1, 2, 3, 4, 2].into_iter().map(candidate).collect();
        assert_eq!(flushed, expected);

        assert_eq!(queue.enqueue(candidate(9)), Enqueued::Deliver(candidate(9)));
    }

    #[test_timeout::timeout]
    fn ready_before_any_candidate_passes_through() {
        let mut queue = CandidateQueue::new();
        queue.set_remote_description_ready();
        assert_eq!(queue.enqueue(candidate(1)), Enqueued::Deliver(candidate(1)));
        assert_eq!(queue.enqueue(candidate(2)), Enqueued::Deliver(candidate(2)));
        assert!(queue.is_empty());
    }

    #[test_timeout::timeout]
    fn second_ready_call_does_not_flush_again() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));
        assert_eq!(queue.set_remote_description_ready().len(), 2);
        assert!(queue.set_remote_description_ready().is_empty());
    }
}
