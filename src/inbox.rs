use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::error::{CableError, Result};
use crate::filter::Filter;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    EvictedOldest,
    Ignored,
    Closed,
}

pub struct Inbox {
    label: Arc<str>,
    capacity: Option<usize>,
    state: Mutex<InboxState>,
    arrivals: Notify,
}

struct Entry {
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct InboxState {
    entries: VecDeque<Entry>,
    next_seq: u64,
    ignore_reads: bool,
    closed: bool,
}

impl InboxState {
    fn position(&self, seq: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&seq, |entry| entry.seq).ok()
    }
}

struct Scan {
    count: usize,
    next_seq: u64,
    hits: SmallVec<[(u64, Message); 4]>,
}

impl Inbox {
    pub fn new(label: impl Into<Arc<str>>, capacity: Option<usize>) -> Self {
        Self {
            label: label.into(),
            capacity: capacity.filter(|limit| *limit > 0),
            state: Mutex::new(InboxState::default()),
            arrivals: Notify::new(),
        }
    }

    pub fn push(&self, message: Message) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.ignore_reads {
                return PushOutcome::Ignored;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(Entry { seq, message });
            match self.capacity {
                Some(limit) if state.entries.len() > limit => {
                    state.entries.pop_front();
                    PushOutcome::EvictedOldest
                }
                _ => PushOutcome::Enqueued,
            }
        };
        if outcome == PushOutcome::EvictedOldest {
            warn!(
                "inbox for {} over capacity {:?}, dropped oldest unread message",
                self.label, self.capacity
            );
        }
        self.arrivals.notify_waiters();
        outcome
    }

    pub fn ignore_reads(&self) {
        let mut state = self.lock();
        state.ignore_reads = true;
        state.entries.clear();
    }

    pub fn is_ignoring_reads(&self) -> bool {
        self.lock().ignore_reads
    }

    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.entries.clear();
        }
        self.arrivals.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn take(&self, filter: &Filter, timeout: Duration) -> Result<Option<Message>> {
        let taken = self.take_n(1, filter, timeout).await?;
        Ok(taken.and_then(|mut messages| messages.pop()))
    }

    /// Nothing is removed unless all `count` matches are available at once.
    pub async fn take_n(
        &self,
        count: usize,
        filter: &Filter,
        timeout: Duration,
    ) -> Result<Option<Vec<Message>>> {
        if count == 0 {
            return Ok(Some(Vec::new()));
        }
        // Durations too large for an Instant wait without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut scan = Scan {
            count,
            next_seq: 0,
            hits: SmallVec::new(),
        };
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            // Register before scanning so a push between the scan and the
            // await still wakes us.
            arrival.as_mut().enable();

            if let Some(taken) = self.try_take(&mut scan, filter)? {
                return Ok(Some(taken));
            }
            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, arrival).await.is_err() {
                        return self.try_take(&mut scan, filter);
                    }
                }
                None => arrival.await,
            }
        }
    }

    fn try_take(&self, scan: &mut Scan, filter: &Filter) -> Result<Option<Vec<Message>>> {
        loop {
            let fresh = {
                let state = self.lock();
                if state.closed {
                    return Err(CableError::ChannelClosed(self.label.to_string()));
                }
                let start = state.entries.partition_point(|entry| entry.seq < scan.next_seq);
                state
                    .entries
                    .range(start..)
                    .map(|entry| (entry.seq, entry.message.clone()))
                    .collect::<Vec<_>>()
            };

            for (seq, message) in fresh {
                if scan.hits.len() == scan.count {
                    break;
                }
                scan.next_seq = seq + 1;
                if filter.matches(&message)? {
                    scan.hits.push((seq, message));
                }
            }
            if scan.hits.len() < scan.count {
                return Ok(None);
            }

            let mut state = self.lock();
            if state.closed {
                return Err(CableError::ChannelClosed(self.label.to_string()));
            }
            let positions = scan
                .hits
                .iter()
                .map(|(seq, _)| state.position(*seq))
                .collect::<SmallVec<[Option<usize>; 4]>>();
            if positions.iter().all(Option::is_some) {
                for idx in positions.into_iter().flatten().rev() {
                    state.entries.remove(idx);
                }
                let taken = scan.hits.drain(..).map(|(_, message)| message).collect();
                return Ok(Some(taken));
            }
            // Another consumer, an eviction or ignore_reads got some hits
            // first. Keep the survivors and look at newer arrivals again.
            scan.hits.retain(|(seq, _)| state.position(*seq).is_some());
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::{json, Value};
    use tokio::time::Instant;

    use super::{Inbox, PushOutcome};
    use crate::error::CableError;
    use crate::filter::Filter;
    use crate::message::Message;

    const LABEL: &str = "{\"channel\":\"BenchmarkChannel\"}";

    fn msg(body: Value) -> Message {
        Message::new(LABEL, body)
    }

    fn bodies(messages: &[Message]) -> Vec<Value> {
        messages.iter().map(|m| m.body().clone()).collect()
    }

    #[tokio::test]
    async fn take_without_filter_returns_oldest_unread_message() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foo": 1})));
        inbox.push(msg(json!({"bar": 2})));

        let first = inbox.take(&Filter::None, Duration::from_millis(50)).await?;
        assert_eq!(first.map(Message::into_body), Some(json!({"foo": 1})));
        let second = inbox.take(&Filter::None, Duration::from_millis(50)).await?;
        assert_eq!(second.map(Message::into_body), Some(json!({"bar": 2})));
        assert!(inbox.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn take_with_filter_removes_only_the_match() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foobar": 3})));
        inbox.push(msg(json!({"foobaz": 3})));
        inbox.push(msg(json!({"baz": 3})));

        let hit = inbox
            .take(&Filter::from(json!({"baz": 3})), Duration::from_millis(50))
            .await?;
        assert_eq!(hit.map(Message::into_body), Some(json!({"baz": 3})));
        assert_eq!(inbox.len(), 2);

        let rest = inbox
            .take_n(2, &Filter::None, Duration::from_millis(50))
            .await?
            .expect("remaining messages");
        assert_eq!(bodies(&rest), vec![json!({"foobar": 3}), json!({"foobaz": 3})]);
        Ok(())
    }

    #[tokio::test]
    async fn take_n_collects_matches_in_order_and_keeps_the_rest() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        for n in 1..=5 {
            inbox.push(msg(json!({"n": n, "even": n % 2 == 0})));
        }

        let even = inbox
            .take_n(2, &Filter::from(json!({"even": true})), Duration::from_millis(50))
            .await?
            .expect("two matches");
        assert_eq!(
            bodies(&even),
            vec![json!({"n": 2, "even": true}), json!({"n": 4, "even": true})]
        );

        let next = inbox.take(&Filter::None, Duration::from_millis(50)).await?;
        assert_eq!(next.and_then(|m| m.get("n").cloned()), Some(json!(1)));
        assert_eq!(inbox.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn take_n_beyond_count_leaves_extra_messages_buffered() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        for n in 0..4 {
            inbox.push(msg(json!({"n": n})));
        }
        let taken = inbox
            .take_n(3, &Filter::None, Duration::from_millis(50))
            .await?
            .expect("three messages");
        assert_eq!(bodies(&taken), vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(inbox.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn take_n_with_zero_count_returns_immediately() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        let started = Instant::now();
        let taken = inbox.take_n(0, &Filter::None, Duration::from_secs(5)).await?;
        assert_eq!(taken.map(|m| m.len()), Some(0));
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn take_times_out_after_the_bound_without_consuming() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foo": 1})));

        let started = Instant::now();
        let miss = inbox
            .take(&Filter::from(json!({"foo": 2})), Duration::from_millis(120))
            .await?;
        let elapsed = started.elapsed();
        assert!(miss.is_none());
        assert!(elapsed >= Duration::from_millis(120), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned late: {elapsed:?}");
        assert_eq!(inbox.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn partial_take_n_timeout_consumes_nothing() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"baz": 3})));
        inbox.push(msg(json!({"foo": 1})));

        let miss = inbox
            .take_n(2, &Filter::from(json!({"baz": 3})), Duration::from_millis(60))
            .await?;
        assert!(miss.is_none());
        assert_eq!(inbox.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn blocked_take_wakes_when_a_matching_message_arrives() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .take(&Filter::from(json!({"speak": "hello"})), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        inbox.push(msg(json!({"speak": "bye"})));
        let started = Instant::now();
        inbox.push(msg(json!({"speak": "hello"})));

        let hit = waiter.await??;
        assert_eq!(hit.map(Message::into_body), Some(json!({"speak": "hello"})));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(inbox.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blocked_take_n_accumulates_across_arrivals() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .take_n(3, &Filter::None, Duration::from_secs(5))
                    .await
            })
        };
        for n in 0..3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inbox.push(msg(json!({"n": n})));
        }
        let taken = waiter.await??.expect("three messages");
        assert_eq!(bodies(&taken), vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_waiters_each_get_their_own_match() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let spawn_waiter = |key: &'static str| {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .take(
                        &Filter::predicate(move |m| m.get(key).is_some()),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        let left = spawn_waiter("left");
        let right = spawn_waiter("right");

        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.push(msg(json!({"right": 1})));
        inbox.push(msg(json!({"left": 1})));

        assert_eq!(left.await??.map(Message::into_body), Some(json!({"left": 1})));
        assert_eq!(right.await??.map(Message::into_body), Some(json!({"right": 1})));
        assert!(inbox.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn close_unblocks_waiters_with_channel_closed() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.take(&Filter::None, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        inbox.close();

        let err = waiter.await?.expect_err("closed");
        assert!(matches!(err, CableError::ChannelClosed(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(inbox.push(msg(json!({}))), PushOutcome::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn ignore_reads_drops_buffered_and_future_messages() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foo": 1})));
        inbox.ignore_reads();

        assert_eq!(inbox.push(msg(json!({"foo": 2}))), PushOutcome::Ignored);
        assert!(inbox.is_ignoring_reads());
        let miss = inbox.take(&Filter::None, Duration::from_millis(40)).await?;
        assert!(miss.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_unread_message() -> Result<()> {
        let inbox = Inbox::new(LABEL, Some(2));
        assert_eq!(inbox.push(msg(json!({"n": 1}))), PushOutcome::Enqueued);
        assert_eq!(inbox.push(msg(json!({"n": 2}))), PushOutcome::Enqueued);
        assert_eq!(inbox.push(msg(json!({"n": 3}))), PushOutcome::EvictedOldest);

        let taken = inbox
            .take_n(2, &Filter::None, Duration::from_millis(50))
            .await?
            .expect("two messages");
        assert_eq!(bodies(&taken), vec![json!({"n": 2}), json!({"n": 3})]);
        Ok(())
    }

    #[tokio::test]
    async fn unbounded_timeout_returns_buffered_message() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foo": 1})));

        let hit = inbox.take(&Filter::None, Duration::MAX).await?;
        assert_eq!(hit.map(Message::into_body), Some(json!({"foo": 1})));
        Ok(())
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_an_arrival() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.take_n(2, &Filter::None, Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.push(msg(json!({"n": 1})));
        inbox.push(msg(json!({"n": 2})));

        let taken = tokio::time::timeout(Duration::from_secs(2), waiter).await???;
        assert_eq!(taken.map(|m| m.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn predicate_may_inspect_its_own_inbox() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        inbox.push(msg(json!({"n": 1})));
        inbox.push(msg(json!({"n": 2})));

        let inner = inbox.clone();
        let filter = Filter::predicate(move |m| {
            !inner.is_ignoring_reads() && inner.len() > 1 && m.get("n") == Some(&json!(2))
        });
        let hit = tokio::time::timeout(
            Duration::from_secs(2),
            inbox.take(&filter, Duration::from_millis(100)),
        )
        .await??;
        assert_eq!(hit.map(Message::into_body), Some(json!({"n": 2})));
        assert_eq!(inbox.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_predicate_does_not_block_pushes() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        inbox.push(msg(json!({"n": 1})));

        let waiter = {
            let inbox = inbox.clone();
            let filter = Filter::predicate(|_| {
                std::thread::sleep(Duration::from_millis(300));
                false
            });
            tokio::spawn(async move { inbox.take(&filter, Duration::from_millis(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        assert_eq!(inbox.push(msg(json!({"n": 2}))), PushOutcome::Enqueued);
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(waiter.await??.is_none());
        assert_eq!(inbox.len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_at_the_deadline_is_returned_or_kept() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.take(&Filter::None, Duration::from_millis(100)).await })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        inbox.push(msg(json!({"late": true})));

        let taken = waiter.await??;
        let buffered = inbox.len();
        match taken {
            Some(message) => {
                assert_eq!(message.into_body(), json!({"late": true}));
                assert_eq!(buffered, 0);
            }
            None => assert_eq!(buffered, 1),
        }
        Ok(())
    }

    #[tokio::test]
    async fn competing_take_n_keeps_surviving_hits() -> Result<()> {
        let inbox = Arc::new(Inbox::new(LABEL, None));
        inbox.push(msg(json!({"n": 1})));
        let pair = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.take_n(2, &Filter::None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let single = inbox.take(&Filter::None, Duration::from_millis(50)).await?;
        assert_eq!(single.map(Message::into_body), Some(json!({"n": 1})));

        inbox.push(msg(json!({"n": 2})));
        inbox.push(msg(json!({"n": 3})));
        let taken = pair.await??.expect("two messages");
        assert_eq!(bodies(&taken), vec![json!({"n": 2}), json!({"n": 3})]);
        assert!(inbox.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn filter_errors_leave_the_inbox_untouched() -> Result<()> {
        let inbox = Inbox::new(LABEL, None);
        inbox.push(msg(json!({"foo": 1})));
        inbox.push(msg(json!({"bar": 2})));

        let filter = Filter::try_predicate(|m| {
            if m.get("bar").is_some() {
                anyhow::bail!("cannot inspect bar");
            }
            Ok(false)
        });
        let err = inbox
            .take(&filter, Duration::from_millis(50))
            .await
            .expect_err("filter error");
        assert!(matches!(err, CableError::Filter(_)));
        assert_eq!(inbox.len(), 2);

        let first = inbox.take(&Filter::None, Duration::from_millis(50)).await?;
        assert_eq!(first.map(Message::into_body), Some(json!({"foo": 1})));
        Ok(())
    }
}
