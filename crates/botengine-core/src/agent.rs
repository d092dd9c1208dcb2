//! Per-sender conversation memory in front of an [`AgentPort`].

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::{
    ports::{AgentPort, ChatTurn},
    Result,
};

/// Turns remembered per thread before the oldest are dropped.
pub const DEFAULT_HISTORY_TURNS: usize = 40;
/// Threads remembered before the least recently used is forgotten.
pub const DEFAULT_MAX_THREADS: usize = 1_000;

struct Thread {
    turns: VecDeque<ChatTurn>,
    last_used: u64,
}

#[derive(Default)]
struct Threads {
    by_id: HashMap<String, Thread>,
    clock: u64,
}

impl Threads {
    fn history(&mut self, thread_id: &str) -> Vec<ChatTurn> {
        self.clock += 1;
        let now = self.clock;
        match self.by_id.get_mut(thread_id) {
            Some(t) => {
                t.last_used = now;
                t.turns.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn remember(
        &mut self,
        thread_id: &str,
        turns: [ChatTurn; 2],
        max_turns: usize,
        max_threads: usize,
    ) {
        self.clock += 1;
        let now = self.clock;
        let thread = self
            .by_id
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread {
                turns: VecDeque::new(),
                last_used: now,
            });
        thread.last_used = now;
        thread.turns.extend(turns);
        while thread.turns.len() > max_turns {
            thread.turns.pop_front();
        }

        while self.by_id.len() > max_threads {
            let Some(oldest) = self
                .by_id
                .iter()
                .min_by_key(|(_, t)| t.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.by_id.remove(&oldest);
        }
    }
}

/// A stateful agent: each thread (one per sender) keeps its own history.
///
/// Both the turns per thread and the number of threads are bounded; the
/// least recently used thread is forgotten first.
pub struct ConversationAgent {
    port: Arc<dyn AgentPort>,
    max_turns: usize,
    max_threads: usize,
    threads: Mutex<Threads>,
}

impl ConversationAgent {
    pub fn new(port: Arc<dyn AgentPort>) -> Self {
        Self::with_limits(port, DEFAULT_HISTORY_TURNS, DEFAULT_MAX_THREADS)
    }

    pub fn with_limits(port: Arc<dyn AgentPort>, max_turns: usize, max_threads: usize) -> Self {
        Self {
            port,
            max_turns: max_turns.max(2),
            max_threads: max_threads.max(1),
            threads: Mutex::new(Threads::default()),
        }
    }

    /// Answer `input` in the context of `thread_id`, then remember the exchange.
    ///
    /// A failed call leaves the history untouched.
    pub async fn respond(&self, thread_id: &str, input: &str) -> Result<String> {
        let history = self.threads.lock().await.history(thread_id);

        let output = self.port.invoke(input, &history).await?;

        self.threads.lock().await.remember(
            thread_id,
            [ChatTurn::user(input), ChatTurn::assistant(output.clone())],
            self.max_turns,
            self.max_threads,
        );
        Ok(output)
    }

    pub async fn history_len(&self, thread_id: &str) -> usize {
        self.threads
            .lock()
            .await
            .by_id
            .get(thread_id)
            .map(|t| t.turns.len())
            .unwrap_or(0)
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.lock().await.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use async_trait::async_trait;

    /// Echoes the input and how much history it was given.
    struct EchoAgent;

    #[async_trait]
    impl AgentPort for EchoAgent {
        async fn invoke(&self, input: &str, history: &[ChatTurn]) -> Result<String> {
            if input == "fail" {
                return Err(Error::External("model unavailable".to_string()));
            }
            Ok(format!("{input} ({} turns)", history.len()))
        }
    }

    #[tokio::test]
    async fn threads_are_independent() {
        let agent = ConversationAgent::new(Arc::new(EchoAgent));
        assert_eq!(agent.respond("1", "hi").await.unwrap(), "hi (0 turns)");
        assert_eq!(agent.respond("1", "again").await.unwrap(), "again (2 turns)");
        assert_eq!(agent.respond("2", "hello").await.unwrap(), "hello (0 turns)");
    }

    #[tokio::test]
    async fn history_is_capped_and_failures_are_not_remembered() {
        let agent = ConversationAgent::with_limits(Arc::new(EchoAgent), 4, DEFAULT_MAX_THREADS);
        for i in 0..5 {
            agent.respond("t", &format!("m{i}")).await.unwrap();
        }
        assert_eq!(agent.history_len("t").await, 4);

        assert!(agent.respond("t", "fail").await.is_err());
        assert_eq!(agent.history_len("t").await, 4);
    }

    #[tokio::test]
    async fn least_recently_used_thread_is_forgotten() {
        let agent = ConversationAgent::with_limits(Arc::new(EchoAgent), 10, 2);
        agent.respond("alice", "hi").await.unwrap();
        agent.respond("bob", "hi").await.unwrap();
        // alice is now the most recent.
        agent.respond("alice", "again").await.unwrap();
        agent.respond("carol", "hi").await.unwrap();

        assert_eq!(agent.thread_count().await, 2);
        assert_eq!(agent.history_len("alice").await, 4);
        assert_eq!(agent.history_len("bob").await, 0);
        assert_eq!(agent.history_len("carol").await, 2);
        assert_eq!(agent.respond("bob", "back").await.unwrap(), "back (0 turns)");
    }
}
