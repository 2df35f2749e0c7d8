//! Rule execution engine: a cooperatively scheduled task that pops one
//! pending content item per interval, applies every registered rule, and
//! emits the tagged triplets over an event channel.

use crate::dkg::content::Content;
use crate::dkg::knowledge_graph::Triplet;
use crate::dkg::rules::RuleRegistry;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_PROCESS_INTERVAL: Duration = Duration::from_secs(1);

pub type EngineEvent = (Content, Vec<Triplet>);

pub struct RuleEngine {
    registry: Arc<RuleRegistry>,
    queue: Arc<Mutex<VecDeque<Content>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl RuleEngine {
    pub fn new(registry: Arc<RuleRegistry>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            registry,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            events,
            task: StdMutex::new(None),
        }
    }

    pub async fn enqueue(&self, content: Content) {
        self.queue.lock().await.push_back(content);
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Seed the queue with existing content (in shuffled order) and begin
    /// the processing interval.
    pub async fn start(&self, mut seed: Vec<Content>, interval: Duration) {
        seed.shuffle(&mut rand::thread_rng());
        self.queue.lock().await.extend(seed);

        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so items enqueued
            // right after start wait one full interval like all others.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(content) = queue.lock().await.pop_front() else {
                    continue;
                };
                let mut triplets = Vec::new();
                for rule in registry.all_rules() {
                    let mut output = rule.apply(&content);
                    for triplet in &mut output.triplets {
                        triplet.add_rule(rule.name());
                    }
                    triplets.extend(output.triplets);
                    if !output.derived.is_empty() {
                        debug!(
                            "rule {} derived {} new content items",
                            String::from_utf8_lossy(rule.name()),
                            output.derived.len()
                        );
                        queue.lock().await.extend(output.derived);
                    }
                }
                if events.send((content, triplets)).is_err() {
                    break;
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cancel the processing interval.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
