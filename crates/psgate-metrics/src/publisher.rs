use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use psgate_core::classify::ClassifierNotice;
use psgate_core::event::EventBus;
use psgate_core::learning::LearningHandle;
use psgate_core::types::{CommandEvent, Decision, EventKind, Tier};

use crate::redact::event_preview;
use crate::registry::MetricsRegistry;

/// Bytes of stdout/command text kept on event previews.
pub const PREVIEW_BYTES: usize = 120;
/// Completion queue capacity; the oldest entries drop under pressure.
const COMPLETION_CAPACITY: usize = 256;
/// Replay ring size for the polling fallback endpoint.
const REPLAY_CAPACITY: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    pub disable_attempt_publish: bool,
    pub structured_audit: bool,
    pub data_dir: PathBuf,
}

/// Audit & metrics publisher.
///
/// Attempt events ride a guaranteed unbounded queue; completion events
/// ride a bounded queue that drops oldest under pressure. A single
/// owner task applies redaction, feeds the metrics registry, maintains
/// the replay ring, forwards unknown commands to the learning store,
/// and fans events out on the bus.
pub struct Publisher {
    seq: Arc<AtomicU64>,
    attempt_tx: mpsc::UnboundedSender<CommandEvent>,
    completion_tx: broadcast::Sender<CommandEvent>,
    bus: Arc<EventBus>,
    replay: Arc<Mutex<VecDeque<CommandEvent>>>,
    options: PublisherOptions,
}

impl Publisher {
    pub fn spawn(
        registry: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
        learning: Option<LearningHandle>,
        notice_rx: Option<mpsc::UnboundedReceiver<ClassifierNotice>>,
        options: PublisherOptions,
    ) -> Arc<Self> {
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = broadcast::channel(COMPLETION_CAPACITY);
        let replay = Arc::new(Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY)));
        let seq = Arc::new(AtomicU64::new(1));

        let owner = Owner {
            registry,
            bus: bus.clone(),
            learning,
            replay: replay.clone(),
            options: options.clone(),
            seq: seq.clone(),
        };
        tokio::spawn(owner.run(attempt_rx, completion_rx, notice_rx));

        Arc::new(Self {
            seq,
            attempt_tx,
            completion_tx,
            bus,
            replay,
            options,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Stamp an event with seq/id/timestamp. Exposed so attempt and
    /// completion records for one command share the stamping path.
    pub fn stamp(&self, mut event: CommandEvent) -> CommandEvent {
        event.seq = self.next_seq();
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        event.timestamp = Utc::now();
        event
    }

    /// Publish an attempt event. Guaranteed delivery unless attempt
    /// publication is disabled by environment.
    pub fn publish_attempt(&self, event: CommandEvent) {
        if self.options.disable_attempt_publish {
            return;
        }
        let event = self.stamp(event);
        if self.attempt_tx.send(event).is_err() {
            warn!("Publisher task gone; attempt event dropped");
        }
    }

    /// Publish a completion event. Under pressure the oldest queued
    /// completion is dropped, never the newest.
    pub fn publish_completion(&self, event: CommandEvent) {
        let event = self.stamp(event);
        let _ = self.completion_tx.send(event);
    }

    /// Publish an audit note (e.g. PATTERN_CACHE_INVALIDATED) through
    /// the guaranteed queue.
    pub fn publish_audit(&self, note: impl Into<String>) {
        let event = CommandEvent {
            seq: 0,
            id: String::new(),
            timestamp: Utc::now(),
            kind: EventKind::Audit,
            tool: "audit".into(),
            preview: String::new(),
            assessment: None,
            decision: Decision::Executed,
            duration_ms: 0,
            confirmed: false,
            outcome: None,
            client_id: None,
            note: Some(note.into()),
        };
        let event = self.stamp(event);
        let _ = self.attempt_tx.send(event);
    }

    /// Subscribe to the post-processing event stream (SSE feed).
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.bus.subscribe()
    }

    /// Events with `seq > since`, oldest first, capped at `limit`.
    pub fn replay(&self, since: u64, limit: usize) -> Vec<CommandEvent> {
        let ring = self.replay.lock().expect("replay lock poisoned");
        ring.iter()
            .filter(|e| e.seq > since)
            .take(limit)
            .cloned()
            .collect()
    }
}

struct Owner {
    registry: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,
    learning: Option<LearningHandle>,
    replay: Arc<Mutex<VecDeque<CommandEvent>>>,
    options: PublisherOptions,
    seq: Arc<AtomicU64>,
}

impl Owner {
    async fn run(
        self,
        mut attempt_rx: mpsc::UnboundedReceiver<CommandEvent>,
        mut completion_rx: broadcast::Receiver<CommandEvent>,
        notice_rx: Option<mpsc::UnboundedReceiver<ClassifierNotice>>,
    ) {
        let mut notice_rx = notice_rx;
        loop {
            tokio::select! {
                // Attempts first: for one command the attempt precedes
                // the completion in arrival order, and draining attempts
                // eagerly preserves that on the way out.
                biased;
                maybe = attempt_rx.recv() => match maybe {
                    Some(event) => self.process(event).await,
                    None => break,
                },
                result = completion_rx.recv() => match result {
                    Ok(event) => self.process(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "Completion events dropped under pressure");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                notice = recv_notice(&mut notice_rx) => match notice {
                    Some(ClassifierNotice::CacheInvalidated { config_version, approved_version }) => {
                        let mut event = audit_event(format!(
                            "PATTERN_CACHE_INVALIDATED config={} approved={}",
                            config_version, approved_version
                        ));
                        event.seq = self.seq.fetch_add(1, Ordering::Relaxed);
                        event.id = Uuid::new_v4().to_string();
                        self.process(event).await;
                    }
                    None => notice_rx = None,
                },
            }
        }
        debug!("Publisher task stopped");
    }

    async fn process(&self, mut event: CommandEvent) {
        event.preview = event_preview(&event.preview, PREVIEW_BYTES);

        match event.kind {
            EventKind::Attempt => {
                self.registry.record_attempt(&event);
                self.forward_unknown(&event).await;
            }
            EventKind::Completion => self.registry.record_completion(&event),
            EventKind::Audit => {}
        }

        {
            let mut ring = self.replay.lock().expect("replay lock poisoned");
            if ring.len() == REPLAY_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if self.options.structured_audit {
            self.append_audit_line(&event);
        }

        self.bus.publish(event);
    }

    /// Unknown commands surface on attempt events; hand their
    /// normalized form to the learning store as a candidate.
    async fn forward_unknown(&self, event: &CommandEvent) {
        let Some(learning) = &self.learning else { return };
        let Some(assessment) = &event.assessment else { return };
        if assessment.level != Tier::Unknown {
            return;
        }
        if let Some(normalized) = &assessment.normalized {
            if let Err(e) = learning.queue(normalized, "classifier").await {
                warn!(error = %e, "Failed to queue learning candidate");
            }
        }
    }

    fn append_audit_line(&self, event: &CommandEvent) {
        let path = self
            .options
            .data_dir
            .join(format!("audit-{}.ndjson", Utc::now().format("%Y%m%d")));
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Audit serialization failed");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Audit write failed");
        }
    }
}

async fn recv_notice(
    rx: &mut Option<mpsc::UnboundedReceiver<ClassifierNotice>>,
) -> Option<ClassifierNotice> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn audit_event(note: String) -> CommandEvent {
    CommandEvent {
        seq: 0,
        id: String::new(),
        timestamp: Utc::now(),
        kind: EventKind::Audit,
        tool: "audit".into(),
        preview: String::new(),
        assessment: None,
        decision: Decision::Executed,
        duration_ms: 0,
        confirmed: false,
        outcome: None,
        client_id: None,
        note: Some(note),
    }
}
