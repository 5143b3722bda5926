use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{ConfigSnapshot, ConfigStore};
use crate::learning::{ApprovedView, LearnedSafe};
use crate::normalize::{normalize, resolve_alias};
use crate::types::{SecurityAssessment, Tier};

/// Category label for commands matched through the learned-safe cache.
pub const LEARNED_SAFE: &str = "LEARNED_SAFE";

/// Out-of-band notifications from the classifier to the audit pipeline.
#[derive(Debug, Clone)]
pub enum ClassifierNotice {
    CacheInvalidated {
        config_version: u64,
        approved_version: u64,
    },
}

/// One consistent view of everything classification reads: the compiled
/// pattern tiers from a config snapshot plus the learned-safe overlay.
struct Merged {
    snapshot: Arc<ConfigSnapshot>,
    learned: Arc<HashMap<String, LearnedSafe>>,
    approved_version: u64,
}

/// Maps command strings to security assessments. Pure CPU; never awaits.
pub struct Classifier {
    config: Arc<ConfigStore>,
    approved: ApprovedView,
    cache: Mutex<Option<Arc<Merged>>>,
    notice_tx: Option<mpsc::UnboundedSender<ClassifierNotice>>,
}

impl Classifier {
    pub fn new(
        config: Arc<ConfigStore>,
        approved: ApprovedView,
        notice_tx: Option<mpsc::UnboundedSender<ClassifierNotice>>,
    ) -> Self {
        Self {
            config,
            approved,
            cache: Mutex::new(None),
            notice_tx,
        }
    }

    /// Classify a command string.
    ///
    /// Order: learned-safe exact match on the normalized form, then
    /// alias resolution of the leading token, then the tier scan from
    /// highest severity down. No match lands in UNKNOWN.
    pub fn classify(&self, command: &str) -> SecurityAssessment {
        let normalized = normalize(command);
        let merged = self.merged();

        if let Some(learned) = merged.learned.get(&normalized) {
            let mut a = SecurityAssessment::new(
                Tier::Safe,
                LEARNED_SAFE,
                format!("previously approved as safe ({})", learned.source),
            );
            a.matched_pattern = Some(learned.pattern.clone());
            a.normalized = Some(normalized);
            return a;
        }

        let (scan_text, alias_note) = match resolve_alias(command) {
            Some((resolved, alias, cmdlet)) => {
                (resolved, Some(format!("alias '{}' resolves to {}", alias, cmdlet)))
            }
            None => (command.to_string(), None),
        };

        if let Some(m) = merged.snapshot.patterns.scan(&scan_text) {
            let mut reason = format!("matched {} pattern '{}'", m.tier, m.id);
            if let Some(note) = alias_note {
                reason = format!("{} ({})", reason, note);
            }
            let mut a = SecurityAssessment::new(m.tier, m.category.clone(), reason);
            a.matched_pattern = Some(m.regex.as_str().to_string());
            a.normalized = Some(normalized);
            return a;
        }

        let mut a = SecurityAssessment::new(
            Tier::Unknown,
            "UNCLASSIFIED",
            "no pattern matched; command is unknown",
        );
        a.requires_confirmation = merged.snapshot.security.require_confirmation_for_unknown;
        a.normalized = Some(normalized);
        a
    }

    /// Current merged view, rebuilt when either the config snapshot or
    /// the approved-safe map has moved. A rebuild after first use emits
    /// a cache-invalidation notice for the audit stream.
    fn merged(&self) -> Arc<Merged> {
        let mut guard = self.cache.lock().expect("classifier cache lock poisoned");
        let snapshot = self.config.current();
        let approved_version = self.approved.version();

        if let Some(m) = guard.as_ref() {
            if m.snapshot.version == snapshot.version && m.approved_version == approved_version {
                return m.clone();
            }
        }

        let invalidated = guard.is_some();
        let merged = Arc::new(Merged {
            learned: self.approved.snapshot(),
            approved_version,
            snapshot,
        });
        *guard = Some(merged.clone());

        if invalidated {
            debug!(
                config_version = merged.snapshot.version,
                approved_version, "Pattern cache invalidated"
            );
            if let Some(tx) = &self.notice_tx {
                let _ = tx.send(ClassifierNotice::CacheInvalidated {
                    config_version: merged.snapshot.version,
                    approved_version,
                });
            }
        }
        merged
    }
}
