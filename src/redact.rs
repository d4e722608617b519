//! PII detection and redaction
//!
//! Redaction is CPU-bound, so it runs on a fixed pool of worker threads
//! sized to the machine. Each worker owns its own compiled analyzer; jobs
//! arrive over a bounded channel and a saturated queue rejects new work
//! rather than stalling the request path.

use crate::error::{RedactionError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Common given names used as the cue for the PERSON recognizer
const GIVEN_NAMES: &str = "Aaron|Adam|Alice|Amy|Andrew|Anna|Anthony|Barbara|Benjamin|Brian|Carol|\
Charles|Christopher|Daniel|David|Deborah|Donald|Dorothy|Edward|Elizabeth|Emily|Emma|Eric|\
Frank|George|Hannah|Helen|Henry|Jack|Jacob|James|Jane|Jason|Jennifer|Jessica|John|Jonathan|\
Joseph|Joshua|Karen|Kevin|Kimberly|Laura|Linda|Lisa|Margaret|Maria|Mark|Mary|Matthew|Michael|\
Michelle|Nancy|Nicholas|Olivia|Patricia|Paul|Peter|Rachel|Rebecca|Richard|Robert|Ronald|Ruth|\
Samuel|Sandra|Sarah|Scott|Sophia|Stephen|Steven|Susan|Thomas|Timothy|William";

/// A detected PII span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiSpan {
    pub start: usize,
    pub end: usize,
    pub kind: &'static str,
}

/// Redaction result for a single text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub text: String,
    /// PII type tags found, deduplicated and sorted
    pub pii_types: Vec<String>,
}

impl Redacted {
    pub fn pii_found(&self) -> bool {
        !self.pii_types.is_empty()
    }
}

struct Recognizer {
    kind: &'static str,
    pattern: Regex,
}

/// Analyzer holding the compiled recognizer set; one instance per worker,
/// never shared across threads
pub struct Analyzer {
    recognizers: Vec<Recognizer>,
}

impl Analyzer {
    pub fn new() -> Self {
        let compile = |kind: &'static str, pattern: &str| Recognizer {
            kind,
            // Patterns are compile-time constants; a failure here is a bug
            // caught by the unit tests below
            pattern: Regex::new(pattern).unwrap_or_else(|e| {
                panic!("invalid {} recognizer pattern: {}", kind, e);
            }),
        };

        Self {
            recognizers: vec![
                compile(
                    "EMAIL",
                    r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
                ),
                compile("SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
                compile(
                    "CREDIT_CARD",
                    r"\b\d{4}[- ]\d{4}[- ]\d{4}[- ]\d{4}\b|\b\d{16}\b",
                ),
                compile(
                    "PHONE",
                    r"\b(?:\+\d{1,3}[-. ]?)?(?:\(\d{3}\)[-. ]?|\d{3}[-. ])\d{3}[-. ]\d{4}\b",
                ),
                compile("IP_ADDRESS", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
                compile(
                    "PERSON",
                    &format!(
                        r"\b(?:(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?|(?:{})\s+[A-Z][a-z]+)\b",
                        GIVEN_NAMES
                    ),
                ),
            ],
        }
    }

    /// Find PII spans, earliest first; overlaps resolved toward the span
    /// that starts first, then the longer one
    pub fn analyze(&self, text: &str) -> Vec<PiiSpan> {
        let mut spans: Vec<PiiSpan> = Vec::new();
        for recognizer in &self.recognizers {
            for found in recognizer.pattern.find_iter(text) {
                spans.push(PiiSpan {
                    start: found.start(),
                    end: found.end(),
                    kind: recognizer.kind,
                });
            }
        }
        spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        let mut resolved: Vec<PiiSpan> = Vec::new();
        let mut last_end = 0usize;
        for span in spans {
            if span.start < last_end {
                continue;
            }
            last_end = span.end;
            resolved.push(span);
        }
        resolved
    }

    /// Replace every detected span with its `<TYPE>` tag
    pub fn anonymize(&self, text: &str) -> Redacted {
        let spans = self.analyze(text);
        if spans.is_empty() {
            return Redacted {
                text: text.to_string(),
                pii_types: Vec::new(),
            };
        }

        let mut out = String::with_capacity(text.len());
        let mut types: BTreeSet<&'static str> = BTreeSet::new();
        let mut cursor = 0usize;
        for span in &spans {
            out.push_str(&text[cursor..span.start]);
            out.push('<');
            out.push_str(span.kind);
            out.push('>');
            types.insert(span.kind);
            cursor = span.end;
        }
        out.push_str(&text[cursor..]);

        Redacted {
            text: out,
            pii_types: types.into_iter().map(str::to_string).collect(),
        }
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct Job {
    text: String,
    reply: flume::Sender<Redacted>,
}

/// Fixed-size redaction worker pool
pub struct RedactionPool {
    tx: std::sync::Mutex<Option<flume::Sender<Job>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RedactionPool {
    /// Spawn a pool sized to the available cores
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get().max(1))
    }

    pub fn with_workers(workers: usize) -> Self {
        let capacity = workers.max(1) * 64;
        let (tx, rx) = flume::bounded::<Job>(capacity);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                std::thread::spawn(move || {
                    let analyzer = Analyzer::new();
                    debug!(worker_id, "redaction worker started");
                    for job in rx.iter() {
                        let redacted = analyzer.anonymize(&job.text);
                        if job.reply.send(redacted).is_err() {
                            warn!(worker_id, "redaction result dropped by caller");
                        }
                    }
                    debug!(worker_id, "redaction worker stopped");
                })
            })
            .collect();

        info!(workers, "redaction pool warmed up");
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(handles),
        }
    }

    /// Redact a batch, preserving order and count. A saturated queue rejects
    /// the whole batch with [`RedactionError::PoolSaturated`].
    pub async fn redact(&self, texts: &[String]) -> Result<Vec<Redacted>> {
        let sender = {
            let guard = self
                .tx
                .lock()
                .map_err(|_| RedactionError::WorkerFailed("pool lock poisoned".into()))?;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(RedactionError::PoolClosed.into());
        };

        let mut pending = Vec::with_capacity(texts.len());
        for text in texts {
            let (reply_tx, reply_rx) = flume::bounded(1);
            sender
                .try_send(Job {
                    text: text.clone(),
                    reply: reply_tx,
                })
                .map_err(|e| match e {
                    flume::TrySendError::Full(_) => RedactionError::PoolSaturated,
                    flume::TrySendError::Disconnected(_) => RedactionError::PoolClosed,
                })?;
            pending.push(reply_rx);
        }

        let mut out = Vec::with_capacity(texts.len());
        for reply_rx in pending {
            let redacted = reply_rx
                .recv_async()
                .await
                .map_err(|_| RedactionError::WorkerFailed("worker dropped the job".into()))?;
            out.push(redacted);
        }
        Ok(out)
    }

    /// Drain the queue and join all workers
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("redaction worker panicked during shutdown");
            }
        }
    }
}

impl Default for RedactionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_redaction() {
        let analyzer = Analyzer::new();
        let redacted = analyzer.anonymize("Contact us at support@example.com today");
        assert_eq!(redacted.text, "Contact us at <EMAIL> today");
        assert_eq!(redacted.pii_types, vec!["EMAIL"]);
    }

    #[test]
    fn test_person_and_email() {
        let analyzer = Analyzer::new();
        let redacted = analyzer.anonymize("Contact John Doe at john@example.com");
        assert!(redacted.text.contains("<PERSON>"));
        assert!(redacted.text.contains("<EMAIL>"));
        assert!(redacted.pii_types.contains(&"PERSON".to_string()));
        assert!(redacted.pii_types.contains(&"EMAIL".to_string()));
    }

    #[test]
    fn test_honorific_person() {
        let analyzer = Analyzer::new();
        let redacted = analyzer.anonymize("Please see Dr. Smith for details");
        assert_eq!(redacted.text, "Please see <PERSON> for details");
    }

    #[test]
    fn test_phone_and_ssn() {
        let analyzer = Analyzer::new();
        let redacted = analyzer.anonymize("Call 555-867-5309, SSN 123-45-6789");
        assert!(redacted.text.contains("<PHONE>"));
        assert!(redacted.text.contains("<SSN>"));
    }

    #[test]
    fn test_clean_text_untouched() {
        let analyzer = Analyzer::new();
        let text = "The dress code is business casual.";
        let redacted = analyzer.anonymize(text);
        assert_eq!(redacted.text, text);
        assert!(!redacted.pii_found());
    }

    #[test]
    fn test_overlapping_spans_resolve_once() {
        let analyzer = Analyzer::new();
        let redacted = analyzer.anonymize("Card 4111-1111-1111-1111 on file");
        assert_eq!(redacted.text, "Card <CREDIT_CARD> on file");
    }

    #[tokio::test]
    async fn test_pool_preserves_order_and_count() {
        let pool = RedactionPool::with_workers(2);
        let texts = vec![
            "alice@corp.example is first".to_string(),
            "no pii here".to_string(),
            "second is bob@corp.example".to_string(),
        ];
        let out = pool.redact(&texts).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "<EMAIL> is first");
        assert_eq!(out[1].text, "no pii here");
        assert_eq!(out[2].text, "second is <EMAIL>");
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_shutdown_then_submit_fails() {
        let pool = RedactionPool::with_workers(1);
        pool.shutdown();
        let err = pool.redact(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::SentinelError::Redaction(RedactionError::PoolClosed)
        ));
    }
}
