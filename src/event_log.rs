/// Bus Event Audit Log
///
/// Append-only JSON-lines record of bus events. Each entry carries the hash
/// of the previous one, so edited, dropped or reordered lines are detected by
/// `verify_log_file`.
use crate::observer::{BusEvent, BusObserver, CommittedFrame};
use crate::types::{FaultState, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// One chained log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Experiment the entry belongs to
    pub run_id: String,
    pub event: BusEvent,
    /// Empty for the first entry
    pub prev_hash: String,
    pub entry_hash: String,
}

impl EventLogEntry {
    fn new(sequence: u64, run_id: String, event: BusEvent, prev_hash: String) -> Self {
        let timestamp = Utc::now();
        let entry_hash = compute_hash(sequence, &timestamp, &run_id, &event, &prev_hash);
        Self {
            sequence,
            timestamp,
            run_id,
            event,
            prev_hash,
            entry_hash,
        }
    }

    pub fn verify_hash(&self) -> bool {
        compute_hash(
            self.sequence,
            &self.timestamp,
            &self.run_id,
            &self.event,
            &self.prev_hash,
        ) == self.entry_hash
    }

    pub fn verify_chain(&self, previous: &EventLogEntry) -> bool {
        self.prev_hash == previous.entry_hash && self.sequence == previous.sequence + 1
    }
}

fn compute_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    run_id: &str,
    event: &BusEvent,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(run_id.as_bytes());
    hasher.update(serde_json::to_string(event).unwrap_or_default().as_bytes());
    hasher.update(prev_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChainState {
    sequence: u64,
    last_hash: String,
}

/// Chained-hash writer for bus events
#[derive(Clone)]
pub struct BusEventLogger {
    run_id: String,
    log_path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
    chain: Arc<Mutex<ChainState>>,
}

impl BusEventLogger {
    /// Create (or truncate) the log file, creating parent directories
    pub fn new(run_id: impl Into<String>, log_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;

        Ok(Self {
            run_id: run_id.into(),
            log_path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            chain: Arc::new(Mutex::new(ChainState {
                sequence: 0,
                last_hash: String::new(),
            })),
        })
    }

    /// Log file named after the run and the current time inside `dir`
    pub fn in_dir(run_id: impl Into<String>, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let run_id = run_id.into();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.as_ref().join(format!("{}_{}.jsonl", run_id, stamp));
        Self::new(run_id, path)
    }

    pub fn log_event(&self, event: &BusEvent) {
        let mut chain = lock(&self.chain);
        let entry = EventLogEntry::new(
            chain.sequence,
            self.run_id.clone(),
            event.clone(),
            chain.last_hash.clone(),
        );
        chain.sequence += 1;
        chain.last_hash = entry.entry_hash.clone();

        if let Ok(json) = serde_json::to_string(&entry) {
            let mut writer = lock(&self.writer);
            let _ = writeln!(writer, "{}", json);
            let _ = writer.flush();
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Entries written so far
    pub fn sequence(&self) -> u64 {
        lock(&self.chain).sequence
    }
}

impl fmt::Debug for BusEventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEventLogger")
            .field("run_id", &self.run_id)
            .field("log_path", &self.log_path)
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl BusObserver for BusEventLogger {
    fn on_event(&mut self, event: &BusEvent) {
        self.log_event(event);
    }

    fn on_frame_committed(&mut self, _committed: &CommittedFrame) {}

    fn on_frame_aborted(&mut self, _offender: &NodeId, _state_at_detection: FaultState) {}
}

/// Outcome of checking a log file
#[derive(Debug)]
pub struct VerificationResult {
    pub total_entries: usize,
    pub verified: bool,
    pub issues: Vec<String>,
}

/// Check hashes, chain links and sequence numbers of a whole log
pub fn verify_log_file(log_path: impl AsRef<Path>) -> Result<VerificationResult, String> {
    let file = File::open(log_path.as_ref()).map_err(|e| format!("Failed to open log: {}", e))?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("Line {} read error: {}", line_num + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: EventLogEntry = serde_json::from_str(&line)
            .map_err(|e| format!("Line {} parse error: {}", line_num + 1, e))?;
        entries.push(entry);
    }

    let mut issues = Vec::new();
    if let Some(first) = entries.first() {
        if !first.prev_hash.is_empty() {
            issues.push(format!(
                "Entry 0: first entry should have empty prev_hash, got '{}'",
                first.prev_hash
            ));
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        if !entry.verify_hash() {
            issues.push(format!("Entry {}: hash mismatch (tampered)", i));
        }
        if entry.sequence != i as u64 {
            issues.push(format!(
                "Entry {}: expected sequence {}, got {}",
                i, i, entry.sequence
            ));
        }
    }

    for (i, pair) in entries.windows(2).enumerate() {
        if !pair[1].verify_chain(&pair[0]) {
            issues.push(format!(
                "Entry {}: chain broken (missing or reordered entry)",
                i + 1
            ));
        }
    }

    Ok(VerificationResult {
        total_entries: entries.len(),
        verified: issues.is_empty(),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorFlagKind;
    use std::fs;
    use tempfile::TempDir;

    fn flag_event(tick: u64) -> BusEvent {
        BusEvent::ErrorFlag {
            node: NodeId::new("VICTIM", 1),
            kind: ErrorFlagKind::Active,
            tec: 8,
            tick,
        }
    }

    #[test]
    fn test_entry_hash_and_chain() {
        let first = EventLogEntry::new(0, "run".to_string(), flag_event(1), String::new());
        let second = EventLogEntry::new(
            1,
            "run".to_string(),
            flag_event(2),
            first.entry_hash.clone(),
        );
        assert!(first.verify_hash());
        assert!(second.verify_chain(&first));
    }

    #[test]
    fn test_logger_writes_verifiable_file() {
        let dir = TempDir::new().unwrap();
        let logger = BusEventLogger::in_dir("attack", dir.path()).unwrap();
        logger.log_event(&flag_event(1));
        logger.log_event(&BusEvent::FaultStateChanged {
            node: NodeId::new("VICTIM", 1),
            from: FaultState::ErrorActive,
            to: FaultState::ErrorPassive,
            tec: 128,
            rec: 0,
            tick: 2,
        });
        assert_eq!(logger.sequence(), 2);

        let result = verify_log_file(logger.log_path()).unwrap();
        assert_eq!(result.total_entries, 2);
        assert!(result.verified, "{:?}", result.issues);
    }

    #[test]
    fn test_observer_hook_logs_every_event() {
        let dir = TempDir::new().unwrap();
        let mut logger = BusEventLogger::new("run", dir.path().join("nested/bus.jsonl")).unwrap();
        flag_event(3).dispatch(&mut logger);
        flag_event(4).dispatch(&mut logger);
        assert_eq!(logger.sequence(), 2);
    }

    #[test]
    fn test_tamper_detection() {
        let dir = TempDir::new().unwrap();
        let logger = BusEventLogger::new("run", dir.path().join("bus.jsonl")).unwrap();
        logger.log_event(&flag_event(1));
        logger.log_event(&flag_event(2));

        let content = fs::read_to_string(logger.log_path()).unwrap();
        fs::write(logger.log_path(), content.replace("VICTIM", "HIDDEN")).unwrap();

        let result = verify_log_file(logger.log_path()).unwrap();
        assert!(!result.verified);
        assert!(!result.issues.is_empty());
    }

    #[test]
    fn test_dropped_entry_breaks_chain() {
        let dir = TempDir::new().unwrap();
        let logger = BusEventLogger::new("run", dir.path().join("bus.jsonl")).unwrap();
        for tick in 0..3 {
            logger.log_event(&flag_event(tick));
        }

        let content = fs::read_to_string(logger.log_path()).unwrap();
        let kept: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| l)
            .collect();
        fs::write(logger.log_path(), kept.join("\n")).unwrap();

        let result = verify_log_file(logger.log_path()).unwrap();
        assert_eq!(result.total_entries, 2);
        assert!(!result.verified);
    }
}
