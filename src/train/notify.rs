//! Best-effort progress notification.
//!
//! Trainers call [`Notifier::notify`] and move on. Implementations must not
//! block the caller for long and must never report failure back: a broken
//! notification channel cannot stop a training run.

use crate::config::NotifyConfig;
use log::{debug, info};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

/// Something worth telling the outside world about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainingEvent {
    /// A run is starting.
    RunStarted {
        /// Run identifier.
        run: String,
    },
    /// A training epoch finished.
    EpochCompleted {
        /// Run identifier.
        run: String,
        /// `pretrain` or `dec`.
        stage: String,
        /// One-based epoch.
        epoch: usize,
        /// Mean training loss of the epoch.
        loss: f32,
    },
    /// A run ended normally.
    RunFinished {
        /// Run identifier.
        run: String,
        /// Short human-readable outcome.
        summary: String,
    },
    /// A run was aborted.
    RunFailed {
        /// Run identifier.
        run: String,
        /// The error that aborted it.
        error: String,
    },
}

/// Fire-and-forget sink for [`TrainingEvent`]s.
pub trait Notifier: Send + Sync {
    /// Delivers an event. Never fails from the caller's point of view.
    fn notify(&self, event: &TrainingEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &TrainingEvent) {}
}

/// Logs every event at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &TrainingEvent) {
        match event {
            TrainingEvent::RunStarted { run } => info!("[{}] started", run),
            TrainingEvent::EpochCompleted { run, stage, epoch, loss } => {
                info!("[{}] {} epoch {} loss {:.6}", run, stage, epoch, loss)
            }
            TrainingEvent::RunFinished { run, summary } => info!("[{}] finished: {}", run, summary),
            TrainingEvent::RunFailed { run, error } => info!("[{}] failed: {}", run, error),
        }
    }
}

/// Appends one JSON line per event to a file from a detached thread.
#[derive(Debug, Clone)]
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    /// Creates a notifier appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for FileNotifier {
    fn notify(&self, event: &TrainingEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                debug!("Dropping notification: {}", e);
                return;
            }
        };
        let path = self.path.clone();
        let spawned = thread::Builder::new()
            .name("seisdec-notify".to_string())
            .spawn(move || {
                let result = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut f| writeln!(f, "{}", line));
                if let Err(e) = result {
                    debug!("Notification to {} failed: {}", path.display(), e);
                }
            });
        if let Err(e) = spawned {
            debug!("Could not spawn notification thread: {}", e);
        }
    }
}

/// Forwards every event to several notifiers.
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    /// Adds a target.
    pub fn push(&mut self, target: Arc<dyn Notifier>) {
        self.targets.push(target);
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if there are no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: &TrainingEvent) {
        for target in &self.targets {
            target.notify(event);
        }
    }
}

/// Builds the notifier described by the configuration.
pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    let mut fanout = FanoutNotifier::default();
    if config.log {
        fanout.push(Arc::new(LogNotifier));
    }
    if let Some(path) = &config.file {
        fanout.push(Arc::new(FileNotifier::new(path.clone())));
    }
    if fanout.is_empty() {
        Arc::new(NullNotifier)
    } else {
        Arc::new(fanout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TrainingEvent>>);

    impl Notifier for Recorder {
        fn notify(&self, event: &TrainingEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_file_notifier_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let notifier = FileNotifier::new(&path);
        notifier.notify(&TrainingEvent::RunStarted { run: "a".to_string() });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut text = String::new();
        while Instant::now() < deadline {
            text = std::fs::read_to_string(&path).unwrap_or_default();
            if text.ends_with('\n') {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(text.trim(), r#"{"event":"run_started","run":"a"}"#);
    }

    #[test]
    fn test_file_notifier_swallows_errors() {
        let dir = tempdir().unwrap();
        let notifier = FileNotifier::new(dir.path().join("missing").join("events.jsonl"));
        notifier.notify(&TrainingEvent::RunFailed {
            run: "b".to_string(),
            error: "boom".to_string(),
        });
    }

    #[test]
    fn test_fanout_and_config() {
        let recorder = Arc::new(Recorder::default());
        let mut fanout = FanoutNotifier::default();
        fanout.push(recorder.clone());
        fanout.push(Arc::new(NullNotifier));
        fanout.notify(&TrainingEvent::RunStarted { run: "c".to_string() });
        assert_eq!(recorder.0.lock().unwrap().len(), 1);

        let built = from_config(&NotifyConfig { file: None, log: true });
        built.notify(&TrainingEvent::RunStarted { run: "d".to_string() });
    }
}
