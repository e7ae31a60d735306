//! Diagnostic stream and the reporter thread.
//!
//! Every task and stage sends its events down one channel to a single
//! [`Reporter`] thread. The reporter owns the progress counters, logs each
//! diagnostic, optionally forwards it to a front-end, and hands the collected
//! list back when the run finishes.

use crate::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Pipeline stage a diagnostic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Build,
    Validate,
    Compress,
    Encrypt,
    Sign,
    Publish,
    Collect,
    Verify,
    Bootstrap,
    Gather,
    Decrypt,
    Decompress,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Plan => "plan",
            Stage::Build => "build",
            Stage::Validate => "validate",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Sign => "sign",
            Stage::Publish => "publish",
            Stage::Collect => "collect",
            Stage::Verify => "verify",
            Stage::Bootstrap => "bootstrap",
            Stage::Gather => "gather",
            Stage::Decrypt => "decrypt",
            Stage::Decompress => "decompress",
            Stage::Extract => "extract",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
    Fatal,
}

/// One structured event for the front-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub task_id: Option<String>,
    pub level: Level,
    pub message: String,
    /// File or block the event is about
    pub subject: Option<String>,
}

impl Diagnostic {
    pub fn new(stage: Stage, level: Level, message: impl Into<String>) -> Self {
        Self {
            stage,
            task_id: None,
            level,
            message: message.into(),
            subject: None,
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Level::Info, message)
    }

    pub fn warn(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Level::Warn, message)
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Level::Error, message)
    }

    pub fn fatal(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Level::Fatal, message)
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

enum Event {
    Diagnostic(Diagnostic),
    StageStarted { stage: Stage, tasks: usize },
    TaskDone { stage: Stage },
    Shutdown,
}

/// Per-stage progress, owned by the reporter thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgress {
    pub total: usize,
    pub done: usize,
}

/// What the reporter hands back at the end of a run
#[derive(Debug, Default)]
pub struct ReporterSummary {
    pub diagnostics: Vec<Diagnostic>,
    pub progress: BTreeMap<Stage, StageProgress>,
}

/// Cheap sending side, cloned into every task
#[derive(Debug, Clone)]
pub struct ReportHandle {
    tx: Sender<Event>,
}

impl ReportHandle {
    pub fn emit(&self, diagnostic: Diagnostic) {
        // the reporter only stops after the driver is done with every handle
        let _ = self.tx.send(Event::Diagnostic(diagnostic));
    }

    pub fn stage_started(&self, stage: Stage, tasks: usize) {
        let _ = self.tx.send(Event::StageStarted { stage, tasks });
    }

    pub fn task_done(&self, stage: Stage) {
        let _ = self.tx.send(Event::TaskDone { stage });
    }
}

/// The single reporting path
pub struct Reporter {
    handle: ReportHandle,
    thread: JoinHandle<ReporterSummary>,
}

impl Reporter {
    /// Start the reporter; diagnostics are also forwarded to `frontend`
    pub fn spawn(frontend: Option<Sender<Diagnostic>>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("tapestry-reporter".to_string())
            .spawn(move || run_reporter(rx, frontend))?;
        Ok(Self {
            handle: ReportHandle { tx },
            thread,
        })
    }

    pub fn handle(&self) -> ReportHandle {
        self.handle.clone()
    }

    /// Stop the reporter and collect everything it saw
    pub fn finish(self) -> ReporterSummary {
        let _ = self.handle.tx.send(Event::Shutdown);
        self.thread.join().unwrap_or_default()
    }
}

fn run_reporter(rx: Receiver<Event>, frontend: Option<Sender<Diagnostic>>) -> ReporterSummary {
    let mut summary = ReporterSummary::default();
    for event in rx {
        match event {
            Event::Diagnostic(diagnostic) => {
                log_diagnostic(&diagnostic);
                if let Some(frontend) = &frontend {
                    let _ = frontend.send(diagnostic.clone());
                }
                summary.diagnostics.push(diagnostic);
            }
            Event::StageStarted { stage, tasks } => {
                info!(%stage, tasks, "stage started");
                summary.progress.insert(
                    stage,
                    StageProgress {
                        total: tasks,
                        done: 0,
                    },
                );
            }
            Event::TaskDone { stage } => {
                let progress = summary.progress.entry(stage).or_default();
                progress.done += 1;
                debug!(%stage, done = progress.done, total = progress.total, "progress");
            }
            Event::Shutdown => break,
        }
    }
    summary
}

fn log_diagnostic(d: &Diagnostic) {
    let task = d.task_id.as_deref().unwrap_or("-");
    let subject = d.subject.as_deref().unwrap_or("-");
    match d.level {
        Level::Info => info!(stage = %d.stage, task, subject, "{}", d.message),
        Level::Warn => warn!(stage = %d.stage, task, subject, "{}", d.message),
        Level::Error => error!(stage = %d.stage, task, subject, "{}", d.message),
        Level::Fatal => error!(stage = %d.stage, task, subject, fatal = true, "{}", d.message),
    }
}
