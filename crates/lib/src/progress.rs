//! Progress signals emitted by long running operations.
//!
//! Codes are grouped by hundred so that a listener can tell which operation
//! a signal belongs to without looking at the text: 1xx commit, 2xx
//! rollback, 3xx delete.

use serde::Serialize;

/// The operation a signal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
#[repr(i32)]
pub enum OpCode {
    /// Committing a new version.
    Commit = 100,
    /// Rolling back to an earlier version.
    Rollback = 200,
    /// Deleting a version.
    Delete = 300,
}

impl From<OpCode> for i32 {
    fn from(v: OpCode) -> Self {
        v as i32
    }
}

/// A milestone of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
#[repr(i32)]
#[allow(missing_docs)]
pub enum StateCode {
    CommitStart = 101,
    CommitCheckingSpace = 102,
    CommitCopying = 103,
    CommitCommitting = 104,
    CommitCleaning = 105,
    CommitBootloader = 106,
    CommitSucceeded = 110,
    CommitFailed = 111,

    RollbackStart = 201,
    RollbackSnapshot = 202,
    RollbackPrepare = 203,
    RollbackReplace = 204,
    RollbackBootloader = 205,
    /// The rollback was recorded and will run on next boot.
    RollbackScheduled = 206,
    RollbackSucceeded = 210,
    RollbackFailed = 211,
    RollbackRecovering = 212,

    DeleteStart = 301,
    DeleteSucceeded = 310,
    DeleteFailed = 311,
}

impl From<StateCode> for i32 {
    fn from(v: StateCode) -> Self {
        v as i32
    }
}

impl StateCode {
    /// The operation this state belongs to.
    pub fn op(self) -> OpCode {
        match i32::from(self) / 100 * 100 {
            100 => OpCode::Commit,
            200 => OpCode::Rollback,
            _ => OpCode::Delete,
        }
    }

    /// Whether this state ends the operation.
    pub fn is_terminal(self) -> bool {
        i32::from(self) % 100 >= 10
    }
}

/// One progress signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// The operation.
    pub op: OpCode,
    /// The milestone.
    pub state: StateCode,
    /// The version the operation targets; may be empty early on.
    pub version: String,
    /// Human readable detail.
    pub description: String,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {}",
            i32::from(self.op),
            i32::from(self.state),
            self.version
        )?;
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

/// Receives progress signals. Implementations must not block the caller.
pub trait ProgressSink: Send + Sync {
    /// Deliver one signal.
    fn emit(&self, p: &Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn emit(&self, p: &Progress) {
        self(p)
    }
}

/// Writes signals to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, p: &Progress) {
        if matches!(
            p.state,
            StateCode::CommitFailed | StateCode::RollbackFailed | StateCode::DeleteFailed
        ) {
            tracing::error!("{p}");
        } else {
            tracing::info!("{p}");
        }
    }
}

/// Forwards signals over an unbounded channel; a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink(tokio::sync::mpsc::UnboundedSender<Progress>);

impl ChannelSink {
    /// A sink and the receiving end of its channel.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, p: &Progress) {
        if self.0.send(p.clone()).is_err() {
            tracing::trace!("Progress receiver gone");
        }
    }
}

/// Emits signals for one operation on one version.
pub(crate) struct Reporter<'a> {
    pub(crate) sink: &'a dyn ProgressSink,
    pub(crate) version: String,
}

impl Reporter<'_> {
    pub(crate) fn emit(&self, state: StateCode, description: impl Into<String>) {
        self.sink.emit(&Progress {
            op: state.op(),
            state,
            version: self.version.clone(),
            description: description.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(StateCode::CommitCopying.op(), OpCode::Commit);
        assert_eq!(StateCode::RollbackRecovering.op(), OpCode::Rollback);
        assert_eq!(StateCode::DeleteFailed.op(), OpCode::Delete);
        assert!(StateCode::RollbackSucceeded.is_terminal());
        assert!(!StateCode::RollbackScheduled.is_terminal());
        assert_eq!(
            serde_json::to_string(&StateCode::RollbackScheduled).unwrap(),
            "206"
        );
    }

    #[test]
    fn test_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: &Progress| seen.lock().unwrap().push(p.state);
        let r = Reporter {
            sink: &sink,
            version: "d.1.0.20230101".into(),
        };
        r.emit(StateCode::DeleteStart, "");
        r.emit(StateCode::DeleteSucceeded, "done");
        assert_eq!(
            *seen.lock().unwrap(),
            [StateCode::DeleteStart, StateCode::DeleteSucceeded]
        );

        let (sink, mut rx) = ChannelSink::new();
        let r = Reporter {
            sink: &sink,
            version: "v".into(),
        };
        r.emit(StateCode::CommitStart, "starting");
        let p = rx.try_recv().unwrap();
        assert_eq!(p.to_string(), "[100/101] v: starting");
        drop(rx);
        // Never blocks or fails once the receiver is gone
        r.emit(StateCode::CommitFailed, "");
    }
}
