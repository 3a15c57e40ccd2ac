//! Side effects produced by file operations.
//!
//! Core operations never fire webhooks or write audit entries themselves.
//! They return the [`Effect`]s that happened and the caller dispatches them
//! once its own transaction has committed.

use serde::Serialize;
use tracing::info;

use crate::owner::Owner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Effect {
    FileDeleted { owner: Owner, path: String },
    FileMoved { owner: Owner, from: String, to: String },
    FileCopied { owner: Owner, from: String, to: String },
}

impl Effect {
    /// Event name used by webhook and audit consumers.
    pub fn event(&self) -> &'static str {
        match self {
            Effect::FileDeleted { .. } => "file.deleted",
            Effect::FileMoved { .. } => "file.moved",
            Effect::FileCopied { .. } => "file.copied",
        }
    }

    pub fn owner(&self) -> &Owner {
        match self {
            Effect::FileDeleted { owner, .. }
            | Effect::FileMoved { owner, .. }
            | Effect::FileCopied { owner, .. } => owner,
        }
    }
}

/// Receives effects after an operation completes.
///
/// Dispatch is fire-and-forget: a sink must not fail the operation that
/// produced the effect.
pub trait EffectSink: Send + Sync {
    fn dispatch(&self, effect: &Effect);

    fn dispatch_all(&self, effects: &[Effect]) {
        for effect in effects {
            self.dispatch(effect);
        }
    }
}

/// Writes each effect to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLog;

impl EffectSink for AuditLog {
    fn dispatch(&self, effect: &Effect) {
        match effect {
            Effect::FileDeleted { owner, path } => {
                info!(target: "audit", event = effect.event(), %owner, %path);
            }
            Effect::FileMoved { owner, from, to } | Effect::FileCopied { owner, from, to } => {
                info!(target: "audit", event = effect.event(), %owner, %from, %to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collect(Mutex<Vec<&'static str>>);

    impl EffectSink for Collect {
        fn dispatch(&self, effect: &Effect) {
            self.0.lock().push(effect.event());
        }
    }

    #[test]
    fn dispatch_all_preserves_order() {
        let owner = Owner::Account(Uuid::nil());
        let effects = [
            Effect::FileCopied {
                owner,
                from: "a".into(),
                to: "b".into(),
            },
            Effect::FileDeleted {
                owner,
                path: "a".into(),
            },
        ];
        let sink = Collect::default();
        sink.dispatch_all(&effects);
        assert_eq!(*sink.0.lock(), ["file.copied", "file.deleted"]);
    }

    #[test]
    fn serializes_with_event_tag() {
        let effect = Effect::FileMoved {
            owner: Owner::Organization(Uuid::nil()),
            from: "x".into(),
            to: "d/x".into(),
        };
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json["event"], "file_moved");
        assert_eq!(json["owner"]["kind"], "organization");
        assert_eq!(json["to"], "d/x");
    }
}
