//! Conflict resolution.
//!
//! A conflict is a record that changed on the device and on the server
//! since their last common version. Resolution is a pure function of the
//! two versions; the engine never decides a winner anywhere else.
//!
//! The resolved record's `dirty` flag tells the engine what happened:
//! - still dirty: local content survives and must be uploaded on top of
//!   the server version carried in `last_modified`
//! - clean: the remote version was accepted and nothing needs uploading

use fhirsync_protocol::{Record, RecordKey};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Signature of a custom resolver.
pub type ResolveFn = dyn Fn(&Record, &Record) -> Record + Send + Sync;

/// Policy for automatic conflict resolution.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// Keep local content, adopt the remote version as the new baseline.
    #[default]
    LocalWins,
    /// The newer of the local edit and the remote version wins.
    LastWriteWins,
    /// Server always wins.
    RemoteWins,
    /// Caller-provided resolver.
    Custom(Arc<ResolveFn>),
}

impl ConflictPolicy {
    /// Wraps a resolver function.
    ///
    /// The function must be pure and idempotent:
    /// `f(&f(a, b), b) == f(a, b)`.
    pub fn custom<F>(resolve: F) -> Self
    where
        F: Fn(&Record, &Record) -> Record + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(resolve))
    }

    /// Returns the policy name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::Custom(_) => "custom",
        }
    }

    /// Resolves a conflict between the local and the remote version of a
    /// record.
    pub fn resolve(&self, local: &Record, remote: &Record) -> Record {
        match self {
            ConflictPolicy::LocalWins => keep_local(local, remote),
            ConflictPolicy::LastWriteWins => match local.edited_at {
                Some(edited_at) if edited_at > remote.last_modified => keep_local(local, remote),
                _ => accept_remote(remote),
            },
            ConflictPolicy::RemoteWins => accept_remote(remote),
            ConflictPolicy::Custom(resolve) => {
                let mut resolved = resolve(local, remote);
                // the result always belongs to the record being resolved
                resolved.resource_type = local.resource_type.clone();
                resolved.id = local.id.clone();
                resolved
            }
        }
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Records that already went through conflict resolution in this pass.
///
/// A record gets at most one resolution per pass; a second conflict on the
/// same record exhausts its retry.
#[derive(Debug, Default)]
pub(crate) struct ConflictLedger {
    resolved: HashSet<RecordKey>,
}

impl ConflictLedger {
    /// Notes a resolution. Returns false if the record was already resolved.
    pub(crate) fn record(&mut self, key: &RecordKey) -> bool {
        self.resolved.insert(key.clone())
    }

    pub(crate) fn contains(&self, key: &RecordKey) -> bool {
        self.resolved.contains(key)
    }
}

fn keep_local(local: &Record, remote: &Record) -> Record {
    Record {
        last_modified: remote.last_modified,
        ..local.clone()
    }
}

fn accept_remote(remote: &Record) -> Record {
    remote.clone().into_clean(remote.last_modified)
}
