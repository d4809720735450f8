//! POSIX-style access control lists and the recursive ACL batch engine.
//!
//! A recursive change is applied by the service in batches.  Each batch call
//! returns per-batch counters, the paths that failed and, when more paths
//! remain, a continuation token.  [`change_access_control_recursive`] drives
//! the batch loop, aggregates the counters and reports progress after every
//! batch.  Per-path failures never abort the loop; any request-level error
//! does.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, StorageError};
use crate::metrics::ACL_BATCHES_TOTAL;

/// Largest batch the service accepts.
pub const MAX_BATCH_SIZE: u32 = 2000;

// -- ACL model ----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessControlType {
    User,
    Group,
    Mask,
    Other,
}

impl AccessControlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessControlType::User => "user",
            AccessControlType::Group => "group",
            AccessControlType::Mask => "mask",
            AccessControlType::Other => "other",
        }
    }
}

impl FromStr for AccessControlType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(AccessControlType::User),
            "group" => Ok(AccessControlType::Group),
            "mask" => Ok(AccessControlType::Mask),
            "other" => Ok(AccessControlType::Other),
            _ => Err(StorageError::invalid_argument(format!(
                "unknown access control type: {}",
                s
            ))),
        }
    }
}

/// `rwx` permission triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolePermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl fmt::Display for RolePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

impl FromStr for RolePermissions {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        let ok = |i: usize, c: u8| -> Result<bool> {
            match b[i] {
                x if x == c => Ok(true),
                b'-' => Ok(false),
                _ => Err(StorageError::invalid_argument(format!(
                    "invalid permission string: {}",
                    s
                ))),
            }
        };
        if b.len() != 3 {
            return Err(StorageError::invalid_argument(format!(
                "invalid permission string: {}",
                s
            )));
        }
        Ok(Self {
            read: ok(0, b'r')?,
            write: ok(1, b'w')?,
            execute: ok(2, b'x')?,
        })
    }
}

/// One ACL entry: `[default:]type:[entity_id]:perms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAccessControlItem {
    pub default_scope: bool,
    pub access_control_type: AccessControlType,
    pub entity_id: Option<String>,
    pub permissions: RolePermissions,
}

impl fmt::Display for PathAccessControlItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default_scope {
            f.write_str("default:")?;
        }
        write!(
            f,
            "{}:{}:{}",
            self.access_control_type.as_str(),
            self.entity_id.as_deref().unwrap_or_default(),
            self.permissions
        )
    }
}

impl FromStr for PathAccessControlItem {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let (default_scope, rest) = match s.strip_prefix("default:") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 {
            return Err(StorageError::invalid_argument(format!(
                "invalid access control entry: {}",
                s
            )));
        }
        Ok(Self {
            default_scope,
            access_control_type: parts[0].parse()?,
            entity_id: Some(parts[1]).filter(|id| !id.is_empty()).map(str::to_string),
            permissions: parts[2].parse()?,
        })
    }
}

/// Entry removed by a `remove` change: `[default:]type[:entity_id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePathAccessControlItem {
    pub default_scope: bool,
    pub access_control_type: AccessControlType,
    pub entity_id: Option<String>,
}

impl fmt::Display for RemovePathAccessControlItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default_scope {
            f.write_str("default:")?;
        }
        f.write_str(self.access_control_type.as_str())?;
        if let Some(id) = &self.entity_id {
            write!(f, ":{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for RemovePathAccessControlItem {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let (default_scope, rest) = match s.strip_prefix("default:") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let mut parts = rest.splitn(2, ':');
        let access_control_type = parts.next().unwrap_or_default().parse()?;
        let entity_id = parts.next().filter(|id| !id.is_empty());
        if entity_id.map_or(false, |id| id.contains(':')) {
            return Err(StorageError::invalid_argument(format!(
                "invalid access control entry to remove: {}",
                s
            )));
        }
        Ok(Self {
            default_scope,
            access_control_type,
            entity_id: entity_id.map(str::to_string),
        })
    }
}

/// Parse a comma separated ACL such as `user::rwx,group::r-x,other::---`.
pub fn parse_acl(s: &str) -> Result<Vec<PathAccessControlItem>> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::parse)
        .collect()
}

/// Parse a comma separated list of entries to remove, e.g. `user:oid,mask`.
pub fn parse_remove_acl(s: &str) -> Result<Vec<RemovePathAccessControlItem>> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::parse)
        .collect()
}

/// Render entries in the wire form accepted by set and modify.
pub fn to_acl_string(items: &[PathAccessControlItem]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Render entries in the wire form accepted by remove.
pub fn to_remove_acl_string(items: &[RemovePathAccessControlItem]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// -- Batch engine -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclChangeMode {
    Set,
    Modify,
    Remove,
}

impl AclChangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclChangeMode::Set => "set",
            AclChangeMode::Modify => "modify",
            AclChangeMode::Remove => "remove",
        }
    }
}

impl FromStr for AclChangeMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(AclChangeMode::Set),
            "modify" => Ok(AclChangeMode::Modify),
            "remove" => Ok(AclChangeMode::Remove),
            _ => Err(StorageError::invalid_argument(format!(
                "unknown ACL change mode: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessControlChangeCounters {
    pub changed_directories_count: u64,
    pub changed_files_count: u64,
    pub failed_changes_count: u64,
}

impl AccessControlChangeCounters {
    fn add(&mut self, other: &AccessControlChangeCounters) {
        self.changed_directories_count += other.changed_directories_count;
        self.changed_files_count += other.changed_files_count;
        self.failed_changes_count += other.failed_changes_count;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessControlChangeFailure {
    pub name: String,
    pub is_directory: bool,
    pub error_message: String,
}

/// Progress report handed to the callback after every batch.
#[derive(Debug, Clone, Default)]
pub struct AccessControlChanges {
    pub batch_failures: Vec<AccessControlChangeFailure>,
    pub batch_counters: AccessControlChangeCounters,
    pub aggregate_counters: AccessControlChangeCounters,
    /// Token for the next batch; `None` once the whole tree was visited.
    pub continuation_token: Option<String>,
}

/// Outcome of a recursive change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControlChangeResult {
    pub counters: AccessControlChangeCounters,
    /// Present only when the loop stopped because of `max_batches`.
    pub continuation_token: Option<String>,
}

/// What a single batch call reports back.
#[derive(Debug, Clone, Default)]
pub struct AclBatchResponse {
    pub counters: AccessControlChangeCounters,
    pub failures: Vec<AccessControlChangeFailure>,
    pub continuation: Option<String>,
}

pub type AclProgressFn = Arc<dyn Fn(&AccessControlChanges) + Send + Sync>;

/// Options for [`change_access_control_recursive`].
#[derive(Clone, Default, Deserialize)]
pub struct AclOptions {
    /// Paths per batch, 1..=2000. Unset lets the service choose.
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Stop after this many batches. Unset means run to completion.
    #[serde(default)]
    pub max_batches: Option<u32>,
    /// Resume from a previously returned token.
    #[serde(default)]
    pub continuation_token: Option<String>,
    /// Keep going past per-path failures on the service side.
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(skip)]
    pub on_progress: Option<AclProgressFn>,
}

impl fmt::Debug for AclOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclOptions")
            .field("batch_size", &self.batch_size)
            .field("max_batches", &self.max_batches)
            .field("continuation_token", &self.continuation_token)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("on_progress", &self.on_progress.as_ref().map(|_| "callback"))
            .finish()
    }
}

impl AclOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.batch_size {
            if size == 0 || size > MAX_BATCH_SIZE {
                return Err(StorageError::invalid_argument(format!(
                    "batch_size must be between 1 and {}, got {}",
                    MAX_BATCH_SIZE, size
                )));
            }
        }
        if self.max_batches == Some(0) {
            return Err(StorageError::invalid_argument(
                "max_batches must be at least 1",
            ));
        }
        Ok(())
    }
}

/// One batch call against the service.
pub struct AclBatchRequest<'a> {
    pub mode: AclChangeMode,
    pub acl: &'a str,
    pub batch_size: Option<u32>,
    pub continuation: Option<&'a str>,
    pub force_flag: bool,
}

/// Something that can apply one batch of a recursive ACL change.
pub trait AclBatchTarget: Send + Sync {
    fn apply_batch<'a>(
        &'a self,
        batch: AclBatchRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<AclBatchResponse>> + Send + 'a>>;
}

/// Run batches until the tree is exhausted or `max_batches` is reached.
///
/// Request-level failures are returned as [`StorageError::AclChangeFailed`]
/// carrying the token the failed batch started from, so the caller can
/// resume.  Cancellation is returned as [`StorageError::Cancelled`].
pub async fn change_access_control_recursive(
    target: &dyn AclBatchTarget,
    mode: AclChangeMode,
    acl: &str,
    options: &AclOptions,
    cancel: &CancellationToken,
) -> Result<AccessControlChangeResult> {
    options.validate()?;

    let mut token = options.continuation_token.clone();
    let mut aggregate = AccessControlChangeCounters::default();
    let mut batches: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let batch = AclBatchRequest {
            mode,
            acl,
            batch_size: options.batch_size,
            continuation: token.as_deref(),
            force_flag: options.continue_on_failure,
        };
        let response = match target.apply_batch(batch, cancel).await {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => return Err(StorageError::Cancelled),
            Err(e) => {
                warn!(
                    "recursive ACL {} failed after {} batches: {}",
                    mode.as_str(),
                    batches,
                    e
                );
                return Err(StorageError::AclChangeFailed {
                    source: Box::new(e),
                    continuation_token: token,
                });
            }
        };

        batches += 1;
        metrics::counter!(ACL_BATCHES_TOTAL).increment(1);
        aggregate.add(&response.counters);
        token = response.continuation.filter(|t| !t.is_empty());

        debug!(
            "recursive ACL {} batch {}: dirs={} files={} failures={} more={}",
            mode.as_str(),
            batches,
            response.counters.changed_directories_count,
            response.counters.changed_files_count,
            response.counters.failed_changes_count,
            token.is_some()
        );

        if let Some(on_progress) = &options.on_progress {
            on_progress(&AccessControlChanges {
                batch_failures: response.failures,
                batch_counters: response.counters,
                aggregate_counters: aggregate,
                continuation_token: token.clone(),
            });
        }

        let more = token.is_some();
        let budget_left = options.max_batches.map_or(true, |max| batches < max);
        if !more || !budget_left {
            break;
        }
    }

    info!(
        "recursive ACL {} done: batches={} dirs={} files={} failures={} resumable={}",
        mode.as_str(),
        batches,
        aggregate.changed_directories_count,
        aggregate.changed_files_count,
        aggregate.failed_changes_count,
        token.is_some()
    );

    Ok(AccessControlChangeResult {
        counters: aggregate,
        continuation_token: token,
    })
}
