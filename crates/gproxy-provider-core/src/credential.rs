use std::collections::BTreeMap;
use std::fmt;

use time::OffsetDateTime;

/// A pooled upstream secret.
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub id: i64,
    pub secret: String,
    pub label: Option<String>,
    pub active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_error_at: Option<OffsetDateTime>,
    /// `None` means the credential is shared by every caller.
    pub owner_id: Option<i64>,
}

impl Credential {
    pub fn new(id: i64, secret: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            secret: secret.into(),
            label: None,
            active: true,
            success_count: 0,
            failure_count: 0,
            created_at,
            last_used_at: None,
            last_error_at: None,
            owner_id: None,
        }
    }

    pub fn visible_to(&self, scope: &CallerScope) -> bool {
        self.active && (self.owner_id.is_none() || self.owner_id == scope.owner_id)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"***")
            .field("label", &self.label)
            .field("active", &self.active)
            .field("success_count", &self.success_count)
            .field("failure_count", &self.failure_count)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("last_error_at", &self.last_error_at)
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerScope {
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialUsageUpdate {
    pub credential_id: i64,
    pub success_delta: i64,
    pub failure_delta: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_error_at: Option<OffsetDateTime>,
}

impl CredentialUsageUpdate {
    pub fn success(credential_id: i64, at: OffsetDateTime) -> Self {
        Self {
            credential_id,
            success_delta: 1,
            failure_delta: 0,
            last_used_at: Some(at),
            last_error_at: None,
        }
    }

    pub fn failure(credential_id: i64, at: OffsetDateTime) -> Self {
        Self {
            credential_id,
            success_delta: 0,
            failure_delta: 1,
            last_used_at: Some(at),
            last_error_at: Some(at),
        }
    }

    /// Folds `other` into `self`: deltas add up, timestamps keep the latest.
    pub fn merge(&mut self, other: &CredentialUsageUpdate) {
        self.success_delta += other.success_delta;
        self.failure_delta += other.failure_delta;
        self.last_used_at = latest(self.last_used_at, other.last_used_at);
        self.last_error_at = latest(self.last_error_at, other.last_error_at);
    }
}

/// One merged update per credential, ordered by credential id.
pub fn merge_usage_updates<I>(updates: I) -> Vec<CredentialUsageUpdate>
where
    I: IntoIterator<Item = CredentialUsageUpdate>,
{
    let mut merged: BTreeMap<i64, CredentialUsageUpdate> = BTreeMap::new();
    for update in updates {
        match merged.get_mut(&update.credential_id) {
            Some(existing) => existing.merge(&update),
            None => {
                merged.insert(update.credential_id, update);
            }
        }
    }
    merged.into_values().collect()
}

fn latest(a: Option<OffsetDateTime>, b: Option<OffsetDateTime>) -> Option<OffsetDateTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
