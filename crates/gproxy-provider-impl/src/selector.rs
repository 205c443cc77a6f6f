use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use gproxy_provider_core::{CallerScope, Credential, HistoryEntry, KeyStore, StoreError};

const ERROR_WEIGHT: f64 = 40.0;
const RECENCY_WEIGHT: f64 = 30.0;
const USAGE_WEIGHT: f64 = 30.0;
const UNUSED_USAGE_SCORE: f64 = 15.0;
const UNUSED_HEALTH_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPreferences {
    pub prioritize_newer: bool,
    pub prioritize_least_errors: bool,
    pub prioritize_least_recently_used: bool,
}

/// Health figures derived from request history. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Percentage in `[0, 100]`.
    pub error_rate: f64,
    pub hours_since_creation: f64,
    /// `f64::INFINITY` when the credential has never been used.
    pub hours_since_last_use: f64,
    pub health_score: f64,
}

impl CredentialStats {
    pub fn compute(credential: &Credential, history: &[HistoryEntry], now: OffsetDateTime) -> Self {
        let total = history.len() as u64;
        let successful = history.iter().filter(|entry| entry.success).count() as u64;
        let error_rate = if total > 0 {
            100.0 * (total - successful) as f64 / total as f64
        } else {
            0.0
        };
        let hours_since_last_use = history
            .iter()
            .map(|entry| entry.created_at)
            .max()
            .map(|last| hours_between(last, now))
            .unwrap_or(f64::INFINITY);
        let hours_since_creation = hours_between(credential.created_at, now);

        let health_score = if total > 0 {
            let error_score = (ERROR_WEIGHT - error_rate * 0.4).max(0.0);
            let recency_score = (hours_since_last_use / 24.0 * RECENCY_WEIGHT).min(RECENCY_WEIGHT);
            let usage_score =
                (USAGE_WEIGHT - (total as f64 / 100.0) * 10.0).clamp(0.0, USAGE_WEIGHT);
            (error_score + recency_score + usage_score).round()
        } else {
            UNUSED_HEALTH_SCORE
        };

        Self {
            total_requests: total,
            successful_requests: successful,
            error_rate,
            hours_since_creation,
            hours_since_last_use,
            health_score,
        }
    }

    pub fn adjusted_score(&self, prefs: &SelectionPreferences) -> f64 {
        let mut score = self.health_score;
        if prefs.prioritize_newer {
            score -= 0.1 * self.hours_since_creation;
        }
        if prefs.prioritize_least_errors {
            score += 0.5 * (100.0 - self.error_rate);
        }
        if prefs.prioritize_least_recently_used {
            score += 0.3 * self.hours_since_last_use;
        }
        score
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCredential {
    pub credential: Credential,
    pub stats: CredentialStats,
    pub adjusted_score: f64,
}

/// Orders credentials best-first. Ties keep their input order.
pub fn rank_candidates(
    credentials: Vec<Credential>,
    history: &HashMap<i64, Vec<HistoryEntry>>,
    now: OffsetDateTime,
    prefs: &SelectionPreferences,
    limit: Option<usize>,
) -> Vec<ScoredCredential> {
    let mut scored: Vec<ScoredCredential> = credentials
        .into_iter()
        .map(|credential| {
            let entries = history
                .get(&credential.id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let stats = CredentialStats::compute(&credential, entries, now);
            let adjusted_score = stats.adjusted_score(prefs);
            ScoredCredential {
                credential,
                stats,
                adjusted_score,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.adjusted_score.total_cmp(&a.adjusted_score));
    if let Some(limit) = limit.filter(|limit| *limit > 0) {
        scored.truncate(limit);
    }
    scored
}

fn hours_between(earlier: OffsetDateTime, now: OffsetDateTime) -> f64 {
    ((now - earlier).as_seconds_f64() / 3600.0).max(0.0)
}

/// Loads the caller's credentials and their history, then ranks them.
#[derive(Clone)]
pub struct KeySelector {
    store: Arc<dyn KeyStore>,
}

impl KeySelector {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub async fn select(
        &self,
        scope: &CallerScope,
        prefs: &SelectionPreferences,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredCredential>, StoreError> {
        let credentials = self.store.active_credentials(scope).await?;
        if credentials.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = credentials.iter().map(|cred| cred.id).collect();
        let history = self.store.credential_history(&ids).await?;
        let ranked = rank_candidates(
            credentials,
            &history,
            OffsetDateTime::now_utc(),
            prefs,
            limit,
        );
        debug!(
            event = "credentials_ranked",
            candidates = ranked.len(),
            top = ranked.first().map(|scored| scored.credential.id),
        );
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use gproxy_storage::MemoryStore;

    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(400)
    }

    fn credential(id: i64) -> Credential {
        Credential::new(id, format!("secret-{id}"), now() - Duration::days(30))
    }

    fn history(count: usize, failures: usize, last_use: OffsetDateTime) -> Vec<HistoryEntry> {
        (0..count)
            .map(|i| HistoryEntry {
                created_at: last_use - Duration::minutes(i as i64),
                success: i >= failures,
            })
            .collect()
    }

    #[test]
    fn unused_credential_scores_fifty() {
        let stats = CredentialStats::compute(&credential(1), &[], now());
        assert_eq!(stats.health_score, 50.0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.hours_since_last_use.is_infinite());
    }

    #[test]
    fn idle_healthy_key_beats_busy_failing_key() {
        let idle = history(9, 0, now() - Duration::hours(30));
        let failing = history(20, 10, now() - Duration::hours(1));

        let idle_stats = CredentialStats::compute(&credential(1), &idle, now());
        let failing_stats = CredentialStats::compute(&credential(2), &failing, now());
        assert_eq!(failing_stats.error_rate, 50.0);
        assert!(idle_stats.health_score > failing_stats.health_score);
        // 40 + 30 + 29.1
        assert_eq!(idle_stats.health_score, 99.0);
    }

    #[test]
    fn identical_stats_keep_store_order() {
        let creds = vec![credential(3), credential(1), credential(2)];
        let ranked = rank_candidates(
            creds.clone(),
            &HashMap::new(),
            now(),
            &SelectionPreferences::default(),
            None,
        );
        let order: Vec<i64> = ranked.iter().map(|scored| scored.credential.id).collect();
        assert_eq!(order, vec![3, 1, 2]);

        let again = rank_candidates(
            creds,
            &HashMap::new(),
            now(),
            &SelectionPreferences::default(),
            None,
        );
        let again: Vec<i64> = again.iter().map(|scored| scored.credential.id).collect();
        assert_eq!(order, again);
    }

    #[test]
    fn limit_truncates_only_when_positive() {
        let creds = vec![credential(1), credential(2), credential(3)];
        let prefs = SelectionPreferences::default();
        let history = HashMap::new();
        let capped = rank_candidates(creds.clone(), &history, now(), &prefs, Some(2));
        assert_eq!(capped.len(), 2);
        let uncapped = rank_candidates(creds, &history, now(), &prefs, Some(0));
        assert_eq!(uncapped.len(), 3);
    }

    #[test]
    fn prefer_newer_moves_recent_credentials_up() {
        let mut old = credential(1);
        old.created_at = now() - Duration::days(100);
        let mut fresh = credential(2);
        fresh.created_at = now() - Duration::hours(2);
        let prefs = SelectionPreferences {
            prioritize_newer: true,
            ..Default::default()
        };
        let ranked = rank_candidates(vec![old, fresh], &HashMap::new(), now(), &prefs, None);
        assert_eq!(ranked[0].credential.id, 2);
    }

    #[test]
    fn prefer_least_errors_rewards_clean_history() {
        let mut history_map = HashMap::new();
        history_map.insert(1, history(10, 5, now() - Duration::hours(48)));
        history_map.insert(2, history(10, 0, now() - Duration::hours(1)));
        let prefs = SelectionPreferences {
            prioritize_least_errors: true,
            ..Default::default()
        };
        let ranked = rank_candidates(
            vec![credential(1), credential(2)],
            &history_map,
            now(),
            &prefs,
            None,
        );
        assert_eq!(ranked[0].credential.id, 2);
    }

    #[test]
    fn clock_skew_is_clamped() {
        let future = history(1, 0, now() + Duration::hours(5));
        let stats = CredentialStats::compute(&credential(1), &future, now());
        assert_eq!(stats.hours_since_last_use, 0.0);
    }

    #[tokio::test]
    async fn selector_reads_scope_from_store() {
        let mut owned = credential(2);
        owned.owner_id = Some(9);
        let store = Arc::new(MemoryStore::with_credentials([credential(1), owned]));
        let selector = KeySelector::new(store);

        let anonymous = selector
            .select(&CallerScope::default(), &SelectionPreferences::default(), None)
            .await
            .unwrap();
        assert_eq!(anonymous.len(), 1);

        let owner = selector
            .select(&CallerScope { owner_id: Some(9) }, &SelectionPreferences::default(), None)
            .await
            .unwrap();
        assert_eq!(owner.len(), 2);
    }
}
