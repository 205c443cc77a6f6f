use std::time::Duration;

use http::HeaderMap;
use tracing::debug;

use gproxy_provider_impl::{DispatchPlan, SelectionPreferences};

pub const RETRY_MAX: &str = "x-gproxy-retry-max";
pub const RETRY_DELAY_MS: &str = "x-gproxy-retry-delay-ms";
pub const RETRY_BACKOFF: &str = "x-gproxy-retry-backoff";
pub const RETRY_ON_ZERO_COMPLETION: &str = "x-gproxy-retry-on-zero-completion-tokens";
pub const PRIORITIZE_NEWER: &str = "x-gproxy-prioritize-newer";
pub const PRIORITIZE_LEAST_ERRORS: &str = "x-gproxy-prioritize-least-errors";
pub const PRIORITIZE_LEAST_RECENTLY_USED: &str = "x-gproxy-prioritize-least-recently-used";

/// `true` as a backoff value.
const DEFAULT_BACKOFF: f64 = 2.0;

/// Per-request overrides; unparseable values fall back to the defaults.
pub fn apply_tuning(
    headers: &HeaderMap,
    plan: &DispatchPlan,
    prefs: &SelectionPreferences,
) -> (DispatchPlan, SelectionPreferences) {
    let mut plan = plan.clone();
    let mut prefs = *prefs;

    if let Some(value) = header(headers, RETRY_MAX) {
        match value.parse::<i32>() {
            Ok(max) => plan.max_retries = max,
            Err(_) => ignored(RETRY_MAX, value),
        }
    }
    if let Some(value) = header(headers, RETRY_DELAY_MS) {
        match value.parse::<u64>() {
            Ok(ms) => plan.retry_delay = Duration::from_millis(ms),
            Err(_) => ignored(RETRY_DELAY_MS, value),
        }
    }
    if let Some(value) = header(headers, RETRY_BACKOFF) {
        match parse_backoff(value) {
            Some(backoff) => plan.retry_backoff = backoff,
            None => ignored(RETRY_BACKOFF, value),
        }
    }
    set_flag(headers, RETRY_ON_ZERO_COMPLETION, &mut plan.retry_on_zero_completion_tokens);
    set_flag(headers, PRIORITIZE_NEWER, &mut prefs.prioritize_newer);
    set_flag(headers, PRIORITIZE_LEAST_ERRORS, &mut prefs.prioritize_least_errors);
    set_flag(
        headers,
        PRIORITIZE_LEAST_RECENTLY_USED,
        &mut prefs.prioritize_least_recently_used,
    );
    (plan, prefs)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_backoff(value: &str) -> Option<f64> {
    if let Ok(number) = value.parse::<f64>() {
        return (number.is_finite() && number > 0.0).then_some(number);
    }
    parse_bool(value).map(|enabled| if enabled { DEFAULT_BACKOFF } else { 1.0 })
}

fn set_flag(headers: &HeaderMap, name: &'static str, target: &mut bool) {
    if let Some(value) = header(headers, name) {
        match parse_bool(value) {
            Some(flag) => *target = flag,
            None => ignored(name, value),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn ignored(name: &'static str, value: &str) {
    debug!(event = "tuning_header_ignored", header = name, value = %value);
}
