//! Shared fetch-protocol machinery (§4.4): the retry/backoff wrapper every
//! connector issues upstream calls through, a dotted-path JSON extractor
//! for the schema-driven REST/GraphQL connectors, and the date-window
//! state machine Close's `activities` entity walks.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::connector::FetchError;
use crate::error::{backoff_delay, Classify};

/// Runs `attempt` up to `max_retries + 1` times, sleeping per §4.5's backoff
/// policy between attempts classified [`crate::error::ErrorClass::Retryable`].
/// A single upstream call's retries happen entirely inside here, so the
/// caller's iteration counter (§4.4 `iterationsInChunk`) never sees them
/// (S4).
pub async fn with_retry<T, Fut>(
    max_retries: u32,
    rate_limit_delay_ms: u64,
    mut attempt: impl FnMut(u32) -> Fut,
) -> Result<T, FetchError>
where
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut last_err = None;
    for attempt_no in 0..=max_retries {
        match attempt(attempt_no).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let class = e.classify();
                match class {
                    crate::error::ErrorClass::Fatal => return Err(e),
                    crate::error::ErrorClass::Retryable { retry_after } => {
                        if attempt_no == max_retries {
                            last_err = Some(e);
                            break;
                        }
                        let delay = backoff_delay(rate_limit_delay_ms, attempt_no, retry_after);
                        tokio::time::sleep(delay).await;
                        last_err = Some(e);
                    }
                }
            }
        }
    }
    Err(last_err.expect("loop always sets last_err before exhausting retries"))
}

/// Extracts a value at a dotted path (`"data.users"`, `"result.0.id"`) the
/// way the REST and GraphQL connectors locate their configured
/// `data_path`/`total_count_path`/`next_cursor_path`.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |acc, segment| match acc {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn extract_array<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>, FetchError> {
    extract_path(value, path)
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::PathNotFound(path.to_string()))
}

/// `hasMore` derivation order from §4.4: explicit flag, else `next_cursor`
/// presence, else `batch.length == batchSize`.
pub fn derive_has_more(explicit: Option<bool>, next_cursor_present: Option<bool>, batch_len: usize, batch_size: u32) -> bool {
    if let Some(v) = explicit {
        return v;
    }
    if let Some(v) = next_cursor_present {
        return v;
    }
    batch_len as u32 == batch_size
}

/// Client-side incremental filter (§4.4): applied only when `since` is set
/// and the upstream doesn't enforce it server-side. Checks
/// `updatedAt`/`modifiedAt`/`modified_at`, whichever is present.
pub fn passes_since_filter(record: &Value, since: Option<chrono::DateTime<chrono::Utc>>) -> bool {
    let Some(since) = since else { return true };
    for key in ["updatedAt", "modifiedAt", "modified_at"] {
        if let Some(raw) = record.get(key).and_then(Value::as_str) {
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
                return ts.with_timezone(&chrono::Utc) >= since;
            }
        }
    }
    // No recognizable timestamp field: don't drop a record we can't judge.
    true
}

/// Close `activities`' per-day walk (§4.4, §9 "Date-window state with
/// embedded sentinels"): a small state machine instead of a flags bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateWindowState {
    /// Paginating within `day` at `daily_offset`.
    Normal {
        day: chrono::NaiveDate,
        daily_offset: u64,
    },
    /// `day` returned zero records; issuing one bounded probe for data
    /// strictly older than `day` before declaring end-of-history.
    ProbingOlder { day: chrono::NaiveDate },
}

impl DateWindowState {
    pub fn start(day: chrono::NaiveDate) -> Self {
        DateWindowState::Normal { day, daily_offset: 0 }
    }

    /// Transition after a page comes back for the current day.
    pub fn advance(self, page_len: usize, batch_size: u32, is_full_sync: bool) -> Transition {
        match self {
            DateWindowState::Normal { day, daily_offset } => {
                if page_len as u32 == batch_size {
                    Transition::Continue(DateWindowState::Normal {
                        day,
                        daily_offset: daily_offset + page_len as u64,
                    })
                } else if page_len > 0 {
                    // Partial page: day exhausted, move to the previous day.
                    match day.pred_opt() {
                        Some(prev) => Transition::Continue(DateWindowState::start(prev)),
                        None => Transition::Done,
                    }
                } else if daily_offset == 0 && is_full_sync {
                    // Empty day on a full sync: ambiguous between
                    // end-of-history and a genuinely empty day.
                    Transition::Continue(DateWindowState::ProbingOlder { day })
                } else {
                    match day.pred_opt() {
                        Some(prev) => Transition::Continue(DateWindowState::start(prev)),
                        None => Transition::Done,
                    }
                }
            }
            DateWindowState::ProbingOlder { day } => {
                if page_len > 0 {
                    // Older data exists; the empty day was a gap, not the end.
                    match day.pred_opt() {
                        Some(prev) => Transition::Continue(DateWindowState::start(prev)),
                        None => Transition::Done,
                    }
                } else {
                    Transition::Done
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue(DateWindowState),
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_path_walks_nested_objects() {
        let v = json!({"data": {"users": [{"id": 1}]}});
        assert_eq!(extract_path(&v, "data.users.0.id"), Some(&json!(1)));
    }

    #[test]
    fn extract_array_errors_on_missing_path() {
        let v = json!({"data": {}});
        assert!(matches!(extract_array(&v, "data.users"), Err(FetchError::PathNotFound(_))));
    }

    #[test]
    fn has_more_prefers_explicit_flag() {
        assert!(derive_has_more(Some(true), Some(false), 0, 100));
        assert!(!derive_has_more(Some(false), Some(true), 100, 100));
    }

    #[test]
    fn has_more_falls_back_to_batch_length() {
        assert!(derive_has_more(None, None, 100, 100));
        assert!(!derive_has_more(None, None, 50, 100));
    }

    #[test]
    fn since_filter_passes_records_without_timestamp() {
        let v = json!({"id": "x"});
        assert!(passes_since_filter(&v, Some(chrono::Utc::now())));
    }

    #[test]
    fn since_filter_rejects_older_records() {
        let v = json!({"updatedAt": "2020-01-01T00:00:00Z"});
        assert!(!passes_since_filter(&v, Some(chrono::Utc::now())));
    }

    #[test]
    fn date_window_full_page_advances_offset_same_day() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let state = DateWindowState::start(day);
        let t = state.advance(100, 100, false);
        assert_eq!(
            t,
            Transition::Continue(DateWindowState::Normal { day, daily_offset: 100 })
        );
    }

    #[test]
    fn date_window_partial_page_moves_to_previous_day() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let state = DateWindowState::Normal { day, daily_offset: 50 };
        let t = state.advance(30, 100, false);
        assert_eq!(
            t,
            Transition::Continue(DateWindowState::start(chrono::NaiveDate::from_ymd_opt(2024, 5, 31).unwrap()))
        );
    }

    #[test]
    fn date_window_empty_day_on_full_sync_enters_probing() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let state = DateWindowState::start(day);
        let t = state.advance(0, 100, true);
        assert_eq!(t, Transition::Continue(DateWindowState::ProbingOlder { day }));
    }

    #[test]
    fn date_window_probe_with_older_data_continues() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let state = DateWindowState::ProbingOlder { day };
        let t = state.advance(5, 100, true);
        assert_eq!(
            t,
            Transition::Continue(DateWindowState::start(chrono::NaiveDate::from_ymd_opt(2024, 5, 31).unwrap()))
        );
    }

    #[test]
    fn date_window_probe_without_older_data_is_done() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let state = DateWindowState::ProbingOlder { day };
        assert_eq!(state.advance(0, 100, true), Transition::Done);
    }

    /// S4: a 429 mid-attempt is absorbed by `with_retry` itself, never
    /// surfacing to the caller that supplies the chunk's iteration count.
    #[tokio::test]
    async fn with_retry_absorbs_a_single_rate_limit_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result = with_retry(3, 0, |_attempt_no| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FetchError::RateLimited(Some(Duration::from_millis(0))))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one retryable failure plus the succeeding attempt");
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_retries() {
        let result: Result<(), FetchError> = with_retry(2, 0, |_| async { Err(FetchError::RateLimited(None)) }).await;
        assert!(matches!(result, Err(FetchError::RateLimited(None))));
    }

    #[tokio::test]
    async fn with_retry_never_retries_a_fatal_error() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: Result<(), FetchError> = with_retry(5, 0, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Upstream("bad request".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
