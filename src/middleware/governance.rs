use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};

use crate::errors::{OpenAIError, OpenAIErrorKind};
use crate::models::token::ApiToken;
use crate::store::AuditRepo;

/// Outcome of per-token rate limit and daily quota checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceDecision {
    Allowed,
    RateLimited,
    QuotaExceeded,
}

impl GovernanceDecision {
    /// The rejection to send, or `None` when the call may proceed.
    pub fn rejection(&self) -> Option<OpenAIError> {
        match self {
            GovernanceDecision::Allowed => None,
            GovernanceDecision::RateLimited => Some(OpenAIError::new(
                OpenAIErrorKind::RateLimit,
                "Rate limit exceeded for this API token",
            )),
            GovernanceDecision::QuotaExceeded => Some(OpenAIError::new(
                OpenAIErrorKind::InsufficientQuota,
                "Daily quota exceeded for this API token",
            )),
        }
    }
}

/// Decide a call from the token's limits and its recent call counts.
///
/// No token means the caller used the app secret and no governance applies.
/// A limit of 0 disables its check. The per-minute limit wins when both trip.
pub fn evaluate(token: Option<&ApiToken>, minute_count: i64, daily_count: i64) -> GovernanceDecision {
    let Some(token) = token else {
        return GovernanceDecision::Allowed;
    };
    let rpm = i64::from(token.rate_limit_per_minute);
    if rpm > 0 && minute_count >= rpm {
        return GovernanceDecision::RateLimited;
    }
    let quota = i64::from(token.daily_quota);
    if quota > 0 && daily_count >= quota {
        return GovernanceDecision::QuotaExceeded;
    }
    GovernanceDecision::Allowed
}

/// Midnight of `now`'s calendar day in `tz`, as UTC.
pub fn start_of_day<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let midnight = now.with_timezone(tz).date_naive().and_time(NaiveTime::MIN);
    midnight
        .and_local_timezone(tz.clone())
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        // midnight skipped by a DST jump
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

pub fn start_of_local_day(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(now, &Local)
}

/// Count recent calls of `token` on `endpoint` and evaluate its limits.
///
/// Counts always hit the audit store. A query is skipped when its limit is 0.
pub async fn check_token_governance(
    audit: &dyn AuditRepo,
    token: &ApiToken,
    endpoint: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<GovernanceDecision> {
    let minute_count = if token.rate_limit_per_minute > 0 {
        audit
            .count_by_token_since(&token.id, endpoint, now - Duration::seconds(60))
            .await?
    } else {
        0
    };
    let daily_count = if token.daily_quota > 0 {
        audit
            .count_by_token_since(&token.id, endpoint, start_of_local_day(now))
            .await?
    } else {
        0
    };

    let decision = evaluate(Some(token), minute_count, daily_count);
    if decision != GovernanceDecision::Allowed {
        tracing::info!(
            token_id = %token.id,
            kb_id = %token.kb_id,
            minute_count,
            daily_count,
            decision = ?decision,
            "api token governance rejected call"
        );
    }
    Ok(decision)
}
