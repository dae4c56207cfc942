//! Cron-triggered billing routes

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use stacker_billing::{BillingCycleReport, InvariantCheckSummary, InvariantChecker};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct InvariantsQuery {
    /// Run only this check
    pub check: Option<String>,
}

pub async fn run_billing_cycle(State(state): State<AppState>) -> ApiResult<Json<BillingCycleReport>> {
    let report = state.billing.cycle.run(OffsetDateTime::now_utc()).await?;
    Ok(Json(report))
}

pub async fn invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantsQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let now = OffsetDateTime::now_utc();
    let Some(check) = query.check else {
        return Ok(Json(state.billing.invariants.run_all_checks(now).await?));
    };

    if !InvariantChecker::available_checks().contains(&check.as_str()) {
        return Err(ApiError::BadRequest(format!("unknown check: {}", check)));
    }
    let violations = state.billing.invariants.run_check(&check, now).await?;
    let failed = usize::from(!violations.is_empty());
    Ok(Json(InvariantCheckSummary {
        checked_at: now,
        checks_run: 1,
        checks_passed: 1 - failed,
        checks_failed: failed,
        healthy: violations.is_empty(),
        violations,
    }))
}
