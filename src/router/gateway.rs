//! Pairs every routed selection with exactly one completion.
//!
//! `complete` releases the key, feeds the health tracker and writes the
//! ledger row plus key counters in one transaction. A selection can only
//! be completed once because `complete` consumes it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::balancer::{LoadBalancer, ProviderSelection};
use crate::error::Result;
use crate::ledger::{RequestRecord, UsageLedger};
use crate::pool::KeyResult;
use crate::types::{Provider, UserAccess};

/// How the upstream call ended, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallStatus {
    /// The provider answered successfully.
    Success,
    /// The provider throttled this key.
    Throttled { retry_after: Option<Duration> },
    /// The provider rejected this key's credentials.
    Rejected,
    /// Server error, timeout or network failure.
    Failed,
    /// The provider refused the request itself (other 4xx). Neither the
    /// key nor the provider is at fault.
    Refused,
}

impl CallStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CallStatus::Success)
    }
}

/// Everything known about a finished upstream call.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub status: CallStatus,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub request_id: String,
    pub request_type: String,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
}

impl CompletionOutcome {
    pub fn success(input_tokens: u32, output_tokens: u32, latency_ms: u64) -> Self {
        Self {
            status: CallStatus::Success,
            input_tokens,
            output_tokens,
            latency_ms,
            error_code: None,
            error_message: None,
            request_id: uuid::Uuid::new_v4().to_string(),
            request_type: "chat".to_string(),
            session_id: None,
            user_agent: None,
        }
    }

    pub fn failure(
        status: CallStatus,
        latency_ms: u64,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            ..Self::success(0, 0, latency_ms)
        }
    }
}

/// What a completion wrote.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Ledger row id, absent when the ledger write failed.
    pub record_id: Option<i64>,
    pub provider: Provider,
    pub key_id: Option<i64>,
    pub cost_usd: f64,
}

/// Routing front door: the balancer plus the ledger it reports to.
#[derive(Debug, Clone)]
pub struct Gateway {
    balancer: Arc<LoadBalancer>,
    ledger: UsageLedger,
}

impl Gateway {
    pub fn new(balancer: Arc<LoadBalancer>, ledger: UsageLedger) -> Self {
        Self { balancer, ledger }
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Route `model` for `user`. A selection dropped before [`complete`]
    /// still leaves an `abandoned` row in the ledger.
    ///
    /// [`complete`]: Gateway::complete
    pub fn route(&self, model: &str, user: &UserAccess) -> Result<ProviderSelection> {
        let mut selection = self.balancer.route(model, user)?;
        selection.attach_ledger(self.ledger.clone());
        Ok(selection)
    }

    pub fn route_excluding(
        &self,
        model: &str,
        user: &UserAccess,
        exclude: &[Provider],
    ) -> Result<ProviderSelection> {
        let mut selection = self.balancer.route_excluding(model, user, exclude)?;
        selection.attach_ledger(self.ledger.clone());
        Ok(selection)
    }

    /// Finish a selection. The in-memory release always happens; a failed
    /// ledger write is logged and reported through `record_id`.
    pub async fn complete(&self, selection: ProviderSelection, outcome: CompletionOutcome) -> Receipt {
        let provider = selection.provider();
        let model = selection.model().to_string();
        let user = *selection.user();
        let key_id = selection.key_id();

        let cost_usd = if outcome.status.is_success() {
            self.ledger
                .pricing()
                .cost(provider, outcome.input_tokens, outcome.output_tokens)
        } else {
            0.0
        };

        let key_result = match outcome.status {
            CallStatus::Success => KeyResult::Success { cost_usd },
            CallStatus::Throttled { retry_after } => KeyResult::Throttled { retry_after },
            CallStatus::Rejected => KeyResult::Rejected,
            CallStatus::Failed => KeyResult::Failed,
            // The provider was reachable and answered; count it as healthy.
            CallStatus::Refused => KeyResult::Success { cost_usd: 0.0 },
        };

        let report = selection.finish(
            key_result,
            outcome.latency_ms,
            outcome.error_message.as_deref(),
        );

        let record = RequestRecord {
            request_id: outcome.request_id,
            user_id: user.user_id,
            session_id: outcome.session_id,
            model_name: model,
            provider,
            api_key_id: key_id,
            request_type: outcome.request_type,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            cost_usd,
            response_time_ms: outcome.latency_ms,
            success: outcome.status.is_success(),
            error_code: outcome.error_code,
            error_message: outcome.error_message,
            user_agent: outcome.user_agent,
            created_at: Utc::now(),
        };

        let record_id = match self.ledger.record_completion(record, report).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    provider = %provider,
                    key_id = ?key_id,
                    error = %e,
                    "Failed to write usage ledger entry"
                );
                None
            }
        };

        Receipt {
            record_id,
            provider,
            key_id,
            cost_usd,
        }
    }
}
