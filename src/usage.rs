use crate::models::api_key::UsageEvent;

/// Accounting hook fed after every relayed call. Fire-and-forget: accounting
/// failures must not affect the request.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, key_id: &str, usage: &UsageEvent);
}

/// Emits usage as structured logs for an external collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageRecorder;

impl UsageRecorder for TracingUsageRecorder {
    fn record(&self, key_id: &str, usage: &UsageEvent) {
        tracing::info!(
            target: "usage",
            key_id = %key_id,
            model = %usage.model,
            account_id = usage.account_id.as_deref().unwrap_or("-"),
            input_tokens = usage.tokens.input_tokens,
            output_tokens = usage.tokens.output_tokens,
            cache_create_tokens = usage.tokens.cache_create_tokens,
            cache_read_tokens = usage.tokens.cache_read_tokens,
            total_tokens = usage.tokens.total(),
            "usage recorded"
        );
    }
}
