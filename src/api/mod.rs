// =============================================================================
// API Module — HTTP surface of the routing engine
// =============================================================================
//
// webhook: signal ingress (POST /webhook/tradingview, GET /webhook/test)
// rest:    control and query endpoints under /api
// ws:      multiplexed event stream (GET /ws)

pub mod rest;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use crate::ingress::RateLimiter;
use crate::state::CoreState;

/// Shared context for every HTTP handler.
pub struct ApiContext {
    pub core: Arc<CoreState>,
    pub limiter: RateLimiter,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Arc<Self> {
        let (rate, burst) = {
            let config = core.config.read();
            (
                config.ingress.rate_limit_per_minute,
                config.ingress.rate_limit_burst,
            )
        };
        Arc::new(Self {
            core,
            limiter: RateLimiter::new(rate, burst),
        })
    }
}
