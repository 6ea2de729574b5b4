use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::middleware::tenant::TenantId;
use crate::AppState;

/// Fixed-window request counter, per client key.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, WindowEntry>>>,
    max_requests: u32,
    window_secs: i64,
}

struct WindowEntry {
    count: u32,
    reset_at: i64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX),
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, chrono::Utc::now().timestamp()).await
    }

    async fn check_at(&self, key: &str, now: i64) -> bool {
        let mut windows = self.windows.lock().await;

        // prune expired windows
        if windows.len() > 10_000 {
            windows.retain(|_, entry| entry.reset_at > now);
        }

        let entry = windows.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            reset_at: now.saturating_add(self.window_secs),
        });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now.saturating_add(self.window_secs);
        }

        entry.count += 1;
        entry.count <= self.max_requests
    }
}

fn get_client_key(req: &Request) -> String {
    // Tenant once resolved, otherwise IP
    if let Some(TenantId(tenant_id)) = req.extensions().get::<TenantId>() {
        return format!("tenant:{}", tenant_id);
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| format!("ip:{}", v.split(',').next().unwrap_or("unknown").trim()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

/// Middleware: tenant-facing rate limiter.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = get_client_key(&req);
    if !state.rate_limiter.check(&key).await {
        tracing::warn!(client = %key, "Rate limit exceeded");
        return Err(AppError::RateLimited);
    }
    Ok(next.run(req).await)
}
