use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct TenantId(pub String);

/// Extracts the tenant id from an API key of the form `tenant_{id}_{secret}`, where
/// `secret` is the hex HMAC-SHA256 of the id under `signing_secret`. An empty signing
/// secret accepts no keys.
pub fn tenant_from_api_key<'a>(key: &'a str, signing_secret: &str) -> Option<&'a str> {
    if signing_secret.is_empty() {
        return None;
    }
    let mut parts = key.splitn(3, '_');
    let (Some("tenant"), Some(id), Some(secret)) = (parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if id.is_empty() {
        return None;
    }

    let expected = hex::decode(secret).ok()?;
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes()).ok()?;
    mac.update(id.as_bytes());
    mac.verify_slice(&expected).ok()?;
    Some(id)
}

#[cfg(test)]
pub(crate) fn issue_api_key(tenant_id: &str, signing_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes()).unwrap();
    mac.update(tenant_id.as_bytes());
    format!("tenant_{}_{}", tenant_id, hex::encode(mac.finalize().into_bytes()))
}

/// Middleware: resolves the tenant from the api key header, falling back to the
/// configured default tenant. Requests with neither are rejected.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let from_key = req
        .headers()
        .get(&state.config.tenant.api_key_header)
        .and_then(|v| v.to_str().ok())
        .and_then(|key| tenant_from_api_key(key, &state.config.tenant.api_key_secret))
        .map(str::to_string);

    let tenant_id = match from_key {
        Some(id) => id,
        None if !state.config.tenant.default_tenant_id.is_empty() => {
            state.config.tenant.default_tenant_id.clone()
        }
        None => return Err(AppError::Unauthorized("Missing or invalid API key".into())),
    };

    req.extensions_mut().insert(TenantId(tenant_id));
    Ok(next.run(req).await)
}
