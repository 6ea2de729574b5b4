use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub node_env: String,
    pub db: DbConfig,
    pub rate_limit: RateLimitConfig,
    pub tenant: TenantConfig,
    pub internal: InternalConfig,
    pub stripe: StripeConfig,
    pub flutterwave: FlutterwaveConfig,
    pub webhooks: WebhookConfig,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

#[derive(Clone, Debug)]
pub struct TenantConfig {
    pub default_tenant_id: String,
    pub api_key_header: String,
    /// Signs the secret segment of tenant API keys.
    pub api_key_secret: String,
}

#[derive(Clone, Debug)]
pub struct InternalConfig {
    pub api_key: String,
    pub header: String,
}

#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub webhook_secret: String,
    pub signature_tolerance_secs: i64,
    pub price_starter: String,
    pub price_pro: String,
    pub price_enterprise: String,
}

#[derive(Clone, Debug)]
pub struct FlutterwaveConfig {
    pub secret_hash: String,
    pub plan_starter: String,
    pub plan_pro: String,
    pub plan_enterprise: String,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// An unprocessed event claimed longer ago than this may be claimed again.
    pub reclaim_after_secs: i64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Looks `provider_id` up in a list of `(provider id, plan id)` pairs, ignoring unset entries.
fn match_plan(provider_id: &str, pairs: [(&str, &'static str); 3]) -> Option<&'static str> {
    if provider_id.is_empty() {
        return None;
    }
    pairs
        .into_iter()
        .find(|(configured, _)| !configured.is_empty() && *configured == provider_id)
        .map(|(_, plan)| plan)
}

impl StripeConfig {
    /// Maps a Stripe price id onto a catalog plan id.
    pub fn plan_for_price(&self, price_id: &str) -> Option<&'static str> {
        match_plan(
            price_id,
            [
                (self.price_starter.as_str(), "starter"),
                (self.price_pro.as_str(), "pro"),
                (self.price_enterprise.as_str(), "enterprise"),
            ],
        )
    }
}

impl FlutterwaveConfig {
    /// Maps a Flutterwave payment plan id onto a catalog plan id.
    pub fn plan_for_payment_plan(&self, payment_plan: &str) -> Option<&'static str> {
        match_plan(
            payment_plan,
            [
                (self.plan_starter.as_str(), "starter"),
                (self.plan_pro.as_str(), "pro"),
                (self.plan_enterprise.as_str(), "enterprise"),
            ],
        )
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_or_parse("PORT", 3000),
            node_env: env_or("NODE_ENV", "development"),
            db: DbConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_or_parse("DB_PORT", 5432),
                database: env_or("DB_NAME", "billing"),
                user: env_or("DB_USER", "billing"),
                password: env_or("DB_PASSWORD", ""),
                pool_min: env_or_parse("DB_POOL_MIN", 2),
                pool_max: env_or_parse("DB_POOL_MAX", 20),
            },
            rate_limit: RateLimitConfig {
                window_secs: 60,
                max_requests: env_or_parse("RATE_LIMIT_MAX", 300),
            },
            tenant: TenantConfig {
                default_tenant_id: env_or("DEFAULT_TENANT_ID", ""),
                api_key_header: "x-api-key".to_string(),
                api_key_secret: env_or("TENANT_API_KEY_SECRET", ""),
            },
            internal: InternalConfig {
                api_key: env_or("INTERNAL_API_KEY", ""),
                header: "x-internal-key".to_string(),
            },
            stripe: StripeConfig {
                webhook_secret: env_or("STRIPE_WEBHOOK_SECRET", ""),
                signature_tolerance_secs: env_or_parse("STRIPE_SIGNATURE_TOLERANCE_SECS", 300),
                price_starter: env_or("STRIPE_PRICE_STARTER", ""),
                price_pro: env_or("STRIPE_PRICE_PRO", ""),
                price_enterprise: env_or("STRIPE_PRICE_ENTERPRISE", ""),
            },
            flutterwave: FlutterwaveConfig {
                secret_hash: env_or("FLW_SECRET_HASH", ""),
                plan_starter: env_or("FLW_PLAN_STARTER", ""),
                plan_pro: env_or("FLW_PLAN_PRO", ""),
                plan_enterprise: env_or("FLW_PLAN_ENTERPRISE", ""),
            },
            webhooks: WebhookConfig {
                reclaim_after_secs: env_or_parse("WEBHOOK_RECLAIM_AFTER_SECS", 300),
            },
        }
    }

    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        if let Ok(url) = env::var("POSTGRES_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db.user, self.db.password, self.db.host, self.db.port, self.db.database
        )
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        port: 0,
        node_env: "test".into(),
        db: DbConfig {
            host: "localhost".into(),
            port: 5432,
            database: "billing_test".into(),
            user: "billing".into(),
            password: String::new(),
            pool_min: 1,
            pool_max: 1,
        },
        rate_limit: RateLimitConfig {
            window_secs: 60,
            max_requests: 1000,
        },
        tenant: TenantConfig {
            default_tenant_id: String::new(),
            api_key_header: "x-api-key".into(),
            api_key_secret: "tenant-key-secret".into(),
        },
        internal: InternalConfig {
            api_key: "internal-test-key".into(),
            header: "x-internal-key".into(),
        },
        stripe: StripeConfig {
            webhook_secret: "whsec_test".into(),
            signature_tolerance_secs: 300,
            price_starter: "price_starter".into(),
            price_pro: "price_pro".into(),
            price_enterprise: String::new(),
        },
        flutterwave: FlutterwaveConfig {
            secret_hash: "flw-hash".into(),
            plan_starter: "1001".into(),
            plan_pro: "1002".into(),
            plan_enterprise: String::new(),
        },
        webhooks: WebhookConfig {
            reclaim_after_secs: 300,
        },
    }
}
