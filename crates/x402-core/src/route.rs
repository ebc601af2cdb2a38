//! Monetized route descriptors, configured from the environment.

use std::env;

/// Pricing and backend coordinates for one gateway route.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    /// Route key, the first path segment under `/v1/`.
    pub key: String,
    /// Public path prefix, e.g. `/v1/myapi`.
    pub path: String,
    pub backend_name: String,
    pub backend_url: String,
    /// Env var naming the internal API key injected on proxied requests.
    pub backend_api_key_env: String,
    /// Header the backend expects the key under.
    pub backend_api_key_header: String,
    /// Display price, e.g. `$0.01`.
    pub price: String,
    /// Integer price in base units at the 6-decimal reference scale.
    pub price_atomic: String,
    /// EVM recipient.
    pub pay_to: Option<String>,
    /// SVM recipient.
    pub pay_to_sol: Option<String>,
    pub description: String,
    pub mime_type: String,
}

pub struct RouteRegistry {
    routes: Vec<RouteDescriptor>,
}

impl RouteRegistry {
    /// Build the registry once at startup. A route from the built-in table is
    /// configured iff its `<PREFIX>_BACKEND_URL` is present; pricing and
    /// recipients come from per-route env vars with global fallbacks
    /// (`PAY_TO_ADDRESS`, `PAY_TO_ADDRESS_SOL`).
    pub fn from_env() -> Self {
        let routes = ROUTE_TABLE
            .iter()
            .filter_map(|spec| route_from_env(spec))
            .collect();
        Self { routes }
    }

    pub fn new(routes: Vec<RouteDescriptor>) -> Self {
        Self { routes }
    }

    pub fn resolve(&self, key: &str) -> Option<&RouteDescriptor> {
        self.routes.iter().find(|r| r.key == key)
    }

    pub fn all(&self) -> &[RouteDescriptor] {
        &self.routes
    }
}

struct RouteSpec {
    key: &'static str,
    env_prefix: &'static str,
    backend_name: &'static str,
    description: &'static str,
}

const ROUTE_TABLE: &[RouteSpec] = &[
    RouteSpec {
        key: "myapi",
        env_prefix: "MYAPI",
        backend_name: "myapi",
        description: "Paid access to the MyAPI backend",
    },
    RouteSpec {
        key: "search",
        env_prefix: "SEARCH",
        backend_name: "search",
        description: "Paid access to the search backend",
    },
    RouteSpec {
        key: "inference",
        env_prefix: "INFERENCE",
        backend_name: "inference",
        description: "Paid access to the inference backend",
    },
];

fn env_or(var: &str, fallback: &str) -> String {
    env::var(var).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| fallback.to_string())
}

fn env_opt(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn route_from_env(spec: &RouteSpec) -> Option<RouteDescriptor> {
    let p = spec.env_prefix;
    let backend_url = env_opt(&format!("{p}_BACKEND_URL"))?;
    let price = env_or(&format!("{p}_PRICE"), "$0.01");
    let price_atomic = env_opt(&format!("{p}_PRICE_ATOMIC"))
        .or_else(|| parse_price_atomic(&price))
        .unwrap_or_else(|| "10000".to_string());
    Some(RouteDescriptor {
        key: spec.key.to_string(),
        path: format!("/v1/{}", spec.key),
        backend_name: spec.backend_name.to_string(),
        backend_url,
        backend_api_key_env: format!("{p}_BACKEND_API_KEY"),
        backend_api_key_header: env_or(&format!("{p}_BACKEND_API_KEY_HEADER"), "x-api-key"),
        price,
        price_atomic,
        pay_to: env_opt(&format!("{p}_PAY_TO_ADDRESS")).or_else(|| env_opt("PAY_TO_ADDRESS")),
        pay_to_sol: env_opt(&format!("{p}_PAY_TO_ADDRESS_SOL"))
            .or_else(|| env_opt("PAY_TO_ADDRESS_SOL")),
        description: spec.description.to_string(),
        mime_type: "application/json".to_string(),
    })
}

/// Parse a display price like `$0.01` into base units at the 6-decimal
/// reference scale. Integer arithmetic only; no f64 in the pricing pipeline.
pub fn parse_price_atomic(price: &str) -> Option<String> {
    const DECIMALS: usize = 6;
    let cleaned: String = price
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (integer_part, fraction_part) = match cleaned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (cleaned.as_str(), ""),
    };
    let integer: u64 = if integer_part.is_empty() {
        0
    } else {
        integer_part.parse().ok()?
    };

    // Truncate beyond the reference scale, pad below it.
    let fraction_digits = fraction_part.len().min(DECIMALS);
    let fraction: u64 = if fraction_digits == 0 {
        0
    } else {
        fraction_part[..fraction_digits].parse().ok()?
    };
    let padding = 10u64.pow((DECIMALS - fraction_digits) as u32);

    let atomic = integer
        .checked_mul(10u64.pow(DECIMALS as u32))?
        .checked_add(fraction.checked_mul(padding)?)?;
    Some(atomic.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_requires_backend_url() {
        std::env::remove_var("SEARCH_BACKEND_URL");
        let spec = &ROUTE_TABLE[1];
        assert!(route_from_env(spec).is_none());
    }

    #[test]
    fn test_route_defaults_and_fallbacks() {
        std::env::set_var("INFERENCE_BACKEND_URL", "http://127.0.0.1:9/infer");
        std::env::set_var("PAY_TO_ADDRESS", "0x1111111111111111111111111111111111111111");
        let route = route_from_env(&ROUTE_TABLE[2]).unwrap();
        assert_eq!(route.path, "/v1/inference");
        assert_eq!(route.price_atomic, "10000");
        assert_eq!(route.backend_api_key_header, "x-api-key");
        assert_eq!(
            route.pay_to.as_deref(),
            Some("0x1111111111111111111111111111111111111111")
        );
        std::env::remove_var("INFERENCE_BACKEND_URL");
        std::env::remove_var("PAY_TO_ADDRESS");
    }

    #[test]
    fn test_resolve_unknown_route() {
        let registry = RouteRegistry::new(vec![]);
        assert!(registry.resolve("nonexistent").is_none());
    }

    #[test]
    fn test_parse_price_atomic() {
        assert_eq!(parse_price_atomic("$0.01").as_deref(), Some("10000"));
        assert_eq!(parse_price_atomic("$1.00").as_deref(), Some("1000000"));
        assert_eq!(parse_price_atomic("0.001").as_deref(), Some("1000"));
        assert_eq!(parse_price_atomic("$1").as_deref(), Some("1000000"));
        assert_eq!(parse_price_atomic("0.000001").as_deref(), Some("1"));
        // 7 fractional digits truncate to the reference scale.
        assert_eq!(parse_price_atomic("0.0000019").as_deref(), Some("1"));
        assert_eq!(parse_price_atomic("$"), None);
    }
}
