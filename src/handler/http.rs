//! `http` handler: outbound requests with egress hygiene.
//!
//! The `url`, header values, and `body` render as templates against the
//! action input before the request is built, the same way the `llm`
//! handler renders its prompts; only `method` is taken literally. URLs are
//! validated after rendering and before any connection: only http/https
//! schemes, no loopback, private, link-local, metadata, or
//! cluster-internal hosts. Redirects are not followed (a redirect can
//! tunnel into an internal service after validation passed).
//!
//! Non-2xx statuses are permanent failures coded `http_<status>`; timeouts
//! and connection failures are retryable. JSON bodies parse into the
//! output; anything else lands under `{ body, status }`.

use serde_json::{json, Value};
use std::net::IpAddr;
use std::time::Duration;

use crate::action::HttpImplementation;
use crate::template::{self, TemplateError};

use super::{parse_impl, ActionResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY_BYTES: usize = 10_000_000;

/// Request parts after template resolution against the action input.
#[derive(Debug, PartialEq)]
struct ResolvedRequest {
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

pub async fn execute(implementation: &Value, input: Value) -> ActionResult {
    let imp: HttpImplementation = match parse_impl(implementation, "http") {
        Ok(imp) => imp,
        Err(fail) => return *fail,
    };

    let resolved = match resolve_request(&imp, &input) {
        Ok(resolved) => resolved,
        Err(e) => {
            return ActionResult::permanent(format!("http request template: {}", e), "template_error")
        }
    };

    if let Err(reason) = validate_egress_url(&resolved.url) {
        return ActionResult::permanent(
            format!("{}: {}", resolved.url, reason),
            "egress_blocked",
        );
    }

    let method = imp.method.as_deref().unwrap_or("GET").to_uppercase();
    let timeout = imp.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);

    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(e) => return ActionResult::permanent(format!("http client: {}", e), "http_client"),
    };

    let mut request = match method.as_str() {
        "GET" => client.get(&resolved.url),
        "POST" => client.post(&resolved.url),
        "PUT" => client.put(&resolved.url),
        "DELETE" => client.delete(&resolved.url),
        "PATCH" => client.patch(&resolved.url),
        "HEAD" => client.head(&resolved.url),
        other => {
            return ActionResult::permanent(
                format!("unsupported HTTP method '{}'", other),
                "invalid_implementation",
            )
        }
    };

    for (name, value) in &resolved.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &resolved.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let (code, retryable) = if e.is_timeout() {
                ("timeout", true)
            } else if e.is_connect() {
                ("network", true)
            } else {
                ("http_send", false)
            };
            return ActionResult::fail(format!("http request failed: {}", e), code, retryable);
        }
    };

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = if body.len() > MAX_BODY_BYTES {
        body[..MAX_BODY_BYTES].to_string()
    } else {
        body
    };

    if !status.is_success() {
        return ActionResult::permanent(
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, 500)),
            &format!("http_{}", status.as_u16()),
        );
    }

    let output = match serde_json::from_str::<Value>(&body) {
        Ok(parsed) => parsed,
        Err(_) => json!({ "body": body, "status": status.as_u16() }),
    };
    ActionResult::ok(output)
}

/// Render `url`, header values, and `body` against the action input.
/// Header names are static by construction; `method` is never templated.
fn resolve_request(imp: &HttpImplementation, input: &Value) -> Result<ResolvedRequest, TemplateError> {
    let url = template::render(&imp.url, input)?;

    let mut headers = Vec::new();
    if let Some(raw) = &imp.headers {
        for (name, value) in raw {
            headers.push((name.clone(), template::render(value, input)?));
        }
    }
    headers.sort();

    let body = match &imp.body {
        Some(body) => Some(render_body(body, input)?),
        None => None,
    };

    Ok(ResolvedRequest { url, headers, body })
}

/// Render every string leaf of a body value; other leaves pass through.
fn render_body(value: &Value, input: &Value) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => template::render(s, input).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| render_body(item, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), render_body(item, input)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn truncate(s: &str, limit: usize) -> &str {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Reject URLs that could reach internal surfaces.
fn validate_egress_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL: {}", e))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("scheme '{}' not allowed, only http/https", scheme)),
    }

    let host = parsed.host_str().ok_or_else(|| "URL has no host".to_string())?;

    // Hostname obfuscation (percent-escapes, hex octets) is rejected
    // outright rather than decoded.
    if host.contains('%') || host.to_ascii_lowercase().contains("0x") {
        return Err("encoded hostname not allowed".to_string());
    }

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".localdomain") {
        return Err("loopback host not allowed".to_string());
    }
    if host == "169.254.169.254"
        || host.ends_with(".internal")
        || host.ends_with(".metadata")
        || host == "metadata.goog"
    {
        return Err("metadata endpoint not allowed".to_string());
    }
    if host.ends_with(".svc.cluster.local") || host.ends_with(".pod.cluster.local") {
        return Err("cluster-internal host not allowed".to_string());
    }

    let addr = match parsed.host() {
        Some(url::Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
        Some(url::Host::Domain(domain)) => domain.parse::<IpAddr>().ok(),
        None => None,
    };
    if let Some(ip) = addr {
        if is_internal_ip(&ip) {
            return Err(format!("internal address {} not allowed", ip));
        }
    }

    Ok(())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                // 100.64.0.0/10 carrier-grade NAT
                || (o[0] == 100 && (64..=127).contains(&o[1]))
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (o[0] & 0xfe) == 0xfc
                // fe80::/10 link-local
                || (o[0] == 0xfe && (o[1] & 0xc0) == 0x80)
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal_ip(&IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_url_and_headers_from_input() {
        let imp: HttpImplementation = serde_json::from_value(json!({
            "url": "https://{{service.host}}/v1/users/{{user.id}}",
            "headers": {
                "Authorization": "Bearer {{auth.token}}",
                "X-Request-Id": "{{request_id}}",
            },
            "body": {
                "name": "{{user.name}}",
                "tags": ["static", "{{user.role}}"],
                "limit": 10,
            },
        }))
        .unwrap();
        let input = json!({
            "service": { "host": "api.example.com" },
            "user": { "id": 42, "name": "ada", "role": "admin" },
            "auth": { "token": "tok-123" },
            "request_id": "req-9",
        });

        let resolved = resolve_request(&imp, &input).unwrap();
        assert_eq!(resolved.url, "https://api.example.com/v1/users/42");
        assert_eq!(
            resolved.headers,
            vec![
                ("Authorization".to_string(), "Bearer tok-123".to_string()),
                ("X-Request-Id".to_string(), "req-9".to_string()),
            ]
        );
        assert_eq!(
            resolved.body,
            Some(json!({
                "name": "ada",
                "tags": ["static", "admin"],
                "limit": 10,
            }))
        );
    }

    #[test]
    fn literal_requests_resolve_unchanged() {
        let imp: HttpImplementation = serde_json::from_value(json!({
            "url": "https://api.example.com/v1",
            "headers": { "Accept": "application/json" },
        }))
        .unwrap();
        let resolved = resolve_request(&imp, &json!({})).unwrap();
        assert_eq!(resolved.url, "https://api.example.com/v1");
        assert_eq!(
            resolved.headers,
            vec![("Accept".to_string(), "application/json".to_string())]
        );
        assert_eq!(resolved.body, None);
    }

    #[tokio::test]
    async fn rendered_url_is_validated_after_substitution() {
        // The blocked host arrives through the input, so validation must
        // run on the rendered URL, not the template.
        let imp = json!({ "url": "http://{{target}}/admin" });
        let result = execute(&imp, json!({ "target": "169.254.169.254" })).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code.as_deref(), Some("egress_blocked"));
        assert!(error.message.contains("169.254.169.254"));
    }

    #[tokio::test]
    async fn broken_template_is_permanent() {
        let imp = json!({ "url": "http://{{oops" });
        let result = execute(&imp, json!({})).await;
        let error = result.error.unwrap();
        assert!(!error.retryable);
        assert_eq!(error.code.as_deref(), Some("template_error"));
    }

    #[test]
    fn blocks_loopback_and_private_hosts() {
        for url in [
            "http://localhost/x",
            "http://127.0.0.1:8080/x",
            "http://[::1]/x",
            "http://10.1.2.3/x",
            "http://172.16.0.9/x",
            "http://192.168.1.1/x",
            "http://169.254.1.1/x",
            "http://100.64.0.1/x",
        ] {
            assert!(validate_egress_url(url).is_err(), "{} should be blocked", url);
        }
    }

    #[test]
    fn blocks_metadata_and_cluster_hosts() {
        for url in [
            "http://169.254.169.254/latest/meta-data",
            "http://metadata.goog/",
            "http://api.internal/x",
            "http://db.default.svc.cluster.local/x",
        ] {
            assert!(validate_egress_url(url).is_err(), "{} should be blocked", url);
        }
    }

    #[test]
    fn blocks_non_http_schemes_and_obfuscation() {
        assert!(validate_egress_url("file:///etc/passwd").is_err());
        assert!(validate_egress_url("gopher://host/").is_err());
        assert!(validate_egress_url("http://0x7f000001/").is_err());
        assert!(validate_egress_url("http://127%2e0%2e0%2e1/").is_err());
    }

    #[test]
    fn blocks_private_ipv6() {
        assert!(validate_egress_url("http://[fc00::1]/").is_err());
        assert!(validate_egress_url("http://[fe80::1]/").is_err());
        assert!(validate_egress_url("http://[::ffff:192.168.0.1]/").is_err());
    }

    #[test]
    fn allows_public_hosts() {
        assert!(validate_egress_url("https://api.example.com/v1").is_ok());
        assert!(validate_egress_url("https://8.8.8.8/dns").is_ok());
        assert!(validate_egress_url("http://[2607:f8b0::1]/").is_ok());
    }

    #[tokio::test]
    async fn blocked_url_is_permanent_failure() {
        let imp = json!({ "url": "http://localhost/api" });
        let result = execute(&imp, json!({})).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(!error.retryable);
        assert_eq!(error.code.as_deref(), Some("egress_blocked"));
    }

    #[tokio::test]
    async fn unsupported_method_rejected() {
        let imp = json!({ "url": "https://api.example.com/x", "method": "TRACE" });
        let result = execute(&imp, json!({})).await;
        assert_eq!(
            result.error.unwrap().code.as_deref(),
            Some("invalid_implementation")
        );
    }
}
