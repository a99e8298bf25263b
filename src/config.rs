//! Sandbox backend configuration bag and the driver's sanitization rule.

use std::collections::HashMap;

/// Free-form sandbox-backend configuration, e.g. `{"image": "python:3.12"}`
/// for the container backend.
pub type SandboxConfig = HashMap<String, serde_json::Value>;

/// Strip keys from `config` whose lowercased name contains both `api` and
/// `key`, or `secret`, or both `token` and `auth`. The returned bag is what
/// loggers and printers see; `config` itself is untouched.
pub fn sanitize(config: &SandboxConfig) -> SandboxConfig {
    config
        .iter()
        .filter(|(key, _)| !is_sensitive(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_lowercase();
    (lower.contains("api") && lower.contains("key"))
        || lower.contains("secret")
        || (lower.contains("token") && lower.contains("auth"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_api_key_variants() {
        let mut config = SandboxConfig::new();
        config.insert("openai_api_key".to_string(), serde_json::json!("sk-..."));
        config.insert("image".to_string(), serde_json::json!("python:3.12"));
        let sanitized = sanitize(&config);
        assert!(!sanitized.contains_key("openai_api_key"));
        assert!(sanitized.contains_key("image"));
    }

    #[test]
    fn strips_secret_and_auth_token_keys() {
        let mut config = SandboxConfig::new();
        config.insert("client_secret".to_string(), serde_json::json!("x"));
        config.insert("auth_token".to_string(), serde_json::json!("y"));
        config.insert("token".to_string(), serde_json::json!("z"));
        let sanitized = sanitize(&config);
        assert!(!sanitized.contains_key("client_secret"));
        assert!(!sanitized.contains_key("auth_token"));
        assert!(sanitized.contains_key("token"));
    }
}
