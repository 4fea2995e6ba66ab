//! Env-var resolution for webhook references and header values.
//!
//! Webhook URLs may embed `${VAR_NAME}` references or point at an env var
//! wholesale (`from_env`); headers may source their value from an env var.
//! Only uppercase `[A-Z_][A-Z0-9_]*` variable names are matched. Resolution
//! happens at delivery time, so a rotated secret takes effect without a
//! restart.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use chime_core::types::{EventHeader, HeaderConf, HeaderValueSource, WebhookConf};
use chime_core::EngineError;

/// Pattern matching valid uppercase env var names.
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

/// Resolve a webhook conf against the process environment.
pub fn resolve_webhook(conf: &WebhookConf) -> Result<String, EngineError> {
    resolve_webhook_with(conf, &std::env::vars().collect())
}

/// Resolve a webhook conf against a provided env map (useful for testing).
pub fn resolve_webhook_with(
    conf: &WebhookConf,
    env: &HashMap<String, String>,
) -> Result<String, EngineError> {
    match conf {
        WebhookConf::Url(template) => substitute(template, env)
            .map_err(|var| EngineError::WebhookResolution(format!("env var '{var}' is not set"))),
        WebhookConf::FromEnv { from_env } => lookup(env, from_env).ok_or_else(|| {
            EngineError::WebhookResolution(format!("env var '{from_env}' is not set"))
        }),
    }
}

/// Resolve a header conf list against the process environment.
pub fn resolve_headers(confs: &[HeaderConf]) -> Result<Vec<EventHeader>, EngineError> {
    resolve_headers_with(confs, &std::env::vars().collect())
}

/// Resolve a header conf list against a provided env map.
pub fn resolve_headers_with(
    confs: &[HeaderConf],
    env: &HashMap<String, String>,
) -> Result<Vec<EventHeader>, EngineError> {
    confs
        .iter()
        .map(|conf| {
            let value = match &conf.value {
                HeaderValueSource::Value(v) => v.clone(),
                HeaderValueSource::FromEnv(var) => lookup(env, var).ok_or_else(|| {
                    EngineError::HeaderResolution(format!(
                        "header '{}': env var '{var}' is not set",
                        conf.name
                    ))
                })?,
            };
            Ok(EventHeader {
                name: conf.name.clone(),
                value,
            })
        })
        .collect()
}

fn lookup(env: &HashMap<String, String>, var: &str) -> Option<String> {
    env.get(var).filter(|v| !v.is_empty()).cloned()
}

/// Substitute `${VAR}` references in a string. Returns the name of the first
/// missing variable on failure.
fn substitute(s: &str, env: &HashMap<String, String>) -> Result<String, String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut missing: Option<String> = None;
    let substituted = ENV_VAR_PATTERN.replace_all(s, |caps: &regex::Captures| {
        if missing.is_some() {
            return String::new();
        }
        let var_name = &caps[1];
        match lookup(env, var_name) {
            Some(val) => val,
            None => {
                missing = Some(var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(var),
        None => Ok(substituted.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literal_url_passes_through() {
        let conf = WebhookConf::Url("https://example.com/hook".into());
        let url = resolve_webhook_with(&conf, &HashMap::new()).unwrap();
        assert_eq!(url, "https://example.com/hook");
    }

    #[test]
    fn url_template_substitutes_vars() {
        let conf = WebhookConf::Url("${BASE_URL}/hooks/cron".into());
        let url =
            resolve_webhook_with(&conf, &env(&[("BASE_URL", "https://api.internal")])).unwrap();
        assert_eq!(url, "https://api.internal/hooks/cron");
    }

    #[test]
    fn from_env_reads_whole_var() {
        let conf = WebhookConf::FromEnv {
            from_env: "HOOK_URL".into(),
        };
        let url =
            resolve_webhook_with(&conf, &env(&[("HOOK_URL", "https://example.com/h")])).unwrap();
        assert_eq!(url, "https://example.com/h");
    }

    #[test]
    fn missing_var_is_an_error() {
        let conf = WebhookConf::Url("${NOT_SET}/x".into());
        let err = resolve_webhook_with(&conf, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("NOT_SET"));

        let conf = WebhookConf::FromEnv {
            from_env: "ALSO_NOT_SET".into(),
        };
        assert!(resolve_webhook_with(&conf, &HashMap::new()).is_err());
    }

    #[test]
    fn empty_var_counts_as_missing() {
        let conf = WebhookConf::FromEnv {
            from_env: "EMPTY".into(),
        };
        assert!(resolve_webhook_with(&conf, &env(&[("EMPTY", "")])).is_err());
    }

    #[test]
    fn headers_resolve_value_and_env() {
        let confs = vec![
            HeaderConf {
                name: "X-Static".into(),
                value: HeaderValueSource::Value("abc".into()),
            },
            HeaderConf {
                name: "Authorization".into(),
                value: HeaderValueSource::FromEnv("API_TOKEN".into()),
            },
        ];
        let headers = resolve_headers_with(&confs, &env(&[("API_TOKEN", "Bearer t0k")])).unwrap();
        assert_eq!(headers[0].value, "abc");
        assert_eq!(headers[1].value, "Bearer t0k");
    }

    #[test]
    fn header_missing_env_names_the_header() {
        let confs = vec![HeaderConf {
            name: "X-Key".into(),
            value: HeaderValueSource::FromEnv("NOPE".into()),
        }];
        let err = resolve_headers_with(&confs, &HashMap::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("X-Key") && msg.contains("NOPE"));
    }
}
