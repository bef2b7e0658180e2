use std::str::FromStr;

use shard_backend::BackendConfig;

use crate::error::{Result, SessionError};

/// Schemes understood by `ModelReference::parse`.
pub const KNOWN_SCHEMES: [&str; 3] = ["deterministic", "fixed", "engine"];

/// Scheme assumed for references without a recognised prefix.
pub const DEFAULT_SCHEME: &str = "engine";

/// A parsed model reference: which backend family to use and how to open it.
///
/// Grammar: `<scheme>:<model>[?key=value&key=value...]`. A reference that
/// does not start with a known scheme is taken whole as an engine model path,
/// so `E:\models\a.gguf` and `/models/a.gguf` both select the engine family.
///
/// Recognised keys:
/// - `vocab` -> `BackendConfig::vocab_size`
/// - `n_ctx` -> `BackendConfig::n_ctx`
/// - `seed`  -> `BackendConfig::seed`
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReference {
    pub scheme: String,
    pub config: BackendConfig,
}

impl ModelReference {
    pub fn parse(reference: &str) -> Result<ModelReference> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SessionError::Initialization(
                "model reference is empty".to_string(),
            ));
        }

        let (scheme, rest) = match reference.split_once(':') {
            Some((prefix, rest)) if KNOWN_SCHEMES.contains(&prefix) => (prefix, rest),
            _ => (DEFAULT_SCHEME, reference),
        };

        let (model, query) = match rest.split_once('?') {
            Some((model, query)) => (model, Some(query)),
            None => (rest, None),
        };

        let mut config = BackendConfig::new(model);
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                apply_option(&mut config, pair)?;
            }
        }
        config
            .validate()
            .map_err(|e| SessionError::Initialization(e.to_string()))?;

        Ok(ModelReference {
            scheme: scheme.to_string(),
            config,
        })
    }
}

impl FromStr for ModelReference {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        ModelReference::parse(s)
    }
}

fn apply_option(config: &mut BackendConfig, pair: &str) -> Result<()> {
    let (key, value) = pair.split_once('=').ok_or_else(|| {
        SessionError::Initialization(format!("option {:?} is not key=value", pair))
    })?;
    match key {
        "vocab" => config.vocab_size = parse_value(key, value)?,
        "n_ctx" => config.n_ctx = parse_value(key, value)?,
        "seed" => config.seed = parse_value(key, value)?,
        other => {
            return Err(SessionError::Initialization(format!(
                "unknown model option: {}",
                other
            )))
        }
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        SessionError::Initialization(format!("invalid value for {}: {:?}", key, value))
    })
}
