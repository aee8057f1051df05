//! Integration tests for the full Config::from_file_with_env pipeline.
//!
//! TOML file -> raw parse -> env var expansion -> final Config with
//! KeySource metadata.
//!
//! Convention variables are fixed per provider, so each test uses a
//! different provider and its own variable names to avoid parallel
//! interference.

use std::io::Write;

use keyrelay::config::{convention_env_var_name, Config, KeySource};
use keyrelay::types::Provider;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp config");
    file.write_all(content.as_bytes())
        .expect("Failed to write temp config");
    file
}

fn source_for(sources: &[(Provider, KeySource)], provider: Provider) -> KeySource {
    sources
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, s)| s.clone())
        .expect("key source should be reported for every provider")
}

/// `${VAR}` references in api_key are expanded from the environment.
#[test]
fn test_env_expansion_resolves_var() {
    let var_name = "KEYRELAY_TEST_GOOGLE_SEED_KEY";
    unsafe { std::env::set_var(var_name, "g-resolved") };

    let file = write_config(&format!(
        r#"
[server]
listen = "127.0.0.1:19876"

[[providers]]
name = "google"
url = "https://example.com/v1"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let (config, key_sources) =
        Config::from_file_with_env(file.path()).expect("from_file_with_env should succeed");

    let provider = config.provider(Provider::Google).expect("google configured");
    assert_eq!(
        provider.api_key.as_ref().unwrap().expose_secret(),
        "g-resolved"
    );
    assert_eq!(
        source_for(&key_sources, Provider::Google),
        KeySource::EnvExpanded
    );

    unsafe { std::env::remove_var(var_name) };
}

/// Missing env vars produce errors naming the variable and its owner.
#[test]
fn test_env_expansion_missing_var_errors() {
    let var_name = "KEYRELAY_TEST_DEFINITELY_MISSING";
    unsafe { std::env::remove_var(var_name) };

    let file = write_config(&format!(
        r#"
[server]
listen = "127.0.0.1:19877"

[[providers]]
name = "replicate"
url = "https://example.com/v1"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let err = Config::from_file_with_env(file.path())
        .unwrap_err()
        .to_string();
    assert!(err.contains(var_name), "error should name the variable: {}", err);
    assert!(err.contains("replicate"), "error should name the provider: {}", err);
}

/// A provider without api_key picks up KEYRELAY_<PROVIDER>_API_KEY.
#[test]
fn test_env_convention_discovers_key() {
    let var_name = convention_env_var_name(Provider::Cohere);
    unsafe { std::env::set_var(&var_name, "co-convention") };

    let file = write_config(
        r#"
[server]
listen = "127.0.0.1:19878"

[[providers]]
name = "cohere"
url = "https://example.com/v1"
"#,
    );

    let (config, key_sources) =
        Config::from_file_with_env(file.path()).expect("from_file_with_env should succeed");

    let provider = config.provider(Provider::Cohere).expect("cohere configured");
    assert_eq!(
        provider.api_key.as_ref().unwrap().expose_secret(),
        "co-convention"
    );
    assert_eq!(
        source_for(&key_sources, Provider::Cohere),
        KeySource::Convention(var_name.clone())
    );

    unsafe { std::env::remove_var(&var_name) };
}

/// No api_key and no convention variable: the provider has no system key.
#[test]
fn test_env_no_key_produces_none_source() {
    unsafe { std::env::remove_var(convention_env_var_name(Provider::HuggingFace)) };

    let file = write_config(
        r#"
[server]
listen = "127.0.0.1:19879"

[[providers]]
name = "huggingface"
url = "https://example.com/v1"
"#,
    );

    let (config, key_sources) =
        Config::from_file_with_env(file.path()).expect("from_file_with_env should succeed");

    assert!(config
        .provider(Provider::HuggingFace)
        .unwrap()
        .api_key
        .is_none());
    assert_eq!(
        source_for(&key_sources, Provider::HuggingFace),
        KeySource::None
    );
}

/// The encryption key is expanded the same way as provider keys.
#[test]
fn test_encryption_key_expanded() {
    let var_name = "KEYRELAY_TEST_VAULT_PASSPHRASE";
    unsafe { std::env::set_var(var_name, "correct horse battery staple") };

    let file = write_config(&format!(
        r#"
[server]
listen = "127.0.0.1:19880"

[security]
encryption_key = "${{{}}}"
"#,
        var_name
    ));

    let (config, _) =
        Config::from_file_with_env(file.path()).expect("from_file_with_env should succeed");
    assert_eq!(
        config
            .security
            .encryption_key
            .as_ref()
            .unwrap()
            .expose_secret(),
        "correct horse battery staple"
    );

    unsafe { std::env::remove_var(var_name) };
}

/// Balancer seeds are validated while loading.
#[test]
fn test_invalid_balancer_seed_rejected() {
    let file = write_config(
        r#"
[server]

[[balancer]]
model = "gpt-x"
weights = { openai = 1.0 }
fallback = []
"#,
    );

    let err = Config::from_file_with_env(file.path())
        .unwrap_err()
        .to_string();
    assert!(err.contains("gpt-x"), "error should name the model: {}", err);
}
