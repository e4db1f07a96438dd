use ember_infer::ember_types::{EmberError, RunMode};
use ember_infer::EmberConfig;
use std::io::Write;

#[test]
fn loads_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[router]
run_mode = "decode"
max_total_token_num = 4096
batch_max_tokens = 1024
chunked_prefill_size = 512
router_token_ratio = 0.1
eos_ids = [2, 7]

[kv_cache]
head_num = 4
head_dim = 64
dtype = "bf16"

[parallel]
dp = 2
cards_per_shard = 4

[transfer]
worker_count = 8

[logging]
level = "debug"
format = "json"
"#
    )
    .unwrap();

    let config = EmberConfig::from_file(file.path()).unwrap();
    assert_eq!(config.router.run_mode, RunMode::Decode);
    assert_eq!(config.router.admission_limit(), 4096 - 409);
    assert_eq!(config.router.eos_ids.len(), 2);
    assert_eq!(config.kv_cache.vector_bytes(), 4 * 64 * 2);
    assert_eq!(config.parallel.cards_per_shard, 4);
    assert_eq!(config.transfer.worker_count, 8);
    assert_eq!(config.logging.format, "json");
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EmberConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, EmberError::Config { .. }));
}

#[test]
fn cross_section_checks() {
    let err = EmberConfig::from_toml_str(
        r#"
[router]
max_total_token_num = 1024
max_req_total_len = 512
batch_max_tokens = 1024
chunked_prefill_size = 512

[kv_cache]
use_dynamic_prompt_cache = true
cache_capacity = 2048
"#,
    )
    .unwrap_err();
    assert!(matches!(err, EmberError::Config { .. }));

    let err = EmberConfig::from_toml_str(
        r#"
[router]
run_mode = "prefill"
is_embedding = true
"#,
    )
    .unwrap_err();
    assert!(matches!(err, EmberError::Config { .. }));
}

#[test]
fn request_length_must_fit_under_admission_limit() {
    let err = EmberConfig::from_toml_str(
        r#"
[router]
max_total_token_num = 1000
router_token_ratio = 0.25
max_req_total_len = 900
"#,
    )
    .unwrap_err();
    match err {
        EmberError::Config { message } => assert!(message.contains("max_req_total_len")),
        other => panic!("unexpected error {:?}", other),
    }

    let config = EmberConfig::from_toml_str(
        r#"
[router]
max_total_token_num = 1000
router_token_ratio = 0.25
max_req_total_len = 750
batch_max_tokens = 750
chunked_prefill_size = 256
"#,
    )
    .unwrap();
    assert_eq!(config.router.admission_limit(), 750);
}

#[test]
fn environment_overrides_apply_and_validate() {
    std::env::set_var("EMBER_RUN_MODE", "prefill");
    std::env::set_var("EMBER_DP", "3");
    let config = EmberConfig::default().with_env_overrides().unwrap();
    assert_eq!(config.router.run_mode, RunMode::Prefill);
    assert_eq!(config.parallel.dp, 3);

    std::env::set_var("EMBER_DP", "0");
    assert!(EmberConfig::default().with_env_overrides().is_err());

    std::env::set_var("EMBER_RUN_MODE", "sideways");
    assert!(EmberConfig::default().with_env_overrides().is_err());

    std::env::remove_var("EMBER_RUN_MODE");
    std::env::remove_var("EMBER_DP");
}
