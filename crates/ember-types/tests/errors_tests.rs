use ember_types::*;

#[test]
fn error_constructors_and_classes() {
    let e = EmberError::out_of_memory(60, 50, 100);
    assert!(e.is_recoverable());
    assert!(!e.is_fatal());
    assert_eq!(
        e.to_string(),
        "Out of memory: requested 60 slots, 50 free of 100"
    );

    let e = EmberError::model_executor("device lost");
    assert!(e.is_fatal());
    assert!(!e.is_recoverable());

    let e = EmberError::transfer_shape_mismatch("3 handles for 2 shards");
    assert!(e.is_request_error());
    assert!(EmberError::malformed_request("x").is_request_error());
    assert!(!EmberError::config("bad").is_request_error());
}

#[test]
fn error_conversions() {
    let io_err: EmberError = std::io::Error::new(std::io::ErrorKind::Other, "io").into();
    assert!(matches!(io_err, EmberError::Io { .. }));

    let ser_err: EmberError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(ser_err, EmberError::Serialization { .. }));

    let toml_err: EmberError = toml::from_str::<RouterConfig>("max_total_token_num = \"x\"")
        .unwrap_err()
        .into();
    assert!(matches!(toml_err, EmberError::Config { .. }));
}

#[test]
fn error_serializes() {
    let e = EmberError::out_of_memory(1, 0, 4);
    let json = serde_json::to_string(&e).unwrap();
    let back: EmberError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, e);
}
