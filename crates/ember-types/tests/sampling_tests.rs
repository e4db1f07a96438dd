use ember_types::*;

#[test]
fn sampling_params_validation() {
    assert!(SamplingParams::default().validate().is_ok());
    assert!(SamplingParams::greedy(4).is_greedy());

    let bad = SamplingParams {
        max_new_tokens: 0,
        ..Default::default()
    };
    assert!(matches!(bad.validate(), Err(EmberError::MalformedRequest { .. })));

    let bad = SamplingParams {
        top_p: 0.0,
        ..Default::default()
    };
    assert!(bad.validate().is_err());

    let bad = SamplingParams {
        temperature: f32::NAN,
        ..Default::default()
    };
    assert!(bad.validate().is_err());
}

#[test]
fn priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

#[test]
fn finish_status_encoding() {
    for status in [
        FinishStatus::NotFinished,
        FinishStatus::FinishedByEos,
        FinishStatus::FinishedByLength,
        FinishStatus::Aborted,
    ] {
        assert_eq!(FinishStatus::from_u8(status.as_u8()), status);
    }
    assert_eq!(FinishStatus::from_u8(42), FinishStatus::Aborted);
    assert!(!FinishStatus::NotFinished.is_finished());
    assert_eq!(FinishStatus::FinishedByEos.to_string(), "FINISHED_BY_EOS");
}

#[test]
fn request_validation() {
    let req = InferenceRequest::new(
        RequestId::new(1),
        vec![TokenId::new(5); 10],
        SamplingParams::greedy(8),
    );
    assert!(req.validate(18).is_ok());
    assert!(matches!(
        req.validate(17),
        Err(EmberError::MalformedRequest { .. })
    ));

    let empty = InferenceRequest::new(RequestId::new(2), vec![], SamplingParams::default());
    assert!(empty.validate(100).is_err());
}
