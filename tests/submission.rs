use broadside::coordinator::{EngineConfig, SubmissionCoordinator, SubmissionMode, SubmitOptions};
use broadside::http::{HttpResponse, MockHttpClient};
use broadside::{BroadsideError, JsonRecord, MessageType, SubmissionStatus};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ROOT: &str = "https://erp.example.com/sap/opu/odata/sap/API_FIXEDASSET_SRV";

fn records(n: usize) -> Vec<JsonRecord> {
    (1..=n)
        .map(|i| {
            JsonRecord::new(
                i.to_string(),
                json!({"CompanyCode": "1010", "AssetClass": format!("{:04}", i)}),
            )
        })
        .collect()
}

fn coordinator(
    mock: &MockHttpClient,
    mode: SubmissionMode,
) -> SubmissionCoordinator<MockHttpClient> {
    let config = EngineConfig {
        mode,
        message_source: "fixed-assets".to_string(),
        ..EngineConfig::new(ROOT, "A_FixedAsset")
    };
    SubmissionCoordinator::new(Arc::new(mock.clone()), config).unwrap()
}

fn token_response(value: &str) -> HttpResponse {
    HttpResponse::new(200, "").with_header("x-csrf-token", value)
}

/// A `$batch` response wrapping the given parts in one changeset.
fn batch_response(parts: &[(u16, &str)]) -> HttpResponse {
    let ids: Vec<String> = (1..=parts.len()).map(|i| i.to_string()).collect();
    let with_ids: Vec<(&str, u16, &str)> = ids
        .iter()
        .zip(parts)
        .map(|(id, (status, body))| (id.as_str(), *status, *body))
        .collect();
    batch_response_with_ids(&with_ids)
}

fn batch_response_with_ids(parts: &[(&str, u16, &str)]) -> HttpResponse {
    let mut inner = String::new();
    for (content_id, status, body) in parts {
        inner.push_str(&format!(
            "--changesetresponse_t\r\nContent-Type: application/http\r\nContent-Transfer-Encoding: binary\r\nContent-ID: {}\r\n\r\nHTTP/1.1 {} X\r\nContent-Type: application/json\r\n\r\n{}\r\n",
            content_id, status, body
        ));
    }
    inner.push_str("--changesetresponse_t--\r\n");
    let body = format!(
        "--batchresponse_t\r\nContent-Type: multipart/mixed; boundary=changesetresponse_t\r\n\r\n{inner}\r\n--batchresponse_t--\r\n"
    );
    HttpResponse::new(202, body)
        .with_header("content-type", "multipart/mixed; boundary=batchresponse_t")
}

fn all_created(n: usize) -> HttpResponse {
    let parts: Vec<(u16, &str)> = (0..n).map(|_| (201, r#"{"d":{"ok":true}}"#)).collect();
    batch_response(&parts)
}

#[test_log::test(tokio::test)]
async fn test_transport_failure_fails_only_its_batch() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("POST /$batch", Ok(all_created(10)));
    mock.add_response(
        "POST /$batch",
        Err(BroadsideError::Other(anyhow::anyhow!("connection reset"))),
    );
    mock.add_response("POST /$batch", Ok(all_created(5)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes_clone = sizes.clone();

    let result = engine
        .submit(
            records(25),
            SubmitOptions::default()
                .batch_size(10)
                .on_batch_start(move |start| sizes_clone.lock().push(start.batch_size)),
        )
        .await
        .unwrap();

    assert_eq!(*sizes.lock(), vec![10, 10, 5]);
    assert_eq!(result.total_records, 25);
    assert_eq!(result.success_count, 15);
    assert_eq!(result.failure_count, 10);
    assert!(!result.cancelled);
    assert!(result.is_partial());

    assert!(result.failed_records.iter().all(|f| f.batch_index == 1));
    assert!(result.failed_records.iter().all(|f| f.http_status.is_none()));
    assert_eq!(result.failed_records[0].code.as_deref(), Some("TRANSPORT_ERROR"));
    let failed_ids: Vec<String> = result.failed_records.iter().map(|f| f.record.id.clone()).collect();
    assert_eq!(failed_ids, (11..=20).map(|i| i.to_string()).collect::<Vec<_>>());

    // One message per record, all attributed to the configured source
    assert_eq!(result.all_messages.len(), 25);
    assert!(result.all_messages.iter().all(|m| m.source == "fixed-assets"));

    // Token fetched once and sent on every batch
    assert_eq!(mock.calls_to("HEAD /").len(), 1);
    let posts = mock.calls_to("POST /$batch");
    assert_eq!(posts.len(), 3);
    for call in &posts {
        assert_eq!(call.header("X-CSRF-Token"), Some("tok-1"));
        assert!(
            call.header("Content-Type")
                .unwrap()
                .starts_with("multipart/mixed; boundary=batch_")
        );
    }
    assert!(matches!(engine.status(), SubmissionStatus::Completed { .. }));
}

#[test_log::test(tokio::test)]
async fn test_partial_changeset_maps_parts_to_records() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response(
        "POST /$batch",
        Ok(batch_response(&[
            (201, r#"{"d":{"MasterFixedAsset":"500001"}}"#),
            (
                400,
                r#"{"error":{"code":"AA/344","message":{"lang":"en","value":"Asset class missing"}}}"#,
            ),
        ])),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(2), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 1);

    let ok = &result.success_entries[0];
    assert_eq!(ok.record.id, "1");
    assert_eq!(ok.http_status, Some(201));
    assert_eq!(ok.raw_details, Some(json!({"d":{"MasterFixedAsset":"500001"}})));

    let failed = &result.failed_records[0];
    assert_eq!(failed.record.id, "2");
    assert_eq!(failed.http_status, Some(400));
    assert_eq!(failed.message, "Asset class missing");
    assert_eq!(failed.code.as_deref(), Some("AA/344"));

    let error_message = result
        .all_messages
        .iter()
        .find(|m| m.message_type == MessageType::Error)
        .unwrap();
    assert_eq!(error_message.entity_id.as_deref(), Some("2"));
    assert_eq!(error_message.batch_index, Some(0));
}

#[test_log::test(tokio::test)]
async fn test_flat_error_part_message() {
    let mock = MockHttpClient::new();
    mock.add_response(
        "POST /$batch",
        Ok(batch_response(&[
            (201, r#"{"id":"A1"}"#),
            (400, r#"{"error":{"message":"bad value"}}"#),
        ])),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(2), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_entries[0].raw_details, Some(json!({"id":"A1"})));
    assert_eq!(result.failed_records[0].message, "bad value");
    assert_eq!(result.failed_records[0].code.as_deref(), Some("HTTP_400"));
}

#[test_log::test(tokio::test)]
async fn test_rejected_token_is_refreshed_and_retried_once() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("HEAD /", Ok(token_response("tok-2")));
    mock.add_response(
        "POST /$batch",
        Ok(HttpResponse::new(403, "CSRF token validation failed")
            .with_header("x-csrf-token", "Required")),
    );
    mock.add_response("POST /$batch", Ok(all_created(3)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 3);
    assert_eq!(mock.calls_to("HEAD /").len(), 2);

    let posts = mock.calls_to("POST /$batch");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].header("X-CSRF-Token"), Some("tok-1"));
    assert_eq!(posts[1].header("X-CSRF-Token"), Some("tok-2"));
    assert_eq!(engine.tokens().current().await.value.as_deref(), Some("tok-2"));
}

#[test_log::test(tokio::test)]
async fn test_second_rejection_fails_the_batch_without_further_retries() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("HEAD /", Ok(token_response("tok-2")));
    for _ in 0..2 {
        mock.add_response(
            "POST /$batch",
            Ok(HttpResponse::new(403, "CSRF token validation failed")),
        );
    }

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(2), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 2);
    assert_eq!(mock.calls_to("POST /$batch").len(), 2);
    assert_eq!(mock.calls_to("HEAD /").len(), 2);
    for failed in &result.failed_records {
        assert_eq!(failed.http_status, Some(403));
        assert_eq!(failed.message, "CSRF token validation failed");
        assert_eq!(failed.code.as_deref(), Some("HTTP_403"));
    }
}

#[test_log::test(tokio::test)]
async fn test_json_error_document_fails_whole_batch() {
    let mock = MockHttpClient::new();
    mock.add_response(
        "POST /$batch",
        Ok(HttpResponse::new(
            400,
            r#"{"error":{"code":"/IWBEP/CM_MGW_RT/020","message":{"lang":"en","value":"An error occurred"},"innererror":{"errordetails":[{"code":"AA/501","message":"Company code 9999 does not exist","severity":"error"}]}}}"#,
        )
        .with_header("content-type", "application/json")),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(4), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.failure_count, 4);
    for failed in &result.failed_records {
        assert_eq!(failed.message, "Company code 9999 does not exist");
        assert_eq!(failed.code.as_deref(), Some("AA/501"));
        assert_eq!(failed.http_status, Some(400));
    }
}

#[test_log::test(tokio::test)]
async fn test_single_error_part_answers_whole_changeset() {
    let mock = MockHttpClient::new();
    mock.add_response(
        "POST /$batch",
        Ok(batch_response(&[(
            400,
            r#"{"error":{"code":"F5/702","message":"Balance in transaction currency"}}"#,
        )])),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.failure_count, 3);
    assert!(
        result
            .failed_records
            .iter()
            .all(|f| f.message == "Balance in transaction currency")
    );
}

#[test_log::test(tokio::test)]
async fn test_missing_parts_fail_the_unanswered_records() {
    let mock = MockHttpClient::new();
    mock.add_response("POST /$batch", Ok(all_created(2)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 2);
    assert_eq!(result.failure_count, 1);
    assert_eq!(result.failed_records[0].record.id, "3");
    assert_eq!(result.failed_records[0].code.as_deref(), Some("MALFORMED_RESPONSE"));
}

#[test_log::test(tokio::test)]
async fn test_progress_reported_in_order_after_each_batch() {
    let mock = MockHttpClient::new();
    for _ in 0..3 {
        mock.add_response("POST /$batch", Ok(all_created(2)));
    }

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_clone = progress.clone();

    let result = engine
        .submit(
            records(6),
            SubmitOptions::default()
                .batch_size(2)
                .on_progress(move |p| progress_clone.lock().push(*p)),
        )
        .await
        .unwrap();

    assert!(result.is_complete_success());
    let progress = progress.lock();
    assert_eq!(progress.len(), 3);
    for (i, p) in progress.iter().enumerate() {
        assert_eq!(p.batch_index, i);
        assert_eq!(p.total_batches, 3);
        assert_eq!(p.processed_records, (i + 1) * 2);
        assert_eq!(p.total_records, 6);
    }
    assert_eq!(progress[2].percent(), 100);
}

#[test_log::test(tokio::test)]
async fn test_cancel_during_progress_stops_at_next_boundary() {
    let mock = MockHttpClient::new();
    for _ in 0..3 {
        mock.add_response("POST /$batch", Ok(all_created(2)));
    }

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let handle = engine.cancel_handle();

    let result = engine
        .submit(
            records(6),
            SubmitOptions::default().batch_size(2).on_progress(move |p| {
                if p.batch_index == 0 {
                    handle.cancel();
                }
            }),
        )
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(result.success_count, 2);
    assert_eq!(result.failure_count, 0);
    assert_eq!(result.total_records, 6);
    assert_eq!(mock.calls_to("POST /$batch").len(), 1);
    assert!(matches!(
        engine.status(),
        SubmissionStatus::Cancelled { at_batch: 1, .. }
    ));
}

#[test_log::test(tokio::test)]
async fn test_cancel_before_first_batch_dispatches_nothing() {
    let mock = MockHttpClient::new();
    let trigger = mock.add_response_with_trigger("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("POST /$batch", Ok(all_created(2)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let handle = engine.cancel_handle();

    let (result, _) = tokio::join!(engine.submit(records(2), SubmitOptions::default()), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let _ = trigger.send(());
    });
    let result = result.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.processed(), 0);
    assert!(mock.calls_to("POST /$batch").is_empty());
}

#[test_log::test(tokio::test)]
async fn test_cancel_is_scoped_to_one_submission() {
    let mock = MockHttpClient::new();
    mock.add_response("POST /$batch", Ok(all_created(1)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    // Cancelling while idle does not poison the next run
    engine.cancel();

    let result = engine
        .submit(records(1), SubmitOptions::default())
        .await
        .unwrap();
    assert!(!result.cancelled);
    assert_eq!(result.success_count, 1);
}

#[test_log::test(tokio::test)]
async fn test_group_by_key_batches() {
    let mock = MockHttpClient::new();
    mock.add_response("POST /$batch", Ok(all_created(2)));
    mock.add_response("POST /$batch", Ok(all_created(1)));

    let lines = vec![
        JsonRecord::new("1", json!({"DocumentNo": "A"})),
        JsonRecord::new("2", json!({"DocumentNo": "B"})),
        JsonRecord::new("3", json!({"DocumentNo": "A"})),
    ];

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes_clone = sizes.clone();

    let result = engine
        .submit(
            lines,
            SubmitOptions::default()
                .batch_size(1)
                .group_by(|r: &JsonRecord| r.body["DocumentNo"].as_str().unwrap_or_default().to_string())
                .on_batch_start(move |s| sizes_clone.lock().push(s.batch_size)),
        )
        .await
        .unwrap();

    assert_eq!(*sizes.lock(), vec![2, 1]);
    assert_eq!(result.success_count, 3);
    let ids: Vec<&str> = result.success_entries.iter().map(|e| e.record.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "3", "2"]);

    let first = &mock.calls_to("POST /$batch")[0];
    assert_eq!(first.body.matches("Content-ID:").count(), 2);
}

#[test_log::test(tokio::test)]
async fn test_individual_mode_posts_each_record() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response(
        "POST /A_FixedAsset",
        Ok(HttpResponse::new(201, r#"{"d":{"MasterFixedAsset":"1"}}"#)),
    );
    mock.add_response(
        "POST /A_FixedAsset",
        Ok(HttpResponse::new(
            400,
            r#"{"error":{"code":"AA/344","message":{"value":"Asset class missing"}}}"#,
        )),
    );
    mock.add_response(
        "POST /A_FixedAsset",
        Ok(HttpResponse::new(201, r#"{"d":{"MasterFixedAsset":"3"}}"#)),
    );

    let engine = coordinator(&mock, SubmissionMode::Individual);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count + result.failure_count, 3);
    assert_eq!(result.failure_count, 1);
    assert_eq!(result.failed_records[0].message, "Asset class missing");

    let posts = mock.calls_to("POST /A_FixedAsset");
    assert_eq!(posts.len(), 3);
    for call in &posts {
        assert_eq!(call.header("Content-Type"), Some("application/json"));
        assert_eq!(call.header("X-CSRF-Token"), Some("tok-1"));
        assert!(serde_json::from_str::<serde_json::Value>(&call.body).is_ok());
    }
}

#[test_log::test(tokio::test)]
async fn test_individual_mode_with_delay_runs_sequentially() {
    let mock = MockHttpClient::new();
    for i in 0..3 {
        mock.add_response(
            "POST /A_FixedAsset",
            Ok(HttpResponse::new(201, format!(r#"{{"n":{i}}}"#))),
        );
    }

    let config = EngineConfig {
        mode: SubmissionMode::Individual,
        inter_record_delay_ms: Some(30),
        ..EngineConfig::new(ROOT, "A_FixedAsset")
    };
    let engine = SubmissionCoordinator::new(Arc::new(mock.clone()), config).unwrap();

    let started = Instant::now();
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(result.success_count, 3);
    // Sequential dispatch keeps responses in record order
    let bodies: Vec<_> = result
        .success_entries
        .iter()
        .map(|e| e.raw_details.clone().unwrap())
        .collect();
    assert_eq!(bodies, vec![json!({"n":0}), json!({"n":1}), json!({"n":2})]);
}

#[test_log::test(tokio::test)]
async fn test_empty_input_is_rejected_without_network() {
    let mock = MockHttpClient::new();
    let engine = coordinator(&mock, SubmissionMode::Batch);

    let err = engine
        .submit(Vec::<JsonRecord>::new(), SubmitOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BroadsideError::NoRecords));
    assert!(err.is_setup_error());
    assert_eq!(mock.call_count(), 0);
    assert!(matches!(engine.status(), SubmissionStatus::Failed { .. }));
}

#[test_log::test(tokio::test)]
async fn test_zero_batch_size_is_rejected() {
    let mock = MockHttpClient::new();
    let engine = coordinator(&mock, SubmissionMode::Batch);

    let err = engine
        .submit(records(3), SubmitOptions::default().batch_size(0))
        .await
        .unwrap_err();

    assert!(matches!(err, BroadsideError::InvalidBatchSize(0)));
    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_submit_is_rejected() {
    let mock = MockHttpClient::new();
    let trigger = mock.add_response_with_trigger("POST /$batch", Ok(all_created(1)));

    let engine = coordinator(&mock, SubmissionMode::Batch);

    let (first, second) = tokio::join!(engine.submit(records(1), SubmitOptions::default()), async {
        // Wait until the first submission is blocked on its request
        while mock.in_flight_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = engine.submit(records(1), SubmitOptions::default()).await;
        let _ = trigger.send(());
        second
    });

    assert!(matches!(second, Err(BroadsideError::AlreadyRunning)));
    assert_eq!(first.unwrap().success_count, 1);

    // The flag is released once the first submission finishes
    mock.add_response("POST /$batch", Ok(all_created(1)));
    assert!(engine.submit(records(1), SubmitOptions::default()).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_token_survives_between_submissions() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("POST /$batch", Ok(all_created(1)));
    mock.add_response("POST /$batch", Ok(all_created(1)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    engine.submit(records(1), SubmitOptions::default()).await.unwrap();
    engine.submit(records(1), SubmitOptions::default()).await.unwrap();

    assert_eq!(mock.calls_to("HEAD /").len(), 1);
    let posts = mock.calls_to("POST /$batch");
    assert_eq!(posts[1].header("X-CSRF-Token"), Some("tok-1"));
}

#[test_log::test(tokio::test)]
async fn test_missing_token_does_not_block_submission() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(HttpResponse::new(404, "")));
    mock.add_response("POST /$batch", Ok(all_created(1)));

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(1), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(mock.calls_to("POST /$batch")[0].header("X-CSRF-Token"), None);
    assert_eq!(mock.calls_to("HEAD /").len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_extra_headers_sent_on_every_request() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("POST /$batch", Ok(all_created(1)));

    let mut config = EngineConfig::new(ROOT, "A_FixedAsset");
    config.extra_headers.insert("sap-client".to_string(), "100".to_string());
    let engine = SubmissionCoordinator::new(Arc::new(mock.clone()), config).unwrap();

    engine.submit(records(1), SubmitOptions::default()).await.unwrap();

    for call in mock.get_calls() {
        assert_eq!(call.header("sap-client"), Some("100"));
    }
    assert_eq!(mock.call_count(), 2);
}

#[test_log::test(tokio::test)]
async fn test_absent_token_is_probed_once_per_submission() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("Required")));
    // Would be picked up if the engine probed again
    mock.add_response("HEAD /", Ok(token_response("tok-late")));
    for _ in 0..5 {
        mock.add_response("POST /$batch", Ok(all_created(1)));
    }

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(5), SubmitOptions::default().batch_size(1))
        .await
        .unwrap();

    assert_eq!(result.success_count, 5);
    assert_eq!(mock.calls_to("HEAD /").len(), 1);
    let posts = mock.calls_to("POST /$batch");
    assert_eq!(posts.len(), 5);
    assert!(posts.iter().all(|c| c.header("X-CSRF-Token").is_none()));
}

#[test_log::test(tokio::test)]
async fn test_absent_token_individual_mode_probes_once() {
    let mock = MockHttpClient::new();
    for _ in 0..5 {
        mock.add_response("HEAD /", Ok(HttpResponse::new(200, "")));
    }
    for _ in 0..4 {
        mock.add_response("POST /A_FixedAsset", Ok(HttpResponse::new(201, "{}")));
    }

    let engine = coordinator(&mock, SubmissionMode::Individual);
    let result = engine
        .submit(records(4), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 4);
    assert_eq!(mock.calls_to("HEAD /").len(), 1);
    assert_eq!(mock.calls_to("POST /A_FixedAsset").len(), 4);

    // The next submission gets another chance at a token
    mock.add_response("POST /A_FixedAsset", Ok(HttpResponse::new(201, "{}")));
    engine.submit(records(1), SubmitOptions::default()).await.unwrap();
    assert_eq!(mock.calls_to("HEAD /").len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_parts_matched_by_content_id_despite_gap() {
    let mock = MockHttpClient::new();
    mock.add_response(
        "POST /$batch",
        Ok(batch_response_with_ids(&[
            ("1", 201, r#"{"id":"one"}"#),
            ("3", 201, r#"{"id":"three"}"#),
        ])),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 2);
    let answered: Vec<(&str, serde_json::Value)> = result
        .success_entries
        .iter()
        .map(|e| (e.record.id.as_str(), e.raw_details.clone().unwrap()))
        .collect();
    assert_eq!(
        answered,
        vec![("1", json!({"id":"one"})), ("3", json!({"id":"three"}))]
    );

    assert_eq!(result.failure_count, 1);
    assert_eq!(result.failed_records[0].record.id, "2");
    assert_eq!(result.failed_records[0].code.as_deref(), Some("MALFORMED_RESPONSE"));
}

#[test_log::test(tokio::test)]
async fn test_individual_mode_retries_only_the_rejected_record() {
    let mock = MockHttpClient::new();
    mock.add_response("HEAD /", Ok(token_response("tok-1")));
    mock.add_response("HEAD /", Ok(token_response("tok-2")));
    mock.add_response(
        "POST /A_FixedAsset",
        Ok(HttpResponse::new(403, "CSRF token validation failed")),
    );
    for _ in 0..3 {
        mock.add_response("POST /A_FixedAsset", Ok(HttpResponse::new(201, "{}")));
    }

    let engine = coordinator(&mock, SubmissionMode::Individual);
    let result = engine
        .submit(records(3), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(result.success_count, 3);
    assert_eq!(result.failure_count, 0);
    assert_eq!(mock.calls_to("HEAD /").len(), 2);

    let posts = mock.calls_to("POST /A_FixedAsset");
    assert_eq!(posts.len(), 4);

    // Exactly one record body went out twice; its siblings once each
    let mut sends: Vec<(String, usize)> = Vec::new();
    for call in &posts {
        match sends.iter_mut().find(|(body, _)| *body == call.body) {
            Some((_, count)) => *count += 1,
            None => sends.push((call.body.clone(), 1)),
        }
    }
    assert_eq!(sends.len(), 3);
    let retried: Vec<&String> = sends.iter().filter(|(_, n)| *n == 2).map(|(b, _)| b).collect();
    assert_eq!(retried.len(), 1);
    assert!(sends.iter().all(|(_, n)| *n <= 2));

    let resend = posts.iter().rev().find(|c| &c.body == retried[0]).unwrap();
    assert_eq!(resend.header("X-CSRF-Token"), Some("tok-2"));
}

#[test_log::test(tokio::test)]
async fn test_snapshot_after_each_batch() {
    let mock = MockHttpClient::new();
    mock.add_response("POST /$batch", Ok(all_created(2)));
    mock.add_response(
        "POST /$batch",
        Err(BroadsideError::Other(anyhow::anyhow!("connection reset"))),
    );

    let engine = coordinator(&mock, SubmissionMode::Batch);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    engine
        .submit(
            records(4),
            SubmitOptions::default().batch_size(2).on_snapshot(move |partial| {
                seen_clone.lock().push((
                    partial.success_count,
                    partial.failure_count,
                    partial.all_messages.len(),
                ))
            }),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec![(2, 0, 2), (2, 2, 4)]);
}
