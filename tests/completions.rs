//! End-to-end tests of `POST /share/v1/chat/completions`.
//!
//! Requests go through the full router with in-memory stores and a scripted
//! chat engine; every test also checks the audit row the call left behind.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::*;
use wiki_gateway::models::chat::{AppType, ChatEvent};

// ── Success paths ────────────────────────────────────────────

mod success_tests {
    use super::*;

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let h = Harness::new(ab_script()).await;

        let (status, _, body) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::OK);

        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "wiki-model");
        assert!(v["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(v["choices"][0]["message"]["role"], "assistant");
        assert_eq!(v["choices"][0]["message"]["content"], "AB");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["usage"]["prompt_tokens"], 5);
        assert_eq!(v["usage"]["completion_tokens"], 3);
        assert_eq!(v["usage"]["total_tokens"], 8);

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status_code, 200);
        assert_eq!(audits[0].error_type, "");
        assert_eq!(audits[0].total_tokens, 8);
        assert_eq!(audits[0].model, "wiki-model");
        assert_eq!(audits[0].kb_id, KB);
        assert!(audits[0].api_token_id.is_none());
    }

    #[tokio::test]
    async fn test_streaming_completion_chunks() {
        let h = Harness::new(ab_script()).await;
        let mut body = simple_body(true);
        body["stream_options"] = json!({"include_usage": true});

        let (status, headers, text) = h.send(completion_request(Some(APP_SECRET), body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(headers["cache-control"], "no-cache");
        assert!(text.ends_with("data: [DONE]\n\n"));

        let chunks = sse_chunks(&text);
        assert_eq!(chunks.len(), 4, "two deltas, stop, usage: {text}");
        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "A");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "B");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[3]["usage"]["total_tokens"], 8);

        // one id and one created timestamp for the whole completion
        for c in &chunks[1..] {
            assert_eq!(c["id"], chunks[0]["id"]);
            assert_eq!(c["created"], chunks[0]["created"]);
        }

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status_code, 200);
        assert_eq!(audits[0].total_tokens, 8);
    }

    #[tokio::test]
    async fn test_streaming_without_include_usage_has_no_usage_chunk() {
        let h = Harness::new(ab_script()).await;

        let (_, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(true))).await;
        let chunks = sse_chunks(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.get("usage").map_or(true, |u| u.is_null())));

        // usage still reaches the audit row
        assert_eq!(h.store.audits().await[0].total_tokens, 8);
    }

    #[tokio::test]
    async fn test_flattened_prompt_reaches_chat_engine() {
        let h = Harness::new(ab_script()).await;
        let body = json!({
            "model": "wiki-model",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is"},
                    {"type": "image_url", "image_url": {"url": "http://x/y.png"}},
                    {"type": "text", "text": "the wiki?"}
                ]}
            ]
        });

        let (status, _, _) = h.send(completion_request(Some(APP_SECRET), body)).await;
        assert_eq!(status, StatusCode::OK);

        let requests = h.engine.requests();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent.kb_id, KB);
        assert_eq!(sent.app_type, AppType::OpenaiApi);
        assert!(sent.message.contains("be brief"));
        assert!(sent.message.contains("hello"));
        assert!(sent.message.ends_with("what is\nthe wiki?"));
    }

    #[tokio::test]
    async fn test_non_streaming_without_engine_usage_omits_usage() {
        let h = Harness::new(vec![ChatEvent::Data("A".into()), ChatEvent::Done]).await;

        let (status, _, body) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["choices"][0]["message"]["content"], "A");
        assert!(v.get("usage").is_none(), "{body}");
        assert_eq!(h.store.audits().await[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn test_null_stream_and_options_answer_buffered() {
        let h = Harness::new(ab_script()).await;
        let body = json!({
            "model": "wiki-model",
            "messages": [{"role": "user", "content": "q"}],
            "stream": null,
            "stream_options": null,
        });

        let (status, headers, text) = h.send(completion_request(Some(APP_SECRET), body)).await;
        assert_eq!(status, StatusCode::OK, "{text}");
        assert!(headers["content-type"].to_str().unwrap().starts_with("application/json"));
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["choices"][0]["message"]["content"], "AB");
        assert_eq!(h.store.audits().await[0].status_code, 200);
    }

    #[tokio::test]
    async fn test_forwarded_ip_and_request_id_audited() {
        let h = Harness::new(ab_script()).await;
        let mut req = completion_request(Some(APP_SECRET), simple_body(false));
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        req.headers_mut().insert("x-request-id", "req-42".parse().unwrap());

        let (status, headers, _) = h.send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-request-id"], "req-42");

        let audits = h.store.audits().await;
        assert_eq!(audits[0].remote_ip, "203.0.113.7");
        assert_eq!(audits[0].request_id.as_deref(), Some("req-42"));
        assert_eq!(h.engine.requests()[0].remote_ip, "203.0.113.7");
    }
}

// ── Request validation ───────────────────────────────────────

mod validation_tests {
    use super::*;

    async fn expect_invalid(body: serde_json::Value, message: &str) {
        let h = Harness::new(ab_script()).await;
        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&text), ("invalid_request_error".into(), message.into()));

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status_code, 400);
        assert_eq!(audits[0].error_type, "invalid_request_error");
        assert_eq!(audits[0].error_message, message);
        assert!(h.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_messages() {
        expect_invalid(json!({"model": "m", "messages": []}), "messages cannot be empty").await;
    }

    #[tokio::test]
    async fn test_null_messages() {
        expect_invalid(json!({"model": "m", "messages": null}), "messages cannot be empty").await;
    }

    #[tokio::test]
    async fn test_null_model() {
        expect_invalid(
            json!({"model": null, "messages": [{"role": "user", "content": "q"}]}),
            "validate request failed",
        )
        .await;
    }

    #[tokio::test]
    async fn test_missing_model() {
        expect_invalid(
            json!({"model": " ", "messages": [{"role": "user", "content": "q"}]}),
            "validate request failed",
        )
        .await;
    }

    #[tokio::test]
    async fn test_no_user_message() {
        expect_invalid(
            json!({"model": "m", "messages": [{"role": "system", "content": "only rules"}]}),
            "no user message found",
        )
        .await;
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let h = Harness::new(ab_script()).await;
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/share/v1/chat/completions")
            .header("x-kb-id", KB)
            .header("authorization", format!("Bearer {}", APP_SECRET))
            .body(axum::body::Body::from("{not json"))
            .unwrap();

        let (status, _, text) = h.send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&text).1, "parse request failed");
        assert_eq!(h.store.audits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_kb_header() {
        let h = Harness::new(ab_script()).await;
        let mut req = completion_request(Some(APP_SECRET), simple_body(false));
        req.headers_mut().remove("x-kb-id");

        let (status, _, text) = h.send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&text).1, "X-KB-ID header is required");
        assert_eq!(h.store.audits().await[0].kb_id, "");
    }
}

// ── Authorization ────────────────────────────────────────────

mod auth_tests {
    use super::*;
    use wiki_gateway::models::app::AppSettings;
    use wiki_gateway::models::token::Permission;
    use wiki_gateway::store::AppSettingsRepo;

    #[tokio::test]
    async fn test_missing_authorization() {
        let h = Harness::new(ab_script()).await;
        let (status, _, text) = h.send(completion_request(None, simple_body(false))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&text).1, "Authorization header is required");
    }

    #[tokio::test]
    async fn test_malformed_authorization() {
        let h = Harness::new(ab_script()).await;
        for value in ["Basic abc", "Bearer   "] {
            let mut req = completion_request(None, simple_body(false));
            req.headers_mut().insert("authorization", value.parse().unwrap());
            let (status, _, text) = h.send(req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{value}");
            assert_eq!(error_of(&text).1, "Invalid Authorization key format");
        }
    }

    #[tokio::test]
    async fn test_unknown_secret() {
        let h = Harness::new(ab_script()).await;
        let (status, _, text) = h
            .send(completion_request(Some("not-a-real-secret"), simple_body(false)))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(&text), ("unauthorized".into(), "Invalid Authorization key".into()));

        let audits = h.store.audits().await;
        assert_eq!(audits[0].status_code, 401);
        assert!(audits[0].api_token_id.is_none());
    }

    #[tokio::test]
    async fn test_app_disabled() {
        let h = Harness::new(ab_script()).await;
        h.store
            .put_app_settings(KB, &AppSettings::openai_api(false, APP_SECRET))
            .await
            .unwrap();

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_of(&text), ("forbidden".into(), "API Bot is not enabled".into()));
    }

    #[tokio::test]
    async fn test_app_never_configured_is_disabled() {
        let h = Harness::new(ab_script()).await;
        let mut req = completion_request(Some(APP_SECRET), simple_body(false));
        req.headers_mut().insert("x-kb-id", "kb-unknown".parse().unwrap());

        let (status, _, _) = h.send(req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_api_token_authorizes() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(0, 0).await;

        let (status, _, _) = h.send(completion_request(Some(&token.token), simple_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            h.store.audits().await[0].api_token_id.as_deref(),
            Some(token.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_token_bound_to_other_kb_rejected() {
        let h = Harness::new(ab_script()).await;
        let token = h
            .create_token_with("kb-other", Permission::DataOperate, 0, 0)
            .await;

        let (status, _, _) = h.send(completion_request(Some(&token.token), simple_body(false))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(h.store.audits().await[0].api_token_id.is_none());
    }

    #[tokio::test]
    async fn test_token_lookup_served_from_cache() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(0, 0).await;

        for _ in 0..3 {
            let (status, _, _) = h
                .send(completion_request(Some(&token.token), simple_body(false)))
                .await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(h.store.secret_lookups(), 1);
    }
}

// ── Governance ───────────────────────────────────────────────

mod governance_tests {
    use super::*;
    use chrono::{Duration, Utc};
    use wiki_gateway::models::audit::NewApiCallAudit;

    #[tokio::test]
    async fn test_rate_limit_exceeded() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(2, 0).await;

        for _ in 0..2 {
            let (status, _, _) = h
                .send(completion_request(Some(&token.token), simple_body(false)))
                .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _, text) = h
            .send(completion_request(Some(&token.token), simple_body(false)))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            error_of(&text),
            (
                "rate_limit_error".into(),
                "Rate limit exceeded for this API token".into()
            )
        );

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 3);
        assert_eq!(audits[2].status_code, 429);
        assert_eq!(audits[2].api_token_id.as_deref(), Some(token.id.as_str()));
        assert_eq!(h.engine.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_daily_quota_exceeded() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(0, 3).await;

        // earlier today, outside the one-minute window
        let earlier = Utc::now() - Duration::seconds(90);
        let today = wiki_gateway::middleware::governance::start_of_local_day(Utc::now());
        let at = if earlier >= today { earlier } else { today };
        for _ in 0..3 {
            h.store
                .backfill_audit(
                    NewApiCallAudit {
                        kb_id: KB.into(),
                        api_token_id: Some(token.id.clone()),
                        endpoint: "/share/v1/chat/completions".into(),
                        model: "wiki-model".into(),
                        status_code: 200,
                        ..Default::default()
                    },
                    at,
                )
                .await;
        }

        let (status, _, text) = h
            .send(completion_request(Some(&token.token), simple_body(false)))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            error_of(&text),
            (
                "insufficient_quota".into(),
                "Daily quota exceeded for this API token".into()
            )
        );
    }

    #[tokio::test]
    async fn test_yesterdays_calls_do_not_count() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(0, 1).await;

        let yesterday =
            wiki_gateway::middleware::governance::start_of_local_day(Utc::now()) - Duration::hours(1);
        h.store
            .backfill_audit(
                NewApiCallAudit {
                    kb_id: KB.into(),
                    api_token_id: Some(token.id.clone()),
                    endpoint: "/share/v1/chat/completions".into(),
                    status_code: 200,
                    ..Default::default()
                },
                yesterday,
            )
            .await;

        let (status, _, _) = h
            .send(completion_request(Some(&token.token), simple_body(false)))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_count_failure_fails_open() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(1, 1).await;
        h.store.fail_counts(true);

        for _ in 0..3 {
            let (status, _, _) = h
                .send(completion_request(Some(&token.token), simple_body(false)))
                .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_app_secret_skips_governance() {
        let h = Harness::new(ab_script()).await;
        let token = h.create_token(1, 0).await;
        let (status, _, _) = h
            .send(completion_request(Some(&token.token), simple_body(false)))
            .await;
        assert_eq!(status, StatusCode::OK);

        // the token is exhausted, the app secret is not governed
        for _ in 0..3 {
            let (status, _, _) = h
                .send(completion_request(Some(APP_SECRET), simple_body(false)))
                .await;
            assert_eq!(status, StatusCode::OK);
        }
    }
}

// ── Chat engine failures ─────────────────────────────────────

mod engine_failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_unavailable() {
        let h = Harness::with_engine(ScriptedChatEngine::failing()).await;

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(true))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_of(&text), ("internal_error".into(), "chat engine unavailable".into()));

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].error_type, "internal_error");
    }

    #[tokio::test]
    async fn test_error_event_before_content_is_json_error() {
        let h = Harness::new(vec![ChatEvent::Error("retrieval failed".into())]).await;

        let (status, headers, text) =
            h.send(completion_request(Some(APP_SECRET), simple_body(true))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(headers["content-type"].to_str().unwrap().starts_with("application/json"));
        assert_eq!(error_of(&text).1, "retrieval failed");
    }

    #[tokio::test]
    async fn test_error_event_mid_stream_closes_body() {
        let h = Harness::new(vec![
            ChatEvent::Data("partial".into()),
            ChatEvent::Error("engine crashed".into()),
        ])
        .await;

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(true))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sse_chunks(&text).len(), 1);
        assert!(!text.contains("[DONE]"));

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status_code, 500);
        assert_eq!(audits[0].error_message, "engine crashed");
    }

    #[tokio::test]
    async fn test_stream_without_done() {
        let h = Harness::new(vec![ChatEvent::Data("A".into())]).await;

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(true))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!text.contains("[DONE]"));

        let audits = h.store.audits().await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].error_message, "stream ended without done event");
    }

    #[tokio::test]
    async fn test_buffered_without_done_is_bare_500() {
        let h = Harness::new(vec![ChatEvent::Data("A".into())]).await;

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.is_empty());
        assert_eq!(h.store.audits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_buffered_error_event() {
        let h = Harness::new(vec![
            ChatEvent::Data("A".into()),
            ChatEvent::Error("boom".into()),
        ])
        .await;

        let (status, _, text) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_of(&text), ("internal_error".into(), "boom".into()));
    }

    #[tokio::test]
    async fn test_audit_write_failure_does_not_fail_call() {
        let h = Harness::new(ab_script()).await;
        h.store.fail_audit_writes(true);

        let (status, _, _) = h.send(completion_request(Some(APP_SECRET), simple_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.store.audits().await.is_empty());
    }
}
