//! End-to-end supervisor behaviour with scripted models and mock services.

mod common;

use agri_advisor::agents::SpecialistKind;
use agri_advisor::error::BackendError;
use agri_advisor::llm::{CompletionRequest, ScriptedBackend};
use agri_advisor::memory::MemoryStore;
use agri_advisor::orchestrator::{AgentOutcome, Diagnostic, Intent, Query, QueryState};
use agri_advisor::services::{InMemoryConversationLog, Services};
use common::{advisor_backend, classification, is_classifier, is_extraction, is_synthesis, Harness};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

const WHITEFLY_QUERY: &str = "My tomato has white flies, should I spray now?";

fn whitefly_backend() -> Arc<ScriptedBackend> {
    advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("crop_disease", Some("weather"), "tomato"));
        }
        if is_synthesis(prompt) {
            let treatment = prompt.contains("neem oil");
            let hold = prompt.contains("do not spray now");
            return Ok(if treatment && hold {
                "Treat the whitefly with neem oil 5 ml per litre and yellow sticky traps. \
                 Do not spray now: rain is expected in 6 hours. Spray once the leaves are dry."
            } else {
                "Incomplete advice."
            }
            .to_string());
        }
        if prompt.contains("Dr. Krishi") {
            return Ok(if prompt.contains("neem oil") {
                "Whitefly: spray neem oil 5 ml per litre and put up yellow sticky traps."
            } else {
                "Could not identify the pest."
            }
            .to_string());
        }
        if prompt.contains("weather advisor") {
            return Ok(if prompt.contains("do not spray now") {
                "Rain expected in 6 hours, do not spray now. Wait until after the rain."
            } else {
                "Weather is fine for spraying."
            }
            .to_string());
        }
        Ok("General advice for farmers.".to_string())
    })
}

fn weather_services(summary: &'static str) -> Services {
    Services::default().with_weather(Arc::new(common::FixedWeather { summary }))
}

#[tokio::test]
#[traced_test]
async fn whitefly_with_rain_forecast_combines_treatment_and_spray_warning() {
    let harness = Harness::new(common::test_settings(), whitefly_backend(), None);
    harness.seed_knowledge().await;
    let supervisor = harness.supervisor(weather_services("rain in 6 hours"));

    let answer = supervisor
        .process_query(Query::new(WHITEFLY_QUERY, "farmer-1").with_location("Nalgonda"))
        .await;

    assert_eq!(answer.intent.primary_intent.as_str(), "crop_disease");
    assert_eq!(answer.intent.secondary_intent.map(|i| i.as_str()), Some("weather"));
    assert!(answer.agent_responses.get("crop_doctor").is_some_and(AgentOutcome::is_success));
    assert!(answer.agent_responses.get("weather").is_some_and(AgentOutcome::is_success));

    let response = answer.response.to_lowercase();
    assert!(response.contains("neem oil"), "no treatment in: {response}");
    assert!(response.contains("do not spray now"), "no spray warning in: {response}");

    assert_eq!(answer.state, QueryState::Done);
    assert_eq!(
        answer.trace,
        vec![
            QueryState::Received,
            QueryState::Classified,
            QueryState::Routed,
            QueryState::MultiDispatch,
            QueryState::Synthesized,
            QueryState::Guarded,
            QueryState::Done,
        ]
    );
    assert!(answer.sources.contains("crop_diseases"));

    let Some(AgentOutcome::Success(weather)) = answer.agent_responses.get("weather") else {
        panic!("weather response missing");
    };
    assert_eq!(weather.metadata["spray"]["suitable"], json!(false));

    let health = supervisor.agent_health();
    assert_eq!(health[&SpecialistKind::CropDoctor].total_requests, 1);
    assert_eq!(health[&SpecialistKind::Soil].total_requests, 0);
}

#[tokio::test]
#[traced_test]
async fn unparsable_classification_still_answers_as_general() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok("confidence: 0.0, intent: ???".to_string());
        }
        Ok("Here is some general advice for your farm.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend.clone(), None);
    let supervisor = harness.supervisor(Services::default());

    let answer = supervisor.process_query(Query::new("hmm what now", "farmer-2")).await;

    assert_eq!(answer.response, "Here is some general advice for your farm.");
    assert_eq!(answer.intent.primary_intent, Intent::General);
    assert_eq!(answer.state, QueryState::Failed);
    assert_eq!(answer.trace.last(), Some(&QueryState::Failed));
    assert!(answer.trace.contains(&QueryState::Guarded));
    assert!(answer.agent_responses.is_empty());
    assert!(answer.diagnostics.contains(&Diagnostic::ClassificationFailure { attempts: 2 }));

    // Two classification attempts, then one direct answer.
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
#[traced_test]
async fn exhausted_classifier_returns_fallback_without_error() {
    let primary = Arc::new(ScriptedBackend::failing("primary", BackendError::Rejected("invalid key".into())));
    let secondary = Arc::new(ScriptedBackend::failing("secondary", BackendError::Rejected("invalid key".into())));
    let harness = Harness::new(common::test_settings(), primary, Some(secondary.clone()));
    let log = Arc::new(InMemoryConversationLog::new());
    let memory = Arc::new(MemoryStore::new(
        harness.gateway.clone(),
        harness.embedder.clone(),
        harness.settings.clone(),
    ));
    let supervisor = harness
        .supervisor(Services::default())
        .with_memory(memory.clone())
        .with_conversation_log(log.clone());

    let answer = supervisor.process_query(Query::new("When to sow cotton?", "farmer-3")).await;
    supervisor.flush_background().await;

    let fallback = harness.settings.read(|s| s.supervisor.fallback_response.clone());
    assert_eq!(answer.response, fallback);
    assert_eq!(answer.state, QueryState::Failed);
    assert_eq!(secondary.calls(), 1);
    assert!(matches!(answer.diagnostics[0], Diagnostic::ClassifierUnavailable { .. }));

    // The failed turn is logged but nothing is learned from it.
    assert_eq!(log.turns("farmer-3").len(), 1);
    assert!(memory.get_all("farmer-3").is_empty());
    assert!(memory.recent_turns("farmer-3").is_empty());
}

#[tokio::test]
#[traced_test]
async fn one_failing_specialist_does_not_fail_the_turn() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("crop_disease", Some("weather"), "tomato"));
        }
        if prompt.contains("weather advisor") {
            return Err(BackendError::Rejected("content filter".into()));
        }
        if is_synthesis(prompt) {
            return Ok(if prompt.contains("--- weather ---") {
                "Mixed advice."
            } else {
                "Use neem oil 5 ml per litre on the whitefly."
            }
            .to_string());
        }
        Ok("Whitefly: neem oil 5 ml per litre.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    harness.seed_knowledge().await;
    let supervisor = harness.supervisor(weather_services("clear sky"));

    let answer = supervisor
        .process_query(Query::new(WHITEFLY_QUERY, "farmer-4").with_location("Nalgonda"))
        .await;

    assert_eq!(answer.state, QueryState::Done);
    assert!(!answer.trace.contains(&QueryState::Failed));
    assert_eq!(answer.response, "Use neem oil 5 ml per litre on the whitefly.");
    assert!(answer.agent_responses["crop_doctor"].is_success());
    assert!(matches!(answer.agent_responses["weather"], AgentOutcome::Failed { .. }));
    assert!(answer
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::SpecialistFailure { agent: SpecialistKind::Weather, .. })));
    assert_eq!(supervisor.agent_health()[&SpecialistKind::Weather].error_count, 1);
}

#[tokio::test]
async fn all_specialists_failing_returns_fallback() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("market_price", Some("government_scheme"), "cotton"));
        }
        Err(BackendError::Rejected("nope".into()))
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let supervisor = harness.supervisor(Services::default());

    let answer = supervisor.process_query(Query::new("cotton price and subsidy?", "farmer-5")).await;

    assert_eq!(answer.state, QueryState::Failed);
    assert_eq!(answer.response, harness.settings.read(|s| s.supervisor.fallback_response.clone()));
    assert_eq!(answer.agent_responses.len(), 2);
    assert!(answer.diagnostics.contains(&Diagnostic::AllSpecialistsFailure));
}

#[tokio::test]
async fn slow_specialist_times_out_and_is_excluded() {
    let mut settings = common::test_settings();
    settings.supervisor.agent_timeout_ms = 100;
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("soil_health", Some("weather"), "paddy"));
        }
        Ok(if prompt.contains("soil says hello") { "Soil plan." } else { "Missing." }.to_string())
    });
    let harness = Harness::new(settings, backend, None);
    let supervisor = harness.supervisor(Services::default());
    supervisor.register_specialist(Arc::new(common::StubSpecialist {
        kind: SpecialistKind::Soil,
        delay: Duration::ZERO,
        fail: false,
    }));
    supervisor.register_specialist(Arc::new(common::StubSpecialist {
        kind: SpecialistKind::Weather,
        delay: Duration::from_secs(3),
        fail: false,
    }));

    let answer = supervisor.process_query(Query::new("fertilizer before rain?", "farmer-6")).await;

    assert_eq!(answer.state, QueryState::Done);
    assert_eq!(answer.response, "Soil plan.");
    match &answer.agent_responses["weather"] {
        AgentOutcome::Failed { error } => assert!(error.contains("timed out")),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
#[traced_test]
async fn panicking_specialist_is_recorded_as_failed() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("soil_health", Some("weather"), "paddy"));
        }
        Ok(if prompt.contains("soil says hello") { "Soil plan." } else { "Missing." }.to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let supervisor = harness.supervisor(Services::default());
    supervisor.register_specialist(Arc::new(common::StubSpecialist {
        kind: SpecialistKind::Soil,
        delay: Duration::ZERO,
        fail: false,
    }));
    supervisor.register_specialist(Arc::new(common::PanickingSpecialist { kind: SpecialistKind::Weather }));

    let answer = supervisor.process_query(Query::new("fertilizer before rain?", "farmer-13")).await;

    assert_eq!(answer.state, QueryState::Done);
    assert_eq!(answer.response, "Soil plan.");
    assert!(answer.agent_responses["soil"].is_success());
    match &answer.agent_responses["weather"] {
        AgentOutcome::Failed { error } => assert!(error.contains("sensor table corrupted"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(answer
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::SpecialistFailure { agent: SpecialistKind::Weather, .. })));
}

#[tokio::test]
async fn slow_memory_lookup_counts_against_the_query_timeout() {
    let mut settings = common::test_settings();
    settings.supervisor.query_timeout_ms = 150;
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("general", None, "paddy"));
        }
        Ok("answer".to_string())
    });
    let harness = Harness::new(settings, backend, None);
    let memory = Arc::new(MemoryStore::new(
        harness.gateway.clone(),
        Arc::new(common::SlowEmbedder { delay: Duration::from_millis(600) }),
        harness.settings.clone(),
    ));
    let supervisor = harness.supervisor(Services::default()).with_memory(memory);

    let started = std::time::Instant::now();
    let answer = supervisor.process_query(Query::new("paddy advice", "farmer-14")).await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(answer.state, QueryState::Failed);
    assert!(answer.diagnostics.contains(&Diagnostic::QueryTimeout { after_ms: 150 }));
}

#[tokio::test]
async fn query_timeout_cancels_dispatch_and_returns_fallback() {
    let mut settings = common::test_settings();
    settings.supervisor.query_timeout_ms = 150;
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("crop_disease", Some("market_price"), "chilli"));
        }
        Ok("answer".to_string())
    });
    let harness = Harness::new(settings, backend, None);
    let supervisor = harness.supervisor(Services::default());
    for kind in [SpecialistKind::CropDoctor, SpecialistKind::Market] {
        supervisor.register_specialist(Arc::new(common::StubSpecialist {
            kind,
            delay: Duration::from_secs(5),
            fail: false,
        }));
    }

    let started = std::time::Instant::now();
    let answer = supervisor.process_query(Query::new("chilli leaf curl and price", "farmer-7")).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(answer.state, QueryState::Failed);
    assert!(answer.agent_responses.is_empty());
    assert!(answer.diagnostics.contains(&Diagnostic::QueryTimeout { after_ms: 150 }));
    assert_eq!(answer.response, harness.settings.read(|s| s.supervisor.fallback_response.clone()));
}

#[tokio::test]
async fn synthesis_failure_falls_back_to_specialist_text() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("government_scheme", None, "paddy"));
        }
        if is_synthesis(prompt) {
            return Err(BackendError::Rejected("synthesis down".into()));
        }
        Ok("Apply for Rythu Bharosa at the Rythu Vedika.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let supervisor = harness.supervisor(Services::default());

    let answer = supervisor.process_query(Query::new("Which schemes can I get?", "farmer-8")).await;

    assert_eq!(answer.state, QueryState::Done);
    assert!(answer.trace.contains(&QueryState::SingleDispatch));
    assert_eq!(answer.response, "Apply for Rythu Bharosa at the Rythu Vedika.");
    assert!(answer
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::SynthesisFallback { .. })));
}

#[tokio::test]
async fn unsafe_answer_is_replaced_by_guardrail() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("crop_disease", None, "cotton"));
        }
        Ok("Spray monocrotophos 2 ml per litre.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let supervisor = harness.supervisor(Services::default());

    let answer = supervisor.process_query(Query::new("bollworm in cotton", "farmer-9")).await;

    assert_eq!(answer.state, QueryState::Done);
    assert!(answer.response.contains("Kisan Call Centre"));
    assert!(answer
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::GuardrailReplaced { .. })));
}

#[tokio::test]
async fn unavailable_weather_service_degrades_the_weather_answer() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("weather", None, "cotton"));
        }
        if prompt.contains("Note: the live forecast could not be fetched") {
            return Ok("Live forecast unavailable; check the IMD bulletin before spraying.".to_string());
        }
        Ok("Forecast-based advice.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let services = Services::default().with_weather(Arc::new(common::DownWeather));
    let supervisor = harness.supervisor(services);

    let answer = supervisor
        .process_query(Query::new("Will it rain this week?", "farmer-10").with_location("Adilabad"))
        .await;

    assert_eq!(answer.state, QueryState::Done);
    let Some(AgentOutcome::Success(weather)) = answer.agent_responses.get("weather") else {
        panic!("weather response missing");
    };
    assert!(weather.degraded.is_some());
    assert!(weather.text.starts_with("Live forecast unavailable"));
}

#[tokio::test]
async fn market_answer_carries_best_mandi() {
    let backend = advisor_backend(|prompt| {
        if is_classifier(prompt) {
            return Ok(classification("market_price", None, "cotton"));
        }
        Ok("Sell at Khammam.".to_string())
    });
    let harness = Harness::new(common::test_settings(), backend, None);
    let services = Services::default().with_market(Arc::new(common::FixedMarket));
    let supervisor = harness.supervisor(services);

    let answer = supervisor.process_query(Query::new("Where to sell cotton?", "farmer-11")).await;

    let Some(AgentOutcome::Success(market)) = answer.agent_responses.get("market") else {
        panic!("market response missing");
    };
    assert_eq!(market.metadata["best_mandi"]["market"], json!("Khammam"));
    assert!(market.degraded.is_none());
}

#[tokio::test]
#[traced_test]
async fn memory_is_updated_after_the_answer() {
    let backend = Arc::new(ScriptedBackend::new("scripted", |req: &CompletionRequest| {
        let prompt = &req.prompt;
        if is_extraction(prompt) {
            return Ok(json!([{"fact": "Grows rice in Nalgonda", "category": "crops", "importance": 8}]).to_string());
        }
        if is_classifier(prompt) {
            return Ok(classification("soil_health", None, "rice"));
        }
        Ok("Apply 35 kg urea per acre in three splits.".to_string())
    }));
    let harness = Harness::new(common::test_settings(), backend, None);
    let memory = Arc::new(MemoryStore::new(
        harness.gateway.clone(),
        harness.embedder.clone(),
        harness.settings.clone(),
    ));
    let log = Arc::new(InMemoryConversationLog::new());
    let supervisor = harness
        .supervisor(Services::default())
        .with_memory(memory.clone())
        .with_conversation_log(log.clone());

    let answer = supervisor
        .process_query(Query::new("I grow rice in Nalgonda, how much urea?", "farmer-12").with_session("sms-7"))
        .await;
    supervisor.flush_background().await;

    assert_eq!(answer.state, QueryState::Done);
    let records = memory.get_all("farmer-12");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "Grows rice in Nalgonda");
    assert_eq!(memory.recent_turns("farmer-12").len(), 2);

    let logged = log.turns("farmer-12");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].response, answer.response);
    assert_eq!(logged[0].session_id.as_deref(), Some("sms-7"));

    // The next turn sees the stored fact.
    let context = memory.get_memory_context("farmer-12", "urea for paddy", 12).await;
    assert!(context.contains("Grows rice in Nalgonda"));
}
