//! Multi-step flows: skill challenges, social encounters, fallbacks and aborts.
//!
//! Run with: `cargo test -p dnd-core --test saga_flow`

use agent_bus::prelude::{SagaId, StepRequest};
use dnd_core::content::DEGRADED_NOTICE;
use dnd_core::decisions::DecisionDetail;
use dnd_core::testing::{fast_config, FailingContent, ScriptedContent, SilentContent, TestHarness};
use dnd_core::workers::{GameIntent, RULES};
use dnd_core::{CommandIntent, ContentReply, CorrelationId};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const GATE_CHOICES: &str = r#"{
    "prompt": "The gate is barred.",
    "choices": [
        {"id": "climb", "label": "Climb the wall",
         "check": {"type": "skill", "value": "athletics"}, "difficulty": "easy"},
        {"id": "talk", "label": "Talk to the guard",
         "check": {"type": "skill", "value": "persuasion"}, "difficulty": "medium"}
    ]
}"#;

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_skill_challenge_runs_all_steps() {
    let scenario = Arc::new(ScriptedContent::texts([GATE_CHOICES]));
    let harness = TestHarness::with([11], |b| b.with_scenario_agent(scenario.clone())).unwrap();

    // Persuasion +4 (CHA +1, proficient +3), 11 + 4 = 15 vs medium 15
    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({ "selection": 2 }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.degraded.is_none());
    assert_eq!(result.data["saga_type"], "skill_challenge");
    assert_eq!(result.data["selected_choice"]["id"], "talk");
    assert_eq!(result.data["check"]["dc"], 15);
    assert_eq!(result.data["check"]["total"], 15);
    assert_eq!(result.data["check"]["success"], true);
    assert_eq!(result.data["consequence"]["flag"], "skill_challenge.talk");

    let flag = harness
        .conductor
        .engine()
        .scene_flag("skill_challenge.talk")
        .unwrap();
    assert_eq!(flag, Some(Value::Bool(true)));

    let chain = harness.conductor.decision_chain(result.correlation_id);
    assert_eq!(chain.len(), 1);
    match &chain[0].detail {
        DecisionDetail::SkillCheck(outcome) => {
            assert_eq!(outcome.total, result.data["check"]["total"].as_i64().map(|t| t as i32));
            assert!(outcome.success);
        }
        other => panic!("expected a skill check record, got {other:?}"),
    }

    let requests = scenario.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].query.contains("skill_challenge"));
}

#[tokio::test]
async fn test_social_encounter_uses_npc_agent() {
    let npc = Arc::new(ScriptedContent::texts([r#"Sure! {"prompt": "The merchant frowns.",
        "choices": [{"label": "Haggle", "skill": "persuasion"}]}"#]));
    let harness = TestHarness::with([3], |b| b.with_npc_agent(npc.clone())).unwrap();

    let result = harness
        .send(CommandIntent::SocialEncounter, "pc-1", json!({ "selection": "haggle" }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(npc.requests().len(), 1);
    assert_eq!(result.data["choice_set"]["prompt"], "The merchant frowns.");
    assert_eq!(result.data["selected_choice"]["id"], "choice_1");
    assert_eq!(result.data["check"]["success"], false);

    // The repaired reply is flagged, then the check is logged
    let kinds: Vec<&str> = harness
        .conductor
        .decision_chain(result.correlation_id)
        .iter()
        .map(|r| r.kind())
        .collect();
    assert_eq!(kinds, vec!["fallback", "skill_check"]);
}

// =============================================================================
// Content failures fall back
// =============================================================================

#[tokio::test]
async fn test_failing_scenario_agent_falls_back_after_retry() {
    let scenario = Arc::new(FailingContent::new());
    let harness = TestHarness::with([15], |b| b.with_scenario_agent(scenario.clone())).unwrap();

    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({}))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.degraded.as_deref(), Some(DEGRADED_NOTICE));
    assert_eq!(scenario.calls(), 2);

    // Canned choices, first one taken when nothing was selected
    assert_eq!(result.data["selected_choice"]["id"], "force");
    assert_eq!(result.data["selection_defaulted"], true);
    assert_eq!(result.data["check"]["success"], true);

    let chain = harness.conductor.decision_chain(result.correlation_id);
    assert_eq!(chain.len(), 2);
    assert!(matches!(
        &chain[0].detail,
        DecisionDetail::Fallback { step, repaired: false, .. } if step == "present_choice"
    ));
    assert_eq!(chain[1].kind(), "skill_check");
}

#[tokio::test]
async fn test_silent_scenario_agent_times_out_into_fallback() {
    let harness = TestHarness::with([15], |b| b.with_scenario_agent(Arc::new(SilentContent))).unwrap();

    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({ "selection": 3 }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.degraded.is_some());
    assert_eq!(result.data["selected_choice"]["id"], "sneak");
}

#[tokio::test]
async fn test_unrepairable_choice_set_falls_back_without_retry() {
    let scenario = Arc::new(ScriptedContent::texts(["I would rather tell you a story."]));
    let harness = TestHarness::with([15], |b| b.with_scenario_agent(scenario.clone())).unwrap();

    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({}))
        .await;

    assert!(result.success);
    assert!(result.degraded.is_some());
    assert_eq!(scenario.requests().len(), 1);
}

// =============================================================================
// Rules failures abort
// =============================================================================

#[tokio::test]
async fn test_unknown_actor_aborts_challenge() {
    let harness = TestHarness::new(Vec::<u32>::new()).unwrap();

    let result = harness
        .send(CommandIntent::SkillChallenge, "ghost", json!({}))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some("saga_aborted"));

    let chain = harness.conductor.decision_chain(result.correlation_id);
    let aborted: Vec<_> = chain.iter().filter(|r| r.kind() == "saga_aborted").collect();
    assert_eq!(aborted.len(), 1);
    match &aborted[0].detail {
        DecisionDetail::SagaAborted(failure) => {
            assert_eq!(failure.step_type.as_deref(), Some("resolve_check"));
            assert_eq!(failure.saga_type, "skill_challenge");
        }
        other => panic!("expected an abort record, got {other:?}"),
    }
    assert!(harness.conductor.orchestrator().active_sagas().is_empty());
}

// =============================================================================
// Repeated steps
// =============================================================================

#[tokio::test]
async fn test_repeated_check_step_rolls_once() {
    let harness = TestHarness::new([11, 2]).unwrap();
    let orchestrator = harness.conductor.orchestrator();
    let correlation_id = CorrelationId::new();

    let mut context = Map::new();
    context.insert(
        "check_request".to_string(),
        json!({ "actor_id": "pc-1", "check": { "type": "skill", "value": "stealth" }, "dc": 15 }),
    );
    let step = StepRequest {
        saga_id: SagaId::new(),
        step_index: 2,
        saga_type: "skill_challenge".to_string(),
        step_type: "resolve_check".to_string(),
        context,
    };
    let payload = serde_json::to_value(&step).unwrap();

    let first = orchestrator
        .request(RULES, GameIntent::ResolveCheck, payload.clone(), correlation_id)
        .await
        .unwrap();
    let again = orchestrator
        .request(RULES, GameIntent::ResolveCheck, payload, correlation_id)
        .await
        .unwrap();

    // 11 + 9; the 2 stays in the tray
    assert_eq!(first.payload["check"]["total"], 20);
    assert_eq!(again.payload, first.payload);
    assert_eq!(harness.dice.remaining(), 1);
    assert_eq!(harness.conductor.decision_chain(correlation_id).len(), 1);

    let next = StepRequest { step_index: 3, ..step };
    let reply = orchestrator
        .request(RULES, GameIntent::ResolveCheck, serde_json::to_value(&next).unwrap(), correlation_id)
        .await
        .unwrap();
    assert_eq!(reply.payload["check"]["total"], 11);
    assert_eq!(harness.conductor.decision_chain(correlation_id).len(), 2);
}

#[tokio::test]
async fn test_finished_saga_leaves_the_table() {
    let harness = TestHarness::new([11]).unwrap();
    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({ "selection": 1 }))
        .await;
    assert!(result.success, "{:?}", result.error);

    let saga_id: SagaId = serde_json::from_value(result.data["saga_id"].clone()).unwrap();
    assert!(harness.conductor.orchestrator().saga(saga_id).is_none());
    assert!(harness.conductor.orchestrator().active_sagas().is_empty());
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_stop_aborts_in_flight_saga() {
    let config = fast_config()
        .with_step_timeout(Duration::from_secs(5))
        .with_drain_timeout(Duration::from_millis(100));
    let harness = Arc::new(
        TestHarness::with([15], |b| b.with_config(config).with_scenario_agent(Arc::new(SilentContent))).unwrap(),
    );

    let in_flight = {
        let harness = harness.clone();
        tokio::spawn(async move {
            harness
                .send(CommandIntent::SkillChallenge, "pc-1", json!({}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = harness.conductor.stop(Duration::from_millis(100)).await;
    assert_eq!(report.aborted_sagas.len(), 1);

    let result = in_flight.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some("saga_aborted"));

    let aborted = harness
        .conductor
        .decision_chain(result.correlation_id)
        .iter()
        .filter(|r| r.kind() == "saga_aborted")
        .count();
    assert_eq!(aborted, 1);

    let late = harness
        .send(CommandIntent::SkillCheck, "pc-1", json!({ "check": { "type": "skill", "value": "stealth" } }))
        .await;
    assert_eq!(late.error_kind(), Some("shutting_down"));
}

#[tokio::test]
async fn test_scripted_reply_with_success_false_is_a_failure() {
    let scenario = Arc::new(ScriptedContent::new(vec![
        ContentReply::failure("overloaded"),
        ContentReply::text(GATE_CHOICES),
    ]));
    let harness = TestHarness::with([10], |b| b.with_scenario_agent(scenario.clone())).unwrap();

    // First reply fails, the retry succeeds
    let result = harness
        .send(CommandIntent::SkillChallenge, "pc-1", json!({ "selection": "climb" }))
        .await;

    assert!(result.success);
    assert!(result.degraded.is_none());
    assert_eq!(scenario.requests().len(), 2);
    assert_eq!(result.data["selected_choice"]["id"], "climb");
    // Athletics +0 vs easy 10
    assert_eq!(result.data["check"]["success"], true);
}
