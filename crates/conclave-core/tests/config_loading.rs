use conclave_core::config::{ConversationMode, TeamConfig, WindowConfig};

#[test]
fn full_team_config_from_toml() {
    let toml_content = r#"
mission = "Ship the quarterly report"
mode = "dynamic"

[[agents]]
id = "researcher"
name = "Researcher"
role = "finds sources"
model = "claude-sonnet-4-20250514"

[[agents]]
id = "writer"
name = "Writer"
role = "drafts prose"
model = "gpt-4o"
allowed_tools = ["read", "write"]
allowed_paths = ["/workspace/report"]

[orchestrator]
id = "lead"
max_rounds = 3
model = "claude-sonnet-4-20250514"

[budget]
agent_token_limit = 50000
session_token_limit = 200000
rate_limit_per_minute = 10

[window]
strategy = "token_budget"
max_tokens = 8000

[compaction]
enabled = true
model = "claude-haiku-3"

[engine]
event_buffer = 64
default_agent = "researcher"

[breaker]
failure_threshold = 5
base_backoff_ms = 500
max_backoff_ms = 30000
"#;

    let config: TeamConfig = toml::from_str(toml_content).expect("parse team config");
    config.validate().expect("valid config");

    assert_eq!(config.mode, ConversationMode::Dynamic);
    assert_eq!(config.agents.len(), 2);
    assert!(config.agents[0].is_chat_only());
    assert!(!config.agents[1].is_chat_only());
    assert_eq!(config.orchestrator.as_ref().unwrap().max_rounds, 3);
    assert_eq!(config.budget.rate_limit_per_minute, 10);
    assert!(matches!(
        config.window,
        WindowConfig::TokenBudget { max_tokens: 8000 }
    ));
    assert_eq!(config.breaker.failure_threshold, 5);
    assert_eq!(config.engine.default_agent.as_deref(), Some("researcher"));
}

#[test]
fn minimal_config_gets_defaults() {
    let toml_content = r#"
[[agents]]
id = "solo"
name = "Solo"
model = "gpt-4o-mini"
"#;

    let config: TeamConfig = toml::from_str(toml_content).expect("parse minimal config");
    config.validate().expect("valid config");

    assert_eq!(config.mode, ConversationMode::Sequential);
    assert!(config.orchestrator.is_none());
    assert!(!config.compaction.enabled);
    assert_eq!(config.breaker.failure_threshold, 3);
    assert_eq!(config.engine.event_buffer, 256);
}
