use std::path::PathBuf;

use torque_core::config::AppConfig;
use torque_core::plan::{FailurePolicy, RiskLevel, WorkflowPlan};
use torque_engine::DependencyGraph;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

#[test]
fn test_demo_plan_loads_and_forms_two_waves() {
    let plan = WorkflowPlan::load(&demo("add_part_and_payment_link.json")).expect("load plan");
    assert_eq!(plan.risk_level, RiskLevel::Medium);
    assert_eq!(plan.steps.len(), 4);
    assert_eq!(
        plan.step("validate_part").map(|s| s.failure_policy),
        Some(FailurePolicy::Abort)
    );

    let graph = DependencyGraph::build(&plan).expect("acyclic");
    let levels = graph.levels();
    assert_eq!(levels.len(), 2);
    assert!(levels[0].contains(&"validate_ro".to_string()));
    assert!(levels[0].contains(&"validate_part".to_string()));
    assert!(levels[1].contains(&"reserve_part".to_string()));
    assert!(levels[1].contains(&"create_payment".to_string()));
    assert_eq!(graph.parallel_groups()["validate"].len(), 2);
}

#[test]
fn test_example_config_loads() {
    std::env::set_var("REPAIR_ORDERS_URL", "http://localhost:3001");
    let config = AppConfig::load(&demo("torque.toml")).expect("load config");
    assert_eq!(config.agents.len(), 3);
    assert_eq!(config.agents["repair_orders"].address, "http://localhost:3001");
}
