use serde_json::Value;
use tempfile::TempDir;

use tollgate_cli::commands::{ask, broker, migrate, wallet};
use tollgate_core::config::AppConfig;

fn config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("cli.db").display());
    config
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be JSON")
}

#[test]
fn migrate_returns_success_on_fresh_database() {
    let dir = TempDir::new().expect("tempdir");
    let result = migrate::run(&config(&dir));
    assert_eq!(result.exit_code, 0, "expected successful migrate run");

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "migrate");
    assert_eq!(payload["status"], "ok");
}

#[test]
fn migrate_reports_connectivity_failure() {
    let mut config = AppConfig::default();
    config.database.url = "sqlite:///nonexistent-dir/for/sure/cli.db".to_string();

    let result = migrate::run(&config);
    assert_eq!(result.exit_code, 4);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error_class"], "db_connectivity");
}

#[test]
fn recharge_then_balance_verify_and_history() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir);

    let recharged = wallet::recharge(&config, "acme", "25.00", "pay_123", "usd");
    assert_eq!(recharged.exit_code, 0, "{}", recharged.output);
    let payload = parse_payload(&recharged.output);
    assert_eq!(payload["data"]["kind"], "recharge_credit");

    let balance = wallet::balance(&config, "acme");
    assert_eq!(balance.exit_code, 0, "{}", balance.output);
    let payload = parse_payload(&balance.output);
    assert_eq!(payload["data"]["tenant_id"], "acme");
    assert_eq!(payload["data"]["currency"], "USD");

    let verified = wallet::verify(&config, "acme");
    assert_eq!(verified.exit_code, 0, "{}", verified.output);
    let payload = parse_payload(&verified.output);
    assert_eq!(payload["data"]["valid"], true);
    assert_eq!(payload["data"]["verified_transactions"], 1);

    let history = wallet::history(&config, "acme", 10);
    assert_eq!(history.exit_code, 0, "{}", history.output);
    let payload = parse_payload(&history.output);
    assert_eq!(payload["data"]["entries"].as_array().map(Vec::len), Some(1));
    assert_eq!(payload["data"]["open_reconciliations"].as_array().map(Vec::len), Some(0));
}

#[test]
fn repeated_recharge_reference_does_not_credit_twice() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir);

    let first = parse_payload(&wallet::recharge(&config, "acme", "100", "pay_1", "USD").output);
    let replay = wallet::recharge(&config, "acme", "100", "pay_1", "USD");
    assert_eq!(replay.exit_code, 0, "{}", replay.output);
    assert_eq!(parse_payload(&replay.output)["data"]["id"], first["data"]["id"]);

    let foreign = wallet::recharge(&config, "acme", "100", "pay_2", "EUR");
    assert_ne!(foreign.exit_code, 0);
    assert_eq!(parse_payload(&foreign.output)["error_class"], "domain");

    let balance = parse_payload(&wallet::balance(&config, "acme").output);
    assert_eq!(balance["data"]["balance"], "100");
}

#[test]
fn recharge_rejects_non_positive_amount() {
    let dir = TempDir::new().expect("tempdir");
    let result = wallet::recharge(&config(&dir), "acme", "-5", "pay_1", "USD");

    assert_eq!(result.exit_code, 2);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "invalid_input");
}

#[test]
fn ask_with_empty_wallet_fails_before_any_provider_call() {
    let dir = TempDir::new().expect("tempdir");
    let result = ask::run(&config(&dir), "broke-tenant", "Summarize our refund policy", None);

    assert_ne!(result.exit_code, 0);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "ask");
    assert_eq!(payload["error_class"], "domain");
}

#[test]
fn stats_and_purge_work_on_an_empty_cache() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir);

    let stats = broker::cache_stats(&config, None);
    assert_eq!(stats.exit_code, 0, "{}", stats.output);
    assert_eq!(parse_payload(&stats.output)["data"]["live_entries"], 0);

    let purged = broker::cache_purge(&config, Some("acme"), false);
    assert_eq!(purged.exit_code, 0, "{}", purged.output);
    assert_eq!(parse_payload(&purged.output)["data"]["deleted"], 0);

    let broker_stats = broker::stats(&config, Some("acme"));
    assert_eq!(broker_stats.exit_code, 0, "{}", broker_stats.output);
    assert_eq!(parse_payload(&broker_stats.output)["data"]["total_requests"], 0);
}
