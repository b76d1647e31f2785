//! End-to-end stress runs

use resv_common::config::{ConfigLoader, ResvConfig};
use resv_stress::{InsertOrder, RunConfig, StressConfig, StressError, run_stress};
use std::path::Path;

fn small(order: InsertOrder) -> StressConfig {
    StressConfig {
        run: RunConfig {
            fences: 700,
            order,
            readers: 3,
            rounds: 3,
            seed: 11,
            validate_every: 100,
            ..RunConfig::default()
        },
        ..StressConfig::default()
    }
}

#[test]
fn test_every_order_runs_clean() -> Result<(), StressError> {
    for order in [InsertOrder::Forward, InsertOrder::Backward, InsertOrder::Random] {
        let report = run_stress(&small(order))?;
        assert!(report.is_clean(), "{order}: {report:?}");
        assert_eq!(report.rounds, 3);
        assert_eq!(report.inserts, 3 * 700);
        assert_eq!(report.oom_failures, 0);
        // 7 periodic checks plus one at the end of each round.
        assert_eq!(report.validations, 3 * 8);
    }
    Ok(())
}

#[test]
fn test_layer_limit_stops_rounds_early() -> Result<(), StressError> {
    let mut config = small(InsertOrder::Forward);
    config.run.readers = 0;
    config.reservation = ResvConfig {
        layer_limit: Some(1),
        ..ResvConfig::default()
    };

    let report = run_stress(&config)?;
    assert_eq!(report.rounds, 3);
    assert_eq!(report.inserts, 3 * 16);
    assert_eq!(report.oom_failures, 3);
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = small(InsertOrder::Random);
    config.run.rounds = 0;
    assert!(matches!(run_stress(&config), Err(StressError::Config(_))));
}

#[test]
fn test_shipped_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/stress.toml");
    let config = StressConfig::load(&path).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.run.order, InsertOrder::Random);

    // The file round-trips through the serializer without losing sections.
    let text = toml::to_string(&config).unwrap();
    let reparsed: StressConfig = toml::from_str(&text).unwrap();
    assert_eq!(reparsed.run.fences, config.run.fences);
    assert_eq!(reparsed.reservation, config.reservation);
}
