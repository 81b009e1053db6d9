use super::*;

fn create_test_registry() -> Registry {
    let registry = Registry::new_custom(Some("test".to_string()), None).unwrap();
    register_custom_metrics(&registry);
    registry
}

#[test]
fn test_custom_registry() {
    let registry = create_test_registry();

    CACHE_EVENTS.with_label_values(&["1", "hit"]).inc();
    let metrics = registry.gather();
    assert!(!metrics.is_empty());

    let metric_names: Vec<_> = metrics.iter().map(|m| m.get_name()).collect();
    assert!(
        metric_names.contains(&"test_grid_cache_events"),
        "Missing test_grid_cache_events"
    );
}

#[test]
fn test_counter_increment() {
    MESSAGES_SENT.with_label_values(&["42", "GET"]).reset();

    MESSAGES_SENT.with_label_values(&["42", "GET"]).inc();
    MESSAGES_SENT.with_label_values(&["42", "GET"]).inc();

    let value = MESSAGES_SENT.with_label_values(&["42", "GET"]).get();
    assert_eq!(value, 2, "Counter should increment correctly");
}

#[test]
fn test_histogram_labels() {
    EXCHANGE_LATENCY_MS.with_label_values(&["43", "get"]).observe(1.0);
    EXCHANGE_LATENCY_MS.with_label_values(&["43", "getx"]).observe(2.0);
    EXCHANGE_LATENCY_MS.with_label_values(&["43", "getx"]).observe(3.0);

    assert_eq!(EXCHANGE_LATENCY_MS.with_label_values(&["43", "get"]).get_sample_count(), 1);
    assert_eq!(EXCHANGE_LATENCY_MS.with_label_values(&["43", "getx"]).get_sample_count(), 2);
}

#[test]
fn test_gather_text_renders_registered_metrics() {
    let registry = create_test_registry();
    LINES_CACHED.with_label_values(&["44"]).set(3);

    let text = gather_text(&registry);
    assert!(text.contains("test_grid_lines_cached"));
}
