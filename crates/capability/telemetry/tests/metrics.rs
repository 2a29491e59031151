use gw_telemetry::{metrics, new_connection_id, record_queue_dropped, record_topo_reject};

#[test]
fn connection_ids_are_unique() {
    let first = new_connection_id();
    let second = new_connection_id();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[test]
fn counters_accumulate() {
    let before = metrics().snapshot();
    record_queue_dropped();
    record_queue_dropped();
    record_topo_reject();
    let after = metrics().snapshot();
    assert!(after.queue_dropped >= before.queue_dropped + 2);
    assert!(after.topo_rejects > before.topo_rejects);
}
