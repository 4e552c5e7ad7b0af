use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use zparam::connection::{Connection, Message, return_code};
use zparam::loopback::LoopbackConnection;
use zparam::ParameterRegistry;

fn registry() -> (Arc<LoopbackConnection>, ParameterRegistry) {
    let conn = Arc::new(LoopbackConnection::connected());
    let registry = ParameterRegistry::new(conn.clone(), "batt", "batt/control/");
    (conn, registry)
}

#[test]
fn test_message_updates_only_matching_parameter() {
    let (conn, registry) = registry();
    let params: Vec<_> = (0..5)
        .map(|i| registry.declare_int(&format!("P{}", i), 0).unwrap())
        .collect();

    assert!(conn.deliver("batt/p3", "33"));

    for (i, p) in params.iter().enumerate() {
        let expected = if i == 3 { 33 } else { 0 };
        assert_eq!(p.value(), expected, "parameter {}", i);
    }
}

#[test]
fn test_chain_fires_in_declaration_order() {
    let (conn, registry) = registry();
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["A", "B", "C"] {
        registry.declare_bool(name, false).unwrap();
        let log = log.clone();
        let label = format!("{}-probe", name);
        registry
            .message_chain()
            .register(label.clone(), move |_: &Message| {
                log.lock().push(label.clone());
                Ok(())
            });
    }

    conn.deliver("batt/b", "true");
    assert_eq!(*log.lock(), vec!["A-probe", "B-probe", "C-probe"]);
    assert_eq!(
        registry.message_chain().labels(),
        vec!["A", "A-probe", "B", "B-probe", "C", "C-probe"]
    );
}

#[test]
fn test_round_trip_default_then_update() {
    let (conn, registry) = registry();
    let p = registry.declare_int("Count", 0).unwrap();
    assert_eq!(p.value(), 0);

    conn.deliver("batt/count", b"7".to_vec());
    assert_eq!(p.value(), 7);
}

#[test]
fn test_topic_match_is_exact() {
    let (conn, registry) = registry();
    let p = registry.declare_float("Rate", 1.0).unwrap();

    conn.deliver("batt/Rate", "2.0");
    conn.deliver("batt/rate/extra", "3.0");
    conn.deliver("batt/rat", "4.0");
    assert_eq!(p.value(), 1.0);
    assert_eq!(p.updates(), 0);

    conn.deliver("batt/rate", "5.5");
    assert_eq!(p.value(), 5.5);
}

#[test]
fn test_reconnect_resubscribes_every_parameter_in_order() {
    let (conn, registry) = registry();
    registry.declare_int("Alpha", 0).unwrap();
    registry.declare_float("Beta", 0.0).unwrap();
    registry.declare_bool("Gamma", false).unwrap();
    assert_eq!(conn.subscribe_log(), vec!["batt/alpha", "batt/beta", "batt/gamma"]);

    conn.clear_subscribe_log();
    conn.simulate_connection_lost();
    conn.simulate_connect(return_code::ACCEPTED);

    assert_eq!(conn.subscribe_log(), vec!["batt/alpha", "batt/beta", "batt/gamma"]);
    assert!(conn.status().connected);
}

#[test]
fn test_failed_reconnect_still_resubscribes() {
    let (conn, registry) = registry();
    registry.declare_int("Alpha", 0).unwrap();
    conn.clear_subscribe_log();

    conn.simulate_connect(return_code::SERVER_UNAVAILABLE);

    assert_eq!(conn.subscribe_log(), vec!["batt/alpha"]);
    let status = conn.status();
    assert!(!status.connected);
    assert_eq!(status.last_return_code, Some(return_code::SERVER_UNAVAILABLE));
}

#[test]
fn test_malformed_payload_does_not_block_later_parameters() {
    let (conn, registry) = registry();
    let first = registry.declare_int("Shared", 1).unwrap();
    let second = registry.declare_float("Shared", 1.0).unwrap();
    let third = registry.declare_bool("Shared", false).unwrap();

    // "abc" is no int and no float, but the bool handler after them still runs
    conn.deliver("batt/shared", "abc");
    assert_eq!(first.value(), 1);
    assert_eq!(first.decode_failures(), 1);
    assert_eq!(second.value(), 1.0);
    assert_eq!(second.decode_failures(), 1);
    assert!(!third.value());
    assert_eq!(third.updates(), 1);

    conn.deliver("batt/shared", "2.5");
    assert_eq!(first.value(), 2);
    assert_eq!(second.value(), 2.5);
}

#[test]
fn test_existing_slot_handler_fires_first() {
    let conn = Arc::new(LoopbackConnection::connected());
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    conn.on_message().replace(Arc::new(move |m: &Message| {
        l.lock().push(format!("default:{}", m.topic));
    }));

    let registry = ParameterRegistry::new(conn.clone(), "batt", "batt/control/");
    let p = registry.declare_int("Limit", 0).unwrap();
    let l = log.clone();
    registry.message_chain().register("after", move |m: &Message| {
        l.lock().push(format!("after:{}", m.topic));
        Ok(())
    });

    conn.deliver("batt/limit", "9");
    assert_eq!(p.value(), 9);
    assert_eq!(*log.lock(), vec!["default:batt/limit", "after:batt/limit"]);
}

#[test]
fn test_publish_same_value_twice() {
    let (conn, registry) = registry();
    registry.publish("soc", 1.5).unwrap();
    registry.publish("soc", 1.5).unwrap();

    let published = conn.published();
    assert_eq!(published.len(), 2);
    for p in &published {
        assert_eq!(p.topic, "batt/control/soc");
        assert_eq!(p.payload_str(), "1.500");
        assert!(p.retain);
    }
    assert_eq!(published[0], published[1]);
}

#[test]
fn test_declare_picks_up_retained_value() {
    let (conn, registry) = registry();
    conn.publish("batt/setpoint", b"42.7", true).unwrap();

    let p = registry.declare_int("SetPoint", 0).unwrap();
    assert_eq!(p.value(), 42);
}

#[test]
fn test_published_control_value_reaches_parameter() {
    let conn = Arc::new(LoopbackConnection::connected());
    // control values land under the parameter root, as a loop-back setup does
    let registry = ParameterRegistry::new(conn.clone(), "batt", "batt/");
    let p = registry.declare_float("Target", 0.0).unwrap();

    registry.publish("target", 3.25).unwrap();
    assert_eq!(p.value(), 3.25);
}

#[test]
fn test_concurrent_reads_while_delivering() {
    let (conn, registry) = registry();
    let p = registry.declare_int("Counter", 0).unwrap();

    let reader = {
        let p = p.clone();
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..1000 {
                let v = p.value();
                assert!(v >= last, "value went backwards: {} < {}", v, last);
                last = v;
            }
        })
    };

    for i in 1..=500 {
        conn.deliver("batt/counter", i.to_string());
    }
    reader.join().unwrap();
    assert_eq!(p.value(), 500);
    assert_eq!(p.updates(), 500);
}

#[test]
fn test_declare_while_live() {
    let (conn, registry) = registry();
    let early = registry.declare_int("Early", 0).unwrap();

    // declaring from the delivery path takes effect on the next firing
    let late_slot = Arc::new(Mutex::new(None));
    {
        let registry = Arc::new(registry);
        let r = Arc::downgrade(&registry);
        let slot = late_slot.clone();
        registry.message_chain().register("declarer", move |m: &Message| {
            if m.topic != "batt/early" {
                return Ok(());
            }
            let mut slot = slot.lock();
            if slot.is_none()
                && let Some(registry) = r.upgrade()
            {
                *slot = Some(registry.declare_int("Late", 0)?);
            }
            Ok(())
        });

        conn.deliver("batt/early", "1");
        assert_eq!(early.value(), 1);
        let late = late_slot.lock().clone().expect("late parameter declared");
        conn.deliver("batt/late", "2");
        assert_eq!(late.value(), 2);
        assert_eq!(registry.len(), 2);
    }
}
