//! Integration tests for the stream client.

use filtered_stream::{
    ClientConfig, MemoryTransport, PumpState, Rule, RuleId, StreamClient, IMAGE_FILTER,
};
use serde_json::{json, Value};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_client() -> (Arc<MemoryTransport>, StreamClient) {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let client = StreamClient::new(transport.clone());
    (transport, client)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn rule_id(rule: &Rule) -> RuleId {
    rule.id.clone().expect("registered rule has an id")
}

/// A stream record for a post by @catlover, tagged with `rules`.
fn post(id: &str, text: &str, rules: &[&Rule]) -> Value {
    let matching: Vec<Value> = rules
        .iter()
        .map(|r| json!({ "id": rule_id(r).as_str(), "tag": "" }))
        .collect();
    json!({
        "data": {
            "id": id,
            "text": text,
            "author_id": "42",
            "created_at": "2021-03-01T12:00:00.000Z",
            "public_metrics": {
                "retweet_count": 3,
                "reply_count": 1,
                "like_count": 10,
                "quote_count": 0
            }
        },
        "includes": {
            "users": [{
                "id": "42",
                "name": "Cat Lover",
                "username": "catlover",
                "profile_image_url": "https://example.com/catlover.jpg",
                "verified": true
            }]
        },
        "matching_rules": matching
    })
}

// --- Realistic Workflow Tests ---

#[test]
fn test_single_subscription_lifecycle() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    assert!(rule.is_registered());

    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));
    assert!(client.is_streaming());

    assert!(transport.push_record(&post("1", "look at this cat", &[&rule])));
    let event = sub.recv_timeout(WAIT).unwrap();
    assert_eq!(event.id, "1");
    assert_eq!(event.text, "look at this cat");
    assert_eq!(event.author.handle, "catlover");
    assert_eq!(event.author.name, "Cat Lover");
    assert!(event.author.verified);
    assert_eq!(event.likes, 10);
    assert!(event.matches(&rule_id(&rule)));

    client.unsubscribe(&sub);

    // Channel closes once drained
    assert!(sub.recv_timeout(WAIT).is_err());

    // The rule is deleted upstream exactly once
    assert_eq!(transport.wait_for_delete(WAIT), Some(vec![rule_id(&rule)]));
    assert_eq!(transport.wait_for_delete(Duration::from_millis(200)), None);
    assert!(transport.rules().is_empty());

    // Last subscriber gone: the connection is released
    assert!(!client.is_streaming());
    assert!(wait_until(|| transport.active_connections() == 0));
    assert!(wait_until(|| client.pump_state() == PumpState::Stopped));
}

#[test]
fn test_events_fan_out_by_rule() {
    let (transport, client) = test_client();

    let dogs = client.create_rule("dogs").unwrap();
    let cats = client.create_rule("cats").unwrap();
    let birds = client.create_rule("birds").unwrap();

    let dog_sub = client.subscribe(dogs.clone());
    let cat_sub = client.subscribe(cats.clone());
    let bird_sub = client.subscribe(birds.clone());
    assert!(transport.wait_for_connection(WAIT));
    assert_eq!(transport.connections_opened(), 1);

    // Matches dogs and birds, but not cats
    assert!(transport.push_record(&post("7", "dogs chasing birds", &[&dogs, &birds])));

    assert_eq!(dog_sub.recv_timeout(WAIT).unwrap().id, "7");
    assert_eq!(bird_sub.recv_timeout(WAIT).unwrap().id, "7");
    assert!(cat_sub
        .recv_timeout(Duration::from_millis(100))
        .is_err());

    client.unsubscribe(&dog_sub);
    client.unsubscribe(&cat_sub);
    client.unsubscribe(&bird_sub);
}

#[test]
fn test_sibling_subscription_keeps_rule() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let first = client.subscribe(rule.clone());
    let second = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    assert!(transport.push_record(&post("1", "cat", &[&rule])));
    assert_eq!(first.recv_timeout(WAIT).unwrap().id, "1");
    assert_eq!(second.recv_timeout(WAIT).unwrap().id, "1");

    // Another subscriber still uses the rule: no delete, stream stays up
    client.unsubscribe(&first);
    assert_eq!(transport.wait_for_delete(Duration::from_millis(200)), None);
    assert!(client.is_streaming());

    assert!(transport.push_record(&post("2", "another cat", &[&rule])));
    assert_eq!(second.recv_timeout(WAIT).unwrap().id, "2");

    client.unsubscribe(&second);
    assert_eq!(transport.wait_for_delete(WAIT), Some(vec![rule_id(&rule)]));
    assert!(!client.is_streaming());
}

#[test]
fn test_events_arrive_in_stream_order() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    for i in 0..100 {
        assert!(transport.push_record(&post(&i.to_string(), "cat", &[&rule])));
    }

    let ids: Vec<String> = (0..100)
        .map(|_| sub.recv_timeout(WAIT).unwrap().id)
        .collect();
    let expected: Vec<String> = (0..100).map(|i: i32| i.to_string()).collect();
    assert_eq!(ids, expected);

    client.unsubscribe(&sub);
}

#[test]
fn test_create_rule_is_idempotent() {
    let (transport, client) = test_client();

    let first = client.create_rule("foo").unwrap();
    let second = client.create_rule("foo").unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.rules().len(), 1);
    assert_eq!(client.list_rules().unwrap(), vec![first]);
}

#[test]
fn test_create_rule_from_terms() {
    let (transport, client) = test_client();

    let rule = client
        .create_rule_from_terms(["cats", IMAGE_FILTER])
        .unwrap();

    assert_eq!(rule.expression, format!(" cats {}", IMAGE_FILTER));
    assert_eq!(transport.rules(), vec![rule]);
}

#[test]
fn test_numeric_rule_ids_match() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    // Some servers send matched rule ids as JSON numbers
    let numeric: u64 = rule_id(&rule).as_str().parse().unwrap();
    let mut record = post("9", "cat", &[]);
    record["matching_rules"] = json!([{ "id": numeric }]);
    assert!(transport.push_record(&record));

    assert_eq!(sub.recv_timeout(WAIT).unwrap().id, "9");
    client.unsubscribe(&sub);
}

#[test]
fn test_notices_without_post_are_skipped() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    assert!(transport.push_record(&json!({
        "errors": [{ "title": "operational-disconnect" }]
    })));
    assert!(transport.push_raw(b"\r\n".to_vec()));
    assert!(transport.push_record(&post("3", "cat", &[&rule])));

    assert_eq!(sub.recv_timeout(WAIT).unwrap().id, "3");
    assert!(client.is_streaming());
    client.unsubscribe(&sub);
}

#[test]
fn test_all_events_channel() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let client = StreamClient::with_config(
        transport.clone(),
        ClientConfig {
            enable_all_events: true,
            ..ClientConfig::default()
        },
    );

    let rule = client.create_rule("cats").unwrap();
    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    // Unmatched events still reach the all-events channel
    assert!(transport.push_record(&post("1", "unrelated", &[])));
    assert!(transport.push_record(&post("2", "cat", &[&rule])));

    let all = client.all_events().unwrap();
    assert_eq!(all.recv_timeout(WAIT).unwrap().id, "1");
    assert_eq!(all.recv_timeout(WAIT).unwrap().id, "2");
    assert_eq!(sub.recv_timeout(WAIT).unwrap().id, "2");

    client.unsubscribe(&sub);
}

#[test]
fn test_all_events_disabled_by_default() {
    let (_transport, client) = test_client();
    assert!(client.all_events().is_none());
}

#[test]
fn test_resubscribe_restarts_after_stream_failure() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let first = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    // Undecodable data ends the stream; the subscription stays open
    assert!(transport.push_raw(b"{not json}\r\n".to_vec()));
    assert!(wait_until(|| !client.is_streaming()));
    assert!(wait_until(|| transport.active_connections() == 0));
    assert_eq!(client.subscription_count(), 1);
    assert!(first.try_recv().is_err());

    // A new subscription brings the stream back for everyone
    let second = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));
    assert_eq!(transport.connections_opened(), 2);

    assert!(transport.push_record(&post("5", "cat again", &[&rule])));
    assert_eq!(first.recv_timeout(WAIT).unwrap().id, "5");
    assert_eq!(second.recv_timeout(WAIT).unwrap().id, "5");

    client.unsubscribe(&first);
    client.unsubscribe(&second);
    assert_eq!(transport.wait_for_delete(WAIT), Some(vec![rule_id(&rule)]));
}

#[test]
fn test_shutdown_keeps_subscriptions() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let sub = client.subscribe(rule.clone());
    assert!(transport.wait_for_connection(WAIT));

    client.shutdown();
    assert!(!client.is_streaming());
    assert_eq!(client.pump_state(), PumpState::Stopped);
    assert_eq!(transport.active_connections(), 0);
    assert_eq!(client.subscription_count(), 1);

    client.start_stream();
    assert!(transport.wait_for_connection(WAIT));
    assert!(transport.push_record(&post("8", "cat", &[&rule])));
    assert_eq!(sub.recv_timeout(WAIT).unwrap().id, "8");

    client.unsubscribe(&sub);
}

#[test]
fn test_concurrent_subscribers() {
    let (transport, client) = test_client();
    let client = Arc::new(client);

    let rules: Vec<Rule> = (0..8)
        .map(|i| client.create_rule(&format!("topic{}", i)).unwrap())
        .collect();

    let handles: Vec<_> = rules
        .iter()
        .cloned()
        .map(|rule| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..20 {
                    let sub = client.subscribe(rule.clone());
                    client.unsubscribe(&sub);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(client.subscription_count(), 0);
    assert!(!client.is_streaming());
    assert!(wait_until(|| transport.active_connections() == 0));

    // Every orphaned rule was deleted; duplicates past the first find nothing
    assert!(wait_until(|| transport.rules().is_empty()));
}

#[test]
fn test_drop_client_releases_connection() {
    let (transport, client) = test_client();

    let rule = client.create_rule("cats").unwrap();
    let _sub = client.subscribe(rule);
    assert!(transport.wait_for_connection(WAIT));

    drop(client);
    assert!(wait_until(|| transport.active_connections() == 0));
}

#[test]
fn test_racing_sibling_unsubscribes_delete_each_rule_once() {
    let (transport, client) = test_client();
    let client = Arc::new(client);

    let rules: Vec<Rule> = (0..4)
        .map(|i| client.create_rule(&format!("shared{}", i)).unwrap())
        .collect();

    // Several subscriptions per rule, all released at the same moment
    let siblings = 6;
    let subs: Vec<_> = rules
        .iter()
        .flat_map(|rule| {
            (0..siblings)
                .map(|_| client.subscribe(rule.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    let barrier = Arc::new(Barrier::new(subs.len()));

    let handles: Vec<_> = subs
        .into_iter()
        .map(|sub| {
            let client = Arc::clone(&client);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                client.unsubscribe(&sub);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(|| transport.delete_requests().len() >= rules.len()));
    thread::sleep(Duration::from_millis(200));

    let mut deleted: Vec<RuleId> = transport.delete_requests().into_iter().flatten().collect();
    deleted.sort();
    let mut expected: Vec<RuleId> = rules.iter().map(rule_id).collect();
    expected.sort();
    assert_eq!(transport.delete_requests().len(), rules.len());
    assert_eq!(deleted, expected);
    assert!(!client.is_streaming());
}
