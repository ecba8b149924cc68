use std::time::Duration;

use kameo_pubsub::{
    actor::NodeId,
    config::MediatorConfig,
    message::{Count, CountSubscribers, Payload, Publish, Put, Subscribe, Unsubscribe},
    testkit::LocalNetwork,
    MediatorRef,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn manual_config() -> MediatorConfig {
    MediatorConfig {
        gossip_interval: Duration::from_secs(3600),
        prune_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn subscribers(mediator: &MediatorRef, topic: &str) -> usize {
    mediator
        .count_subscribers(CountSubscribers::new(topic))
        .await
        .unwrap()
}

fn cluster(network: &LocalNetwork, names: &[&str], config: MediatorConfig) -> Vec<MediatorRef> {
    names
        .iter()
        .map(|name| {
            network
                .spawn_mediator(NodeId::new(*name), config.clone())
                .unwrap()
        })
        .collect()
}

#[tokio::test]
async fn subscriptions_converge_across_three_nodes() {
    init_tracing();
    let network = LocalNetwork::new();
    let mediators = cluster(&network, &["node-1", "node-2", "node-3"], manual_config());

    let mut probes = Vec::new();
    for mediator in &mediators {
        let probe = network.spawn_probe(mediator.node(), "/user/listener");
        mediator
            .subscribe(Subscribe::new("news", probe.actor_ref().clone()).unwrap())
            .await
            .unwrap();
        probes.push(probe);
    }

    network.gossip_round().await.unwrap();
    for mediator in &mediators {
        assert_eq!(subscribers(mediator, "news").await, 3);
        assert_eq!(mediator.get_topics().await.unwrap().topics, vec!["news"]);
    }

    mediators[1]
        .publish(Publish::new("news", Payload::encode("hello").unwrap()))
        .unwrap();
    network.settle().await.unwrap();
    for probe in &mut probes {
        assert_eq!(probe.drain().len(), 1);
    }
}

#[tokio::test]
async fn unsubscribe_propagates_as_tombstone() {
    init_tracing();
    let network = LocalNetwork::new();
    let mediators = cluster(&network, &["node-1", "node-2"], manual_config());
    let mut probe = network.spawn_probe(mediators[1].node(), "/user/listener");
    let actor_ref = probe.actor_ref().clone();

    mediators[1]
        .subscribe(Subscribe::new("news", actor_ref.clone()).unwrap())
        .await
        .unwrap();
    network.gossip_round().await.unwrap();
    assert_eq!(subscribers(&mediators[0], "news").await, 1);

    mediators[1]
        .unsubscribe(Unsubscribe::new("news", actor_ref).unwrap())
        .await
        .unwrap();
    network.gossip_round().await.unwrap();
    assert_eq!(subscribers(&mediators[0], "news").await, 0);
    assert!(mediators[0].get_topics().await.unwrap().topics.is_empty());

    mediators[0]
        .publish(Publish::new("news", Payload::encode("late").unwrap()))
        .unwrap();
    network.settle().await.unwrap();
    assert!(probe.drain().is_empty());
}

#[tokio::test]
async fn removed_node_is_pruned() {
    init_tracing();
    let network = LocalNetwork::new();
    let mediators = cluster(&network, &["node-1", "node-2", "node-3"], manual_config());

    for mediator in &mediators {
        let probe = network.spawn_probe(mediator.node(), "/user/worker");
        mediator.put(Put::new(probe.actor_ref().clone())).unwrap();
        mediator
            .subscribe(Subscribe::new("jobs", probe.actor_ref().clone()).unwrap())
            .await
            .unwrap();
    }
    network.gossip_round().await.unwrap();
    assert_eq!(mediators[0].count().await.unwrap(), 6);

    network.remove_node(mediators[2].node()).await.unwrap();
    network.settle().await.unwrap();
    assert_eq!(mediators[0].count().await.unwrap(), 4);
    assert_eq!(subscribers(&mediators[1], "jobs").await, 2);

    // Further rounds must not bring the removed node back.
    network.gossip_round().await.unwrap();
    assert_eq!(mediators[0].count().await.unwrap(), 4);
}

#[tokio::test]
async fn unreachable_node_keeps_its_registrations() {
    init_tracing();
    let network = LocalNetwork::new();
    let mediators = cluster(&network, &["node-1", "node-2"], manual_config());
    let node_2 = mediators[1].node();

    let first = network.spawn_probe(node_2, "/user/first");
    mediators[1]
        .subscribe(Subscribe::new("news", first.actor_ref().clone()).unwrap())
        .await
        .unwrap();
    network.gossip_round().await.unwrap();

    network.disconnect(node_2);
    let second = network.spawn_probe(node_2, "/user/second");
    mediators[1]
        .subscribe(Subscribe::new("news", second.actor_ref().clone()).unwrap())
        .await
        .unwrap();
    network.gossip_round().await.unwrap();
    assert_eq!(subscribers(&mediators[0], "news").await, 1);

    network.reconnect(node_2);
    network.gossip_round().await.unwrap();
    assert_eq!(subscribers(&mediators[0], "news").await, 2);
}

#[tokio::test]
async fn large_buckets_arrive_in_capped_deltas() {
    init_tracing();
    let network = LocalNetwork::new();
    let config = MediatorConfig {
        max_delta_elements: 2,
        ..manual_config()
    };
    let mediators = cluster(&network, &["node-1", "node-2"], config);

    for i in 0..5 {
        let probe = network.spawn_probe(mediators[0].node(), format!("/user/worker-{i}"));
        mediators[0].put(Put::new(probe.actor_ref().clone())).unwrap();
    }

    let mut rounds = 0;
    while mediators[1].count().await.unwrap() < 5 {
        network.gossip_round().await.unwrap();
        rounds += 1;
        assert!(rounds <= 3, "delta cap should ship 2 entries per round");
    }
    assert_eq!(rounds, 3);
}

#[tokio::test(start_paused = true)]
async fn tombstones_are_purged_after_ttl() {
    init_tracing();
    let ttl = Duration::from_secs(30);
    let network = LocalNetwork::new();
    let config = MediatorConfig {
        removed_time_to_live: ttl,
        ..manual_config()
    };
    let mediators = cluster(&network, &["node-1", "node-2"], config);
    let probe = network.spawn_probe(mediators[0].node(), "/user/listener");
    let subscribe = Subscribe::new("news", probe.actor_ref().clone()).unwrap();
    let unsubscribe = Unsubscribe::new("news", probe.actor_ref().clone()).unwrap();

    mediators[0].subscribe(subscribe).await.unwrap();
    network.gossip_round().await.unwrap();
    mediators[0].unsubscribe(unsubscribe).await.unwrap();
    network.gossip_round().await.unwrap();

    assert_eq!(mediators[0].prune_tick().await.unwrap(), 0);
    assert_eq!(mediators[1].prune_tick().await.unwrap(), 0);

    tokio::time::advance(ttl).await;
    assert_eq!(mediators[0].prune_tick().await.unwrap(), 1);
    assert_eq!(mediators[1].prune_tick().await.unwrap(), 1);

    network.gossip_round().await.unwrap();
    for mediator in &mediators {
        assert_eq!(subscribers(mediator, "news").await, 0);
        assert_eq!(mediator.count().await.unwrap(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_during_partition_survives_ttl() {
    init_tracing();
    let ttl = Duration::from_secs(30);
    let network = LocalNetwork::new();
    let config = MediatorConfig {
        removed_time_to_live: ttl,
        ..manual_config()
    };
    let mediators = cluster(&network, &["node-1", "node-2"], config);
    let node_2 = mediators[1].node();
    let mut probe = network.spawn_probe(node_2, "/user/listener");
    let actor_ref = probe.actor_ref().clone();

    mediators[1]
        .subscribe(Subscribe::new("news", actor_ref.clone()).unwrap())
        .await
        .unwrap();
    network.gossip_round().await.unwrap();
    assert_eq!(subscribers(&mediators[0], "news").await, 1);

    network.disconnect(node_2);
    mediators[1]
        .unsubscribe(Unsubscribe::new("news", actor_ref).unwrap())
        .await
        .unwrap();
    tokio::time::advance(ttl).await;
    assert_eq!(mediators[1].prune_tick().await.unwrap(), 0);

    network.reconnect(node_2);
    network.gossip_round().await.unwrap();
    for mediator in &mediators {
        assert_eq!(subscribers(mediator, "news").await, 0);
    }
    mediators[0]
        .publish(Publish::new("news", Payload::encode("late").unwrap()))
        .unwrap();
    network.settle().await.unwrap();
    assert!(probe.drain().is_empty());

    // Once node-1 has acknowledged the removal the tombstone can go.
    network.gossip_round().await.unwrap();
    assert_eq!(mediators[1].prune_tick().await.unwrap(), 1);
}

#[tokio::test]
async fn count_messages_render() {
    assert_eq!(Count.to_string(), "Count<>");
    assert_eq!(
        CountSubscribers::new("news").to_string(),
        "CountSubscribers<topic:news>"
    );
}
