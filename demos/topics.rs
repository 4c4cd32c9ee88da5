use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use singleflight_group::Group;

/// Stand-in for a remote search API that counts the requests it serves.
#[derive(Default)]
struct TopicClient {
    requests: AtomicUsize,
}

impl TopicClient {
    fn search(&self, topic: &str) -> Result<Vec<String>, String> {
        self.requests.fetch_add(1, Ordering::AcqRel);
        println!("will sleep to simulate a remote call for {topic}");
        std::thread::sleep(Duration::from_millis(100));
        Ok(vec![format!("{topic}/core"), format!("{topic}/tools")])
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let client = Arc::new(TopicClient::default());
    let group: Group<String, Vec<String>, String> = Group::new();

    let begin = std::time::Instant::now();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let (client, group) = (Arc::clone(&client), group.clone());
        handles.push(tokio::task::spawn_blocking(move || {
            group.work("topic_gRPC".to_string(), || client.search("gRPC"))
        }));
    }
    for handle in handles {
        let (result, shared) = handle.await.expect("caller thread panicked");
        println!("deduplicated: {result:?} shared={shared}");
    }
    println!(
        "deduplicated requests: {} in {:?}",
        client.requests.load(Ordering::Acquire),
        begin.elapsed()
    );

    client.requests.store(0, Ordering::Release);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let client = Arc::clone(&client);
        handles.push(tokio::task::spawn_blocking(move || client.search("gRPC")));
    }
    for handle in handles {
        handle.await.expect("caller thread panicked").ok();
    }
    println!("direct requests: {}", client.requests.load(Ordering::Acquire));

    let receivers: Vec<_> = (0..3)
        .map(|_| {
            let client = Arc::clone(&client);
            group.work_chan("topic_rust".to_string(), move || client.search("rust"))
        })
        .collect();
    for rx in receivers {
        let response = rx.await.expect("worker dropped the response");
        println!("channel: shared={} {:?}", response.shared(), response.into_result());
    }
}
