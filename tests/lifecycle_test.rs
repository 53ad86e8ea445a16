//! Task lifecycle and worker loop against the in-memory store and broker.

use requestq::broker::memory::MemoryBroker;
use requestq::error::Error;
use requestq::lifecycle::Tracker;
use requestq::model::{NewTask, ResultPolicy, TaskId, TaskStatus};
use requestq::pool::PoolConfig;
use requestq::queue::{QueueClient, QueueConfig};
use requestq::retry::RetryPolicy;
use requestq::store::memory::MemoryTaskStore;
use requestq::worker::{CommandProcessor, EchoProcessor, Processor, Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;

type TestTracker = Tracker<MemoryTaskStore, MemoryBroker>;

fn tracker(broker: &MemoryBroker, policy: ResultPolicy) -> TestTracker {
    let queue = QueueClient::new(
        broker.clone(),
        PoolConfig::default(),
        RetryPolicy::new(3, Duration::from_secs(5)),
        QueueConfig::default(),
    );
    Tracker::new(Arc::new(MemoryTaskStore::new()), Arc::new(queue), policy)
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_creates_pending_task_and_enqueues_it() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);

    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.result, None);
    assert_eq!(task.owner, "alice");
    assert_eq!(broker.ready_count("request_queue"), 1);

    let dispatch = app.fetch_next().await.unwrap().unwrap();
    assert_eq!(dispatch.message.id, task.id);
    assert_eq!(dispatch.message.query, "hello");
}

#[tokio::test]
async fn submit_assigns_unique_ids() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);

    let a = app.submit(NewTask::new("one", "alice")).await.unwrap();
    let b = app.submit(NewTask::new("two", "alice")).await.unwrap();

    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn submit_rejects_empty_query() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);

    let err = app.submit(NewTask::new("", "alice")).await.unwrap_err();

    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
    assert_eq!(broker.ready_count("request_queue"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_enqueue_leaves_task_pending() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    broker.set_down(true);

    let err = app.submit(NewTask::new("hello", "alice")).await.unwrap_err();
    assert!(matches!(err, Error::EnqueueFailed { .. }), "got {err:?}");

    let tasks = app.list_for_owner("alice").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].result, None);
}

// ---------------------------------------------------------------------------
// Complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complete_sets_result_and_status() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let done = app.complete(task.id, "world").await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("world"));
    assert!(done.updated_at >= task.updated_at);
    assert_eq!(done.created_at, task.created_at);
    assert_eq!(done.query, "hello");
}

#[tokio::test]
async fn completing_twice_keeps_last_result() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    app.complete(task.id, "first").await.unwrap();
    app.complete(task.id, "second").await.unwrap();

    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result.as_deref(), Some("second"));
}

#[tokio::test]
async fn reject_policy_keeps_first_result() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Reject);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    app.complete(task.id, "first").await.unwrap();
    let err = app.complete(task.id, "second").await.unwrap_err();

    assert!(matches!(err, Error::InvalidTransition { .. }), "got {err:?}");
    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.result.as_deref(), Some("first"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_completions_keep_one_result_under_reject() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Reject);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let mut racers = tokio::task::JoinSet::new();
    for n in 0..8 {
        let app = app.clone();
        racers.spawn(async move { (n, app.complete(task.id, format!("result {n}")).await) });
    }

    let mut winners = Vec::new();
    while let Some(joined) = racers.join_next().await {
        match joined.unwrap() {
            (n, Ok(_)) => winners.push(n),
            (_, Err(e)) => assert!(matches!(e, Error::InvalidTransition { .. }), "got {e:?}"),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one result accepted");
    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.result, Some(format!("result {}", winners[0])));
}

#[tokio::test]
async fn complete_unknown_task_is_not_found() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);

    let err = app.complete(TaskId(999), "nobody asked").await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn list_for_owner_only_returns_own_tasks() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    app.submit(NewTask::new("a1", "alice")).await.unwrap();
    app.submit(NewTask::new("b1", "bob")).await.unwrap();
    app.submit(NewTask::new("a2", "alice")).await.unwrap();

    let queries: Vec<_> = app
        .list_for_owner("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.query)
        .collect();

    assert_eq!(queries, vec!["a1", "a2"]);
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct FailingProcessor;

#[async_trait::async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, _query: &str) -> requestq::error::Result<String> {
        Err(Error::Other("model unavailable".to_string()))
    }
}

fn worker(
    app: &TestTracker,
    processor: Arc<dyn Processor>,
) -> Worker<MemoryTaskStore, MemoryBroker> {
    Worker::new(
        app.clone(),
        processor,
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
        },
    )
}

#[tokio::test]
async fn worker_completes_queued_task() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let w = worker(&app, Arc::new(EchoProcessor));
    assert!(w.process_one().await.unwrap());
    assert!(!w.process_one().await.unwrap(), "queue drained");

    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(
        stored.result.as_deref(),
        Some("Processed result for query: hello")
    );
}

#[tokio::test]
async fn processing_failure_leaves_task_pending() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let w = worker(&app, Arc::new(FailingProcessor));
    assert!(w.process_one().await.unwrap());

    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.result, None);
}

#[cfg(unix)]
#[tokio::test]
async fn command_processor_result_is_stdout() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let w = worker(&app, Arc::new(CommandProcessor::new("cat")));
    assert!(w.process_one().await.unwrap());

    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result.as_deref(), Some("hello"));
}

#[cfg(unix)]
#[tokio::test]
async fn command_processor_nonzero_exit_leaves_task_pending() {
    let processor = CommandProcessor::new("false");
    assert!(processor.process("anything").await.is_err());

    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let task = app.submit(NewTask::new("hello", "alice")).await.unwrap();

    let w = worker(&app, Arc::new(processor));
    assert!(w.process_one().await.unwrap());

    let stored = app.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.result, None);
}

#[tokio::test]
async fn worker_loop_drains_queue_and_stops_on_shutdown() {
    let broker = MemoryBroker::new();
    let app = tracker(&broker, ResultPolicy::Overwrite);
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            app.submit(NewTask::new(format!("q{n}"), "alice"))
                .await
                .unwrap()
                .id,
        );
    }

    let w = worker(&app, Arc::new(EchoProcessor));
    let runner = w.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let tasks = app.list_for_owner("alice").await.unwrap();
            if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should finish all tasks");

    w.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop")
        .unwrap()
        .unwrap();
    assert_eq!(ids.len(), 5);
}
