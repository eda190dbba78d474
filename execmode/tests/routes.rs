//! The demo routes, end to end through the dispatcher.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::executor::block_on;

use execmode::pipeline::RecordingInstrumentation;
use execmode::{
    BlockingPolicy, Dispatcher, ExecError, ExecmodeOptions, OutboundClient, StaticClient,
    StreamSink, api,
};

const DELAY_MS: u64 = 80;

fn options() -> ExecmodeOptions {
    let mut options = ExecmodeOptions {
        event_loop_threads: 2,
        worker_threads: 8,
        ..Default::default()
    };
    options.api.delay_ms = DELAY_MS;
    options.api.tick_interval_ms = 30;
    options.outbound.timeout_ms = 60;
    options
}

fn start(
    options: ExecmodeOptions,
    client: Arc<dyn OutboundClient>,
) -> (Dispatcher, Arc<RecordingInstrumentation>) {
    let recorder = Arc::new(RecordingInstrumentation::new());
    let dispatcher = Dispatcher::with_instrumentation(options, recorder.clone()).unwrap();
    api::register_routes(dispatcher.registry(), dispatcher.options(), client).unwrap();
    (dispatcher, recorder)
}

fn demo() -> (Dispatcher, Arc<RecordingInstrumentation>) {
    start(options(), Arc::new(StaticClient::hanging()))
}

#[test]
fn test_hello() {
    let (d, _) = demo();
    let response = block_on(d.dispatch("hello"));
    assert_eq!(response.body(), Some("Hello!"));
    assert_eq!(response.status_code(), 200);
}

#[test]
fn test_async_hello_is_delayed() {
    let (d, _) = demo();
    let start = Instant::now();
    let response = block_on(d.dispatch("async-hello"));
    assert_eq!(response.body(), Some("Hello!"));
    assert!(start.elapsed() >= Duration::from_millis(DELAY_MS));
}

#[test]
fn test_async_request_extracts_joke() {
    let client = Arc::new(StaticClient::respond(
        serde_json::json!({"id": "x", "value": "Chuck Norris can divide by zero."}),
    ));
    let (d, _) = start(options(), client.clone());

    let response = block_on(d.dispatch("async-request"));
    assert_eq!(response.body(), Some("Chuck Norris can divide by zero."));
    assert_eq!(
        client.requests(),
        vec!["/jokes/random|Accept: application/json"]
    );
}

#[test]
fn test_async_request_timeout_falls_back() {
    let (d, _) = demo();
    let start = Instant::now();
    let response = block_on(d.dispatch("async-request"));
    assert_eq!(response.body(), Some("Chuck Norris is sleeping"));
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_async_request_upstream_failure_falls_back() {
    let client = Arc::new(StaticClient::fail(ExecError::Upstream(
        "connection refused".into(),
    )));
    let (d, _) = start(options(), client);
    let response = block_on(d.dispatch("async-request"));
    assert_eq!(response.body(), Some("Chuck Norris is sleeping"));
}

#[test]
fn test_log_route_taps_both_steps() {
    let (d, recorder) = demo();
    let response = block_on(d.dispatch("log"));
    assert_eq!(response.body(), Some("HELLO!"));
    assert_eq!(
        recorder.events_for("step-1"),
        vec!["step-1.onSubscribe()", "step-1.onItem(\"Hello!\")"]
    );
    assert_eq!(
        recorder.events_for("step-2"),
        vec!["step-2.onSubscribe()", "step-2.onItem(\"HELLO!\")"]
    );
}

#[test]
fn test_stream_log_frames() {
    let (d, recorder) = demo();
    let stream = block_on(d.dispatch("stream-log")).into_stream().unwrap();

    let frames: Vec<String> = block_on(stream.sse_frames().take(3).collect());
    assert_eq!(
        frames,
        vec![
            "data: tick #0\n\n",
            "data: tick #1\n\n",
            "data: tick #2\n\n",
        ]
    );
    assert_eq!(recorder.events_for("stream")[0], "stream.onSubscribe()");
}

#[test]
fn test_stream_log_cancellation_is_counted() {
    struct Collect(mpsc::Sender<Option<String>>);
    impl StreamSink for Collect {
        fn on_emit(&mut self, item: String) {
            let _ = self.0.send(Some(item));
        }
        fn on_cancel(&mut self) {
            let _ = self.0.send(None);
        }
    }

    let (d, _) = demo();
    let stream = block_on(d.dispatch("stream-log")).into_stream().unwrap();
    let (tx, rx) = mpsc::channel();
    let subscription = stream.deliver(Collect(tx));

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.as_deref(), Some("tick #0"));
    assert!(subscription.cancel());

    let mut late = 0;
    while let Some(_item) = rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        late += 1;
    }
    assert!(late <= 1);

    let metrics = d.metrics();
    assert_eq!(metrics.streams_opened, 1);
    assert_eq!(metrics.streams_cancelled, 1);
    assert_eq!(metrics.in_flight(), 0);
}

#[test]
fn test_dont_block_is_illegal_on_event_loop() {
    let (d, recorder) = demo();
    let response = block_on(d.dispatch("dont-block"));

    assert!(response.error().is_some_and(ExecError::is_illegal_blocking));
    assert_eq!(response.status_code(), 500);
    assert_eq!(d.metrics().illegal_blocking_uses, 1);
    assert!(recorder.illegal_blocking()[0].starts_with("event-loop-"));
}

#[test]
fn test_dont_block_tolerated_under_warn_policy() {
    let mut options = options();
    options.blocking_policy = BlockingPolicy::Warn;
    let (d, recorder) = start(options, Arc::new(StaticClient::hanging()));

    let response = block_on(d.dispatch("dont-block"));
    assert_eq!(response.body(), Some("Woops"));
    assert_eq!(recorder.illegal_blocking().len(), 1);
}

#[test]
fn test_can_block_runs_on_worker_pool() {
    let (d, recorder) = demo();
    let start = Instant::now();
    let response = block_on(d.dispatch("can-block"));
    assert_eq!(response.body(), Some("Woops"));
    assert!(start.elapsed() >= Duration::from_millis(DELAY_MS));
    assert!(recorder.illegal_blocking().is_empty());
    assert_eq!(d.metrics().blocking_dispatches, 1);
}

#[test]
fn test_blocking_calls_do_not_delay_hello() {
    let (d, _) = demo();
    let blocked: Vec<_> = (0..4)
        .map(|_| {
            let d = d.clone();
            std::thread::spawn(move || block_on(d.dispatch("can-block")))
        })
        .collect();
    std::thread::sleep(Duration::from_millis(10));

    let start = Instant::now();
    assert_eq!(block_on(d.dispatch("hello")).body(), Some("Hello!"));
    assert!(start.elapsed() < Duration::from_millis(DELAY_MS));

    for handle in blocked {
        assert_eq!(handle.join().unwrap().body(), Some("Woops"));
    }
}

#[test]
fn test_unknown_route() {
    let (d, _) = demo();
    let response = block_on(d.dispatch("nope"));
    assert!(matches!(response.error(), Some(ExecError::NotFound(_))));
}
