//! End-to-end runs of the generation controller against a scripted upstream

use pageforge_core::adapters::{MockFailure, MockReply, MockStep, MockUpstream};
use pageforge_core::reconciler::MODEL_READY;
use pageforge_core::{
    Capabilities, ControllerConfig, Error, EventPayload, EventSink, GenerateBody,
    GenerationController, GenerationOutcome, GenerationRequest, RequestDefaults, Result,
    StreamEvent, Strategy, UpstreamConnector, UpstreamResponse,
};
use std::time::Duration;

const API_KEY: &str = "test-key-1234567890";

fn request(content: &str) -> GenerationRequest {
    GenerationRequest::from_body(
        GenerateBody {
            api_key: Some(API_KEY.to_string()),
            content: Some(content.to_string()),
            max_tokens: Some(64_000),
            ..Default::default()
        },
        &RequestDefaults::default(),
    )
    .unwrap()
}

fn controller_with(cascade: Vec<Strategy>) -> GenerationController {
    GenerationController::new(ControllerConfig {
        cascade,
        ..Default::default()
    })
}

async fn run(
    controller: &GenerationController,
    mock: &MockUpstream,
    request: &GenerationRequest,
) -> (Result<GenerationOutcome>, Vec<StreamEvent>) {
    let (sink, mut rx) = EventSink::channel(request.session_id, 64);
    let client = mock.connect(&request.api_key).unwrap();

    let drive = async move { controller.run(request, client, &sink).await };
    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };
    tokio::join!(drive, collect)
}

fn types(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

fn count(events: &[StreamEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.event_type() == kind).count()
}

fn message_complete(events: &[StreamEvent]) -> (&str, bool, Option<&str>) {
    events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::MessageComplete {
                html,
                partial,
                warning,
                ..
            } => Some((html.as_str(), *partial, warning.as_deref())),
            _ => None,
        })
        .expect("no message_complete event")
}

fn deltas(events: &[StreamEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ContentBlockDelta { delta } => Some(delta.text.as_str()),
            _ => None,
        })
        .collect()
}

fn streamed_text(events: &[StreamEvent]) -> String {
    deltas(events).concat()
}

fn model_ready_at(events: &[StreamEvent]) -> Option<usize> {
    events.iter().position(|e| {
        matches!(&e.payload, EventPayload::Status { message } if message == MODEL_READY)
    })
}

fn assert_framed(events: &[StreamEvent]) {
    assert_eq!(events.first().map(|e| e.event_type()), Some("stream_start"));
    assert_eq!(events.last().map(|e| e.event_type()), Some("stream_end"));
    assert_eq!(count(events, "stream_start"), 1);
    assert_eq!(count(events, "stream_end"), 1);
    assert_eq!(
        events.iter().filter(|e| e.payload.is_terminal()).count(),
        1,
        "exactly one terminal event expected: {:?}",
        types(events)
    );
}

#[tokio::test(start_paused = true)]
async fn test_three_chunks_assemble_into_document() {
    let mock = MockUpstream::new();
    mock.push(MockReply::chunks(["<html>", "<body>Hi</body>", "</html>"]));
    let request = request("Hello world");

    let (outcome, events) = run(&GenerationController::default(), &mock, &request).await;

    assert_framed(&events);
    assert!(model_ready_at(&events).is_some());
    let (html, partial, warning) = message_complete(&events);
    assert_eq!(html, "<html><body>Hi</body></html>");
    assert!(!partial);
    assert!(warning.is_none());
    assert_eq!(streamed_text(&events), html);

    let completion = outcome.unwrap().completion().cloned().unwrap();
    assert!(completion.usage.output_tokens > 0);
    assert_eq!(completion.strategy, Strategy::Stream);
    assert!(events.iter().all(|e| e.session_id == request.session_id));
}

#[tokio::test(start_paused = true)]
async fn test_overload_twice_then_success() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Fail(MockFailure::Overloaded));
    mock.push(MockReply::Fail(MockFailure::Overloaded));
    mock.push(MockReply::chunks(["<html>", "ok", "</html>"]));

    let (outcome, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(count(&events, "info"), 2);
    let last_info = events.iter().rposition(|e| e.event_type() == "info").unwrap();
    let complete = events
        .iter()
        .position(|e| e.event_type() == "message_complete")
        .unwrap();
    assert!(last_info < complete);
    assert_eq!(mock.calls().len(), 3);
    assert_eq!(
        outcome.unwrap().completion().unwrap().html,
        "<html>ok</html>"
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_stream_then_empty_fallback_fails() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![MockStep::Fail(MockFailure::Upstream)]));
    mock.push(MockReply::Complete(UpstreamResponse::empty()));

    let controller = controller_with(vec![Strategy::NonStreaming]);
    let (outcome, events) = run(&controller, &mock, &request("x")).await;

    assert_framed(&events);
    let kinds = types(&events);
    assert_eq!(kinds[kinds.len() - 2], "error");
    match &events[events.len() - 2].payload {
        EventPayload::Error { error, .. } => assert!(error.contains("All generation strategies failed")),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Status { message } if message == "Trying non-streaming fallback"
    )));

    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].streaming);
    assert!(!calls[1].streaming);
    assert!(matches!(
        outcome.unwrap(),
        GenerationOutcome::Failed(Error::Exhausted(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_partial_content_survives_late_failure() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![
        MockStep::Text("<html>".into()),
        MockStep::Text("<body>half".into()),
        MockStep::Fail(MockFailure::Overloaded),
    ]));

    let (_, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    let (html, partial, _) = message_complete(&events);
    assert_eq!(html, "<html><body>half");
    assert!(partial);
    assert_eq!(streamed_text(&events), html);
    // partial output is never retried
    assert_eq!(count(&events, "info"), 0);
    assert_eq!(mock.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_shared_and_bounded() {
    let mock = MockUpstream::new();
    mock.set_fallback(MockReply::Fail(MockFailure::Overloaded));

    let controller = controller_with(vec![Strategy::NonStreaming]);
    let (_, events) = run(&controller, &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(count(&events, "info"), 5);
    // 1 + 5 retries on the stream, then one call for the fallback step
    assert_eq!(mock.calls().len(), 7);
    assert_eq!(count(&events, "error"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_never_decrease() {
    let mock = MockUpstream::new();
    mock.set_fallback(MockReply::Fail(MockFailure::Overloaded));

    let (_, events) = run(&controller_with(Vec::new()), &mock, &request("x")).await;

    let delays: Vec<f64> = events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::Info {
                retry_in_seconds, ..
            } => Some(retry_in_seconds),
            _ => None,
        })
        .collect();
    assert_eq!(delays.len(), 5);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    assert!(delays[0] >= 1.0 && delays[0] <= 1.5);
    assert_eq!(mock.calls().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_cascade_reaches_placeholder() {
    let mock = MockUpstream::new();
    mock.set_fallback(MockReply::Fail(MockFailure::Upstream));
    let content = "<script>alert(1)</script> ".repeat(200);

    let (outcome, events) = run(&GenerationController::default(), &mock, &request(&content)).await;

    assert_framed(&events);
    let (html, _, warning) = message_complete(&events);
    assert!(html.contains(r#"data-fallback="true""#));
    assert!(html.contains("&lt;script&gt;"));
    assert!(warning.unwrap().contains("placeholder"));

    let calls = mock.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[2].params.max_output_tokens, 4_000);
    assert_eq!(calls[2].params.temperature, 0.5);
    assert!(calls[3].prompt.len() < calls[1].prompt.len());
    assert_eq!(
        outcome.unwrap().completion().unwrap().strategy,
        Strategy::Placeholder
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_success_reports_warning() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(Vec::new()));
    mock.push(MockReply::text("<html>fallback</html>"));

    let (_, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(count(&events, "content"), 1);
    let (html, partial, warning) = message_complete(&events);
    assert_eq!(html, "<html>fallback</html>");
    assert!(!partial);
    assert_eq!(warning, Some("Used non-streaming fallback"));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_error_stops_cascade() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Fail(MockFailure::Authentication));

    let (outcome, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(mock.calls().len(), 1);
    assert_eq!(count(&events, "message_complete"), 0);
    match &events[events.len() - 2].payload {
        EventPayload::Error { error, .. } => assert_eq!(error, "Authentication failed"),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(
        outcome.unwrap(),
        GenerationOutcome::Failed(Error::Authentication(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_while_upstream_is_quiet() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![
        MockStep::Delay(Duration::from_secs(12)),
        MockStep::Text("<html></html>".into()),
    ]));

    let (_, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(count(&events, "keepalive"), 2);
    let (html, _, _) = message_complete(&events);
    assert_eq!(html, "<html></html>");
}

#[tokio::test(start_paused = true)]
async fn test_flushes_reset_keepalive_timer() {
    // "a" goes out on the batch timer at 0.2s, "b" (5.1s) and "c" (10s) on
    // push; only a reset after each flush keeps the keepalive ahead of them
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![
        MockStep::Text("a".into()),
        MockStep::Delay(Duration::from_millis(5_100)),
        MockStep::Text("b".into()),
        MockStep::Delay(Duration::from_millis(4_900)),
        MockStep::Text("c".into()),
    ]));

    let (_, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert_eq!(deltas(&events), vec!["a", "b", "c"]);
    assert_eq!(count(&events, "keepalive"), 0, "{:?}", types(&events));
    let (html, _, _) = message_complete(&events);
    assert_eq!(html, "abc");
}

#[tokio::test(start_paused = true)]
async fn test_pending_fragment_flushed_during_silence() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![
        MockStep::Text("<html>".into()),
        MockStep::Delay(Duration::from_secs(2)),
        MockStep::Text("</html>".into()),
    ]));
    let request = request("x");
    let (sink, mut rx) = EventSink::channel(request.session_id, 64);
    let client = mock.connect(API_KEY).unwrap();
    let controller = GenerationController::default();
    let started = tokio::time::Instant::now();

    let drive = async move { controller.run(&request, client, &sink).await };
    let collect = async {
        let mut arrivals = Vec::new();
        while let Some(event) = rx.recv().await {
            if let EventPayload::ContentBlockDelta { delta } = &event.payload {
                arrivals.push((delta.text.clone(), started.elapsed()));
            }
        }
        arrivals
    };
    let (_, arrivals) = tokio::join!(drive, collect);

    assert_eq!(arrivals.len(), 2, "{:?}", arrivals);
    assert_eq!(arrivals[0].0, "<html>");
    assert!(arrivals[0].1 < Duration::from_secs(1), "{:?}", arrivals);
    assert_eq!(arrivals[1].0, "</html>");
    assert!(arrivals[1].1 >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_moves_to_next_step() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(vec![
        MockStep::Delay(Duration::from_secs(120)),
        MockStep::Text("too late".into()),
    ]));
    mock.push(MockReply::text("<html>quick</html>"));

    let (outcome, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    let (html, _, warning) = message_complete(&events);
    assert_eq!(html, "<html>quick</html>");
    assert_eq!(warning, Some("Used non-streaming fallback"));
    // the first attempt used the full 85s budget
    assert!(count(&events, "keepalive") >= 16);
    assert!(outcome.unwrap().completion().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_client_starts_blocking() {
    let mock = MockUpstream::with_capabilities(Capabilities {
        streaming: false,
        reports_usage: false,
    });
    mock.push(MockReply::text("<html>direct</html>"));

    let (_, events) = run(&GenerationController::default(), &mock, &request("x")).await;

    assert_framed(&events);
    assert!(!mock.calls()[0].streaming);
    let (html, _, warning) = message_complete(&events);
    assert_eq!(html, "<html>direct</html>");
    assert!(warning.is_none());

    // same status sequence as a streamed run
    let ready = model_ready_at(&events).expect("no model-ready status");
    let content = events
        .iter()
        .position(|e| e.event_type() == "content")
        .unwrap();
    assert!(ready < content);
}

#[tokio::test(start_paused = true)]
async fn test_identical_runs_yield_identical_events() {
    fn normalized(events: Vec<StreamEvent>) -> Vec<EventPayload> {
        events
            .into_iter()
            .map(|e| match e.payload {
                EventPayload::MessageComplete {
                    message,
                    html,
                    mut usage,
                    partial,
                    warning,
                } => {
                    usage.processing_time = 0.0;
                    EventPayload::MessageComplete {
                        message,
                        html,
                        usage,
                        partial,
                        warning,
                    }
                }
                other => other,
            })
            .collect()
    }

    let controller = GenerationController::default();
    let script = MockReply::chunks(["<html>", "<p>same</p>", "</html>", "<!-- end -->"]);

    let first = MockUpstream::new();
    first.push(script.clone());
    let (_, a) = run(&controller, &first, &request("same input")).await;

    let second = MockUpstream::new();
    second.push(script);
    let (_, b) = run(&controller, &second, &request("same input")).await;

    assert_ne!(a[0].session_id, b[0].session_id);
    assert_eq!(normalized(a), normalized(b));
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_cancels_run() {
    let mock = MockUpstream::new();
    mock.push(MockReply::Stream(
        (0..50)
            .flat_map(|i| {
                [
                    MockStep::Delay(Duration::from_secs(1)),
                    MockStep::Text(format!("<p>{}</p>", i)),
                ]
            })
            .collect(),
    ));
    let request = request("x");
    let (sink, mut rx) = EventSink::channel(request.session_id, 1);
    let client = mock.connect(API_KEY).unwrap();
    let controller = GenerationController::default();

    let drive = controller.run(&request, client, &sink);
    let consume = async move {
        let mut seen = 0;
        while let Some(event) = rx.recv().await {
            seen += 1;
            if event.event_type() == "content_block_delta" {
                break;
            }
        }
        drop(rx);
        seen
    };

    let (result, seen) = tokio::join!(drive, consume);
    assert!(seen >= 1);
    assert!(matches!(result, Err(Error::Cancelled)));
}
