//! End-to-end reconciliation: adapter output through the pipeline into the log

use agent_stream::config::{EngineConfig, LogConfig};
use agent_stream::event::{Event, Role};
use agent_stream::infra::{extract, reinsert};
use agent_stream::session::{AppendOutcome, SessionEventLog, StreamPipeline};
use agent_stream::Backend;

fn claude_pipeline(cwd: &std::path::Path) -> StreamPipeline {
    let mut pipeline = StreamPipeline::new(Backend::Claude, cwd, &EngineConfig::default());
    pipeline.begin_turn("turn-1");
    pipeline
}

fn feed_lines(pipeline: &mut StreamPipeline, lines: &[&str]) -> Vec<Event> {
    let mut events = Vec::new();
    for line in lines {
        events.extend(pipeline.feed(format!("{}\n", line).as_bytes()));
    }
    events
}

fn complete(id: &str, text: &str, ts: i64) -> Event {
    Event::AssistantComplete {
        id: id.into(),
        text: text.into(),
        interrupted: false,
        timestamp: ts,
    }
}

fn delta(id: &str, chunk: &str, ts: i64) -> Event {
    Event::AssistantDelta {
        id: id.into(),
        chunk: chunk.into(),
        timestamp: ts,
    }
}

#[test]
fn test_streamed_deltas_collapse_into_one_message() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let events = feed_lines(
        &mut pipeline,
        &[
            r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m1"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}"#,
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}"#,
        ],
    );

    let mut log = SessionEventLog::default();
    for event in events {
        log.append(event);
    }
    let messages: Vec<_> = log.messages().collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].text, "Hello");
    assert!(!messages[0].streaming);
}

#[test]
fn test_repeated_completion_leaves_log_unchanged() {
    let mut log = SessionEventLog::default();
    assert_eq!(log.append(complete("m1", "Hi", 1)), AppendOutcome::Inserted);
    let len = log.len();
    assert_eq!(log.append(complete("m1", "Hi", 2)), AppendOutcome::Discarded);
    assert_eq!(log.len(), len);
    assert_eq!(log.message_count(), 1);
}

#[test]
fn test_destructive_bash_checkpoint_precedes_tool_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let events = feed_lines(
        &mut pipeline,
        &[r#"{"type":"assistant","message":{"id":"m2","content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"rm -rf build"}}]}}"#],
    );

    let mut log = SessionEventLog::default();
    for event in events {
        log.append(event);
    }
    let snapshot = log.snapshot();
    let checkpoint = snapshot
        .iter()
        .position(|e| matches!(e, Event::CheckpointCreate { file_snapshots, .. } if file_snapshots.is_empty()))
        .expect("marker checkpoint");
    let start = snapshot
        .iter()
        .position(|e| matches!(e, Event::ToolStart { id, .. } if id == "toolu_1"))
        .expect("tool start");
    assert!(checkpoint < start);
    assert_eq!(log.checkpoints().len(), 1);
    assert_eq!(log.checkpoints()[0].file_count, 0);
}

#[test]
fn test_write_to_missing_file_snapshots_empty_content() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let events = feed_lines(
        &mut pipeline,
        &[r#"{"type":"assistant","message":{"id":"m3","content":[{"type":"tool_use","id":"toolu_2","name":"Write","input":{"path":"a.txt","content":"new"}}]}}"#],
    );

    let snapshots = events
        .iter()
        .find_map(|e| match e {
            Event::CheckpointCreate { file_snapshots, .. } => Some(file_snapshots.clone()),
            _ => None,
        })
        .expect("checkpoint");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].path, "a.txt");
    assert_eq!(snapshots[0].original_content, "");
}

#[test]
fn test_write_to_existing_file_captures_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.txt"), "old").unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let events = feed_lines(
        &mut pipeline,
        &[r#"{"type":"assistant","message":{"id":"m3","content":[{"type":"tool_use","id":"toolu_3","name":"Edit","input":{"file_path":"b.txt","old_string":"old","new_string":"new"}}]}}"#],
    );
    let snapshot = events
        .iter()
        .find_map(|e| match e {
            Event::CheckpointCreate { file_snapshots, .. } => file_snapshots.first().cloned(),
            _ => None,
        })
        .expect("checkpoint");
    assert_eq!(snapshot.original_content, "old");
}

#[test]
fn test_duplicate_completions_yield_one_message_per_id() {
    let mut log = SessionEventLog::default();
    let ids = ["a", "b", "c"];
    for (i, id) in ids.iter().enumerate() {
        let ts = i as i64 * 10;
        log.append(Event::user_message(format!("u-{}", id), "go", ts));
        log.append(complete(id, &format!("reply {}", id), ts + 1));
        log.append(complete(id, &format!("reply {}", id), ts + 2));
    }
    for id in ids {
        let count = log.messages().filter(|m| m.id == id).count();
        assert_eq!(count, 1, "message {}", id);
    }
}

#[test]
fn test_final_text_is_completion_or_concatenated_deltas() {
    let chunks = ["The ", "quick ", "fox"];

    let mut log = SessionEventLog::default();
    for (i, chunk) in chunks.iter().enumerate() {
        log.append(delta("m1", chunk, i as i64));
    }
    log.append(complete("m1", "The quick brown fox", 10));
    assert_eq!(log.message("m1").unwrap().text, "The quick brown fox");

    let mut log = SessionEventLog::default();
    for (i, chunk) in chunks.iter().enumerate() {
        log.append(delta("m2", chunk, i as i64));
    }
    log.append(complete("m2", "", 10));
    assert_eq!(log.message("m2").unwrap().text, "The quick fox");
}

#[test]
fn test_tool_output_never_precedes_its_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let events = feed_lines(
        &mut pipeline,
        &[
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_9","content":"early"}]}}"#,
            r#"{"type":"assistant","message":{"id":"m4","content":[{"type":"tool_use","id":"toolu_9","name":"Read","input":{"file_path":"x"}}]}}"#,
            r#"{"type":"assistant","message":{"id":"m5","content":[{"type":"tool_use","id":"toolu_10","name":"Grep","input":{"pattern":"y"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_10","content":"hit"}]}}"#,
        ],
    );

    let mut log = SessionEventLog::default();
    for event in events {
        log.append(event);
    }
    let snapshot = log.snapshot();
    for tool_id in ["toolu_9", "toolu_10"] {
        let start = snapshot
            .iter()
            .position(|e| matches!(e, Event::ToolStart { id, .. } if id == tool_id))
            .unwrap();
        for (pos, event) in snapshot.iter().enumerate() {
            if let Event::ToolOutput { id, .. } = event {
                if id == tool_id {
                    assert!(pos > start, "{} output before start", tool_id);
                }
            }
        }
    }
    assert_eq!(log.tool_run("toolu_9").unwrap().output, "early");
}

#[test]
fn test_log_stays_within_cap() {
    let cap = 20;
    let mut log = SessionEventLog::new(LogConfig {
        max_events: cap,
        ..LogConfig::default()
    });
    for i in 0..200i64 {
        let id = format!("m{}", i / 4);
        match i % 4 {
            0 => log.append(Event::user_message(format!("u{}", i), "q", i)),
            1 | 2 => log.append(delta(&id, "part ", i)),
            _ => log.append(complete(&id, "part part done", i)),
        };
        assert!(log.snapshot().len() <= cap);
    }

    // the oldest surviving assistant message is whole, never a fragment
    let oldest = log
        .messages()
        .find(|m| m.role == Role::Assistant)
        .expect("assistant message retained");
    assert_eq!(oldest.text, "part part done");
}

#[test]
fn test_telemetry_block_round_trip() {
    let block = "{\n  \"attributes\": {\n    \"event.name\": \"gemini_cli.api_response\",\n    \"input_token_count\": 12,\n    \"output_token_count\": 3\n  }\n}";
    let text = format!("Looking at the file now.\n{}\nAll set {{ok}}.\n", block);
    let extraction = extract(&text);
    assert_eq!(extraction.blocks.len(), 1);
    assert!(!extraction.prose.contains("event.name"));
    assert_eq!(reinsert(&extraction.prose, &extraction.blocks), text);
}

#[test]
fn test_usage_totals_accumulate_across_turns() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = claude_pipeline(dir.path());
    let result = r#"{"type":"result","subtype":"success","result":"ok","total_cost_usd":0.5,"usage":{"input_tokens":10,"output_tokens":2}}"#;

    let mut log = SessionEventLog::default();
    for event in feed_lines(&mut pipeline, &[result]) {
        log.append(event);
    }
    pipeline.begin_turn("turn-2");
    for event in feed_lines(&mut pipeline, &[result]) {
        log.append(event);
    }

    assert_eq!(log.usage().tokens_in, 20);
    assert_eq!(log.usage().tokens_out, 4);
    assert!((log.usage().usd - 1.0).abs() < 1e-9);
}
