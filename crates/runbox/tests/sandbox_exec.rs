//! End-to-end execution tests against a real interpreter.
//!
//! These spawn the `python3` found on PATH.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use runbox::{
    ClaimedJob, EventSink, FileEncoding, OutputStream, RunFile, RunnerEvent, SandboxConfig,
    execute_job,
};

/// Sink that records every event it sees.
#[derive(Default)]
struct CollectSink {
    events: Mutex<Vec<RunnerEvent>>,
}

#[async_trait]
impl EventSink for CollectSink {
    async fn event(&self, _job_id: &str, event: RunnerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CollectSink {
    fn events(&self) -> Vec<RunnerEvent> {
        self.events.lock().unwrap().clone()
    }

    fn stdout(&self) -> String {
        self.events()
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::Chunk {
                    stream: OutputStream::Stdout,
                    chunk,
                } => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    fn terminal(&self) -> Option<RunnerEvent> {
        self.events().into_iter().find(|event| {
            matches!(
                event,
                RunnerEvent::Completed { .. } | RunnerEvent::Failed { .. }
            )
        })
    }
}

fn job(files: &[(&str, &str)], entry: &str, timeout_ms: u64) -> ClaimedJob {
    ClaimedJob {
        job_id: "test-job".to_string(),
        protocol_version: 2,
        language: "python".to_string(),
        files: files
            .iter()
            .map(|(path, content)| RunFile {
                path: (*path).to_string(),
                content: (*content).to_string(),
                encoding: FileEncoding::Utf8,
            })
            .collect(),
        entry_path: entry.to_string(),
        timeout_ms,
        created_at: 0,
    }
}

#[tokio::test]
async fn hello_world_completes_with_stdout() {
    let sink = Arc::new(CollectSink::default());
    let job = job(&[("main.py", "print('hi')")], "main.py", 10_000);

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    assert!(matches!(sink.terminal(), Some(RunnerEvent::Completed { .. })));
    assert_eq!(sink.stdout(), "hi\n");
    assert!(matches!(sink.events()[0], RunnerEvent::Started { .. }));
}

#[tokio::test]
async fn infinite_loop_is_killed_at_the_deadline() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[("main.py", "while True:\n    pass\n")],
        "main.py",
        1_000,
    );

    let started = Instant::now();
    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // deadline plus bounded slack for kill and teardown
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    match sink.terminal() {
        Some(RunnerEvent::Failed { error, .. }) => {
            assert!(error.contains("timed out"), "error was {error:?}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_fails_with_the_code() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[("main.py", "import sys\nsys.exit(3)\n")],
        "main.py",
        10_000,
    );

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    match sink.terminal() {
        Some(RunnerEvent::Failed { error, .. }) => {
            assert!(error.contains("code 3"), "error was {error:?}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn stderr_is_streamed_separately() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[(
            "main.py",
            "import sys\nsys.stderr.write('oops\\n')\nprint('ok')\n",
        )],
        "main.py",
        10_000,
    );

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    let stderr: String = sink
        .events()
        .iter()
        .filter_map(|event| match event {
            RunnerEvent::Chunk {
                stream: OutputStream::Stderr,
                chunk,
            } => Some(chunk.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(stderr, "oops\n");
    assert_eq!(sink.stdout(), "ok\n");
}

#[tokio::test]
async fn missing_interpreter_fails_immediately() {
    let sink = Arc::new(CollectSink::default());
    let job = job(&[("main.py", "print('hi')")], "main.py", 10_000);
    let config = SandboxConfig {
        python_bin: "definitely-not-a-python-binary".to_string(),
    };

    let result = execute_job(&job, sink.clone(), None, &config).await;

    assert!(result.is_err());
    assert!(matches!(sink.terminal(), Some(RunnerEvent::Failed { .. })));
}

#[tokio::test]
async fn traversal_path_in_a_claim_is_refused_before_any_write() {
    let sink = Arc::new(CollectSink::default());
    let mut claimed = job(&[("main.py", "print('hi')")], "main.py", 10_000);
    claimed.files.push(RunFile {
        path: "../evil.py".to_string(),
        content: String::new(),
        encoding: FileEncoding::Utf8,
    });

    let result = execute_job(&claimed, sink.clone(), None, &SandboxConfig::default()).await;

    assert!(result.is_err());
    // refused before start: the only event is the failure report
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], RunnerEvent::Failed { .. }));
}

#[tokio::test]
async fn nested_files_and_helpers_are_materialized() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[
            (
                "main.py",
                "import os\nfrom pkg.util import VALUE\nprint(VALUE)\nprint(os.path.exists('runbox_capture.py'))\n",
            ),
            ("pkg/__init__.py", ""),
            ("pkg/util.py", "VALUE = 42\n"),
        ],
        "main.py",
        10_000,
    );

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    assert!(matches!(sink.terminal(), Some(RunnerEvent::Completed { .. })));
    assert_eq!(sink.stdout(), "42\nTrue\n");
}

#[tokio::test]
async fn visualization_frames_reach_the_sink() {
    let sink = Arc::new(CollectSink::default());
    // write a frame payload the way the capture helper does
    let program = r#"
import json, os, time
viz_dir = os.environ["RUNBOX_VIZ_DIR"]
tmp = os.path.join(viz_dir, "frame.json.tmp")
with open(tmp, "w") as f:
    json.dump({"type": "frame", "width": 2, "height": 1, "format": "RGB",
               "data": "AAAAAAAA", "timestamp": 1.0}, f)
os.replace(tmp, tmp[:-4])
time.sleep(0.2)
"#;
    let job = job(&[("main.py", program)], "main.py", 10_000);

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    let frames: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, RunnerEvent::Visualization { .. }))
        .collect();
    assert_eq!(frames.len(), 1, "frame delivered exactly once");
}

#[tokio::test]
async fn workspace_is_removed_after_the_run() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[("main.py", "import os\nprint(os.getcwd())\n")],
        "main.py",
        10_000,
    );

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    let workspace = sink.stdout().trim().to_string();
    assert!(!workspace.is_empty());
    assert!(
        !std::path::Path::new(&workspace).exists(),
        "workspace {workspace} should be gone"
    );
}

#[tokio::test]
async fn workspace_is_removed_after_a_timeout_kill() {
    let sink = Arc::new(CollectSink::default());
    let job = job(
        &[(
            "main.py",
            "import os, sys\nprint(os.getcwd())\nsys.stdout.flush()\nwhile True:\n    pass\n",
        )],
        "main.py",
        1_000,
    );

    execute_job(&job, sink.clone(), None, &SandboxConfig::default())
        .await
        .unwrap();

    let workspace = sink.stdout().trim().to_string();
    assert!(!workspace.is_empty());
    assert!(!std::path::Path::new(&workspace).exists());
}
