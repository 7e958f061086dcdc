use chrono::{Duration, Utc};

use taskweave::memory::{LongTermMemory, SessionMemory, ShortTermMemory};
use taskweave::plan::Plan;
use taskweave::task::{Turn, TurnRole, WorkflowRecord, WorkflowStatus, WorkflowTimings};

fn record(task_id: &str, text: &str) -> WorkflowRecord {
    WorkflowRecord {
        task_id: task_id.to_string(),
        task_text: text.to_string(),
        status: WorkflowStatus::Ok,
        plan: Plan::empty(),
        results: Vec::new(),
        aggregated: format!("aggregated output for {}", text),
        timings: WorkflowTimings::default(),
        completed_at: Utc::now(),
    }
}

#[test]
fn test_short_term_window_evicts_oldest() {
    let mut memory = ShortTermMemory::new(3);
    for i in 0..5 {
        memory.append(Turn::user(format!("turn {}", i)));
    }
    let turns = memory.as_messages();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].text, "turn 2");
    assert_eq!(turns[2].text, "turn 4");

    memory.clear();
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_session_history_keeps_pair_order() {
    let sessions = SessionMemory::ephemeral(20);
    for i in 0..3 {
        sessions.append("x", Turn::user(format!("question {}", i))).await;
        sessions
            .append("x", Turn::assistant(format!("answer {}", i)))
            .await;
    }

    let history = sessions.history("x").await;
    assert_eq!(history.len(), 6);
    for i in 0..3 {
        assert_eq!(history[2 * i].role, TurnRole::User);
        assert_eq!(history[2 * i].text, format!("question {}", i));
        assert_eq!(history[2 * i + 1].role, TurnRole::Assistant);
        assert_eq!(history[2 * i + 1].text, format!("answer {}", i));
    }

    // Sessions are isolated.
    assert!(sessions.history("y").await.is_empty());
}

#[tokio::test]
async fn test_store_search_and_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let memory = LongTermMemory::open(dir.path()).unwrap();

    memory.store(record("t1", "build the parser")).await.unwrap();
    memory.store(record("t2", "deploy the service")).await.unwrap();

    let hits = memory.search("parser", 10).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].task_id, "t1");

    assert!(memory.find_by_task_id("t2").await.is_some());
    assert!(memory.find_by_task_id("t9").await.is_none());

    // Records reload from the current month's file.
    let reopened = LongTermMemory::open(dir.path()).unwrap();
    assert_eq!(reopened.resident_count().await, 2);
}

#[tokio::test]
async fn test_month_rollover_archives_and_shrinks() {
    let dir = tempfile::tempdir().unwrap();
    let memory = LongTermMemory::open(dir.path()).unwrap();
    memory.store(record("t1", "one")).await.unwrap();
    memory.store(record("t2", "two")).await.unwrap();
    assert_eq!(memory.resident_count().await, 2);

    memory.rotate(Utc::now() + Duration::days(40)).await.unwrap();

    assert_eq!(memory.resident_count().await, 0);
    let archives: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("archive"))
        .collect();
    assert_eq!(archives.len(), 1);
    let content = std::fs::read_to_string(archives[0].path()).unwrap();
    assert_eq!(content.lines().count(), 2);
}

#[tokio::test]
async fn test_resident_cap_spills_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let memory = LongTermMemory::open(dir.path()).unwrap().with_resident_cap(3);

    for i in 0..5 {
        memory
            .store(record(&format!("t{}", i), &format!("task {}", i)))
            .await
            .unwrap();
    }

    assert_eq!(memory.resident_count().await, 3);
    // The oldest two fell out of memory.
    assert!(memory.find_by_task_id("t0").await.is_none());
    assert!(memory.find_by_task_id("t4").await.is_some());
}
