//! End-to-end turn scenarios over the full runtime with a scripted LLM
//! and an in-memory pantry backend.

mod support;

use support::{drain_events, percentages, record, FakePantry, ScriptedLlm};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use larder::agent::AgentRuntime;
use larder::session::SessionStore;
use larder::stream::ProgressHub;
use larder::tools::{ToolRegistry, ToolTransport};

fn runtime(llm: Arc<ScriptedLlm>, pantry: Arc<FakePantry>) -> Arc<AgentRuntime> {
    let registry = Arc::new(ToolRegistry::new(
        Arc::clone(&pantry) as Arc<dyn ToolTransport>,
        pantry as Arc<dyn ToolTransport>,
        None,
    ));
    Arc::new(AgentRuntime::new(
        registry,
        llm,
        Arc::new(Mutex::new(SessionStore::new(Duration::from_secs(1800)))),
        Arc::new(ProgressHub::new()),
        Duration::from_secs(300),
        4,
    ))
}

// ── S1: greeting, no tools ──

#[tokio::test]
async fn greeting_produces_no_tool_activity() {
    let llm = ScriptedLlm::new(vec![r#"{"tasks":[]}"#]);
    let pantry = FakePantry::new(vec![record("milk", 10)]);
    let agent = runtime(llm, Arc::clone(&pantry));

    let mut rx = agent.hub().subscribe("sse-greet");
    let reply = agent
        .process_message("user-1", "tok", "hello", Some("sse-greet".to_owned()))
        .await;

    assert!(!reply.confirmation_required);
    assert!(!reply.response.is_empty());

    // An empty plan emits no progress events at all.
    assert!(drain_events(&mut rx).is_empty());

    // Only the snapshot listing ran; no mutations, no history entry.
    assert_eq!(pantry.invocations(), vec!["inventory_list"]);
    let sessions = agent.sessions();
    let store = sessions.lock().await;
    assert!(store
        .get("user-1")
        .expect("session exists")
        .operation_history
        .is_empty());
}

// ── S2: single write ──

#[tokio::test]
async fn single_write_confirms_and_streams_to_completion() {
    let plan = r#"{"tasks":[{
        "description": "Add a carton of milk to the fridge",
        "tool": "inventory_add",
        "parameters": {"item_name": "milk", "quantity": 1, "unit": "carton", "storage_location": "fridge"}
    }]}"#;
    let llm = ScriptedLlm::new(vec![plan]);
    let pantry = FakePantry::new(Vec::new());
    let agent = runtime(llm, Arc::clone(&pantry));

    let mut rx = agent.hub().subscribe("sse-s2");
    let reply = agent
        .process_message(
            "user-1",
            "tok",
            "I bought one carton of milk, put it in the fridge.",
            Some("sse-s2".to_owned()),
        )
        .await;

    assert!(!reply.confirmation_required);
    assert_eq!(pantry.names(), vec!["milk"]);

    let events = drain_events(&mut rx);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e["type"].as_str().expect("typed event"))
        .collect();
    assert_eq!(kinds.first(), Some(&"start"));
    assert_eq!(kinds.last(), Some(&"complete"));
    assert!(kinds.contains(&"progress"));

    let full = events
        .iter()
        .find(|e| e["progress"]["progress_percentage"] == 100)
        .expect("progress reaches 100%");
    assert_eq!(full["progress"]["total_tasks"], 1);
}

// ── S3: parallel writes + read + compute ──

#[tokio::test]
async fn parallel_adds_feed_menu_generation() {
    let plan = r#"{"tasks":[
        {"description": "Add a pack of beef shank", "tool": "inventory_add",
         "parameters": {"item_name": "beef shank", "quantity": 1}},
        {"description": "Add three carrots", "tool": "inventory_add",
         "parameters": {"item_name": "carrot", "quantity": 3}},
        {"description": "List the updated inventory", "tool": "inventory_list",
         "parameters": {},
         "dependencies": ["Add a pack of beef shank", "Add three carrots"]},
        {"description": "Generate a menu from stock", "tool": "generate_menu_plan_with_history",
         "parameters": {"inventory": {"from_task": "task_2", "path": ""}},
         "dependencies": ["List the updated inventory"]}
    ]}"#;
    let llm = ScriptedLlm::new(vec![plan]).echo_compose();
    let pantry = FakePantry::new(Vec::new());
    let agent = runtime(llm, Arc::clone(&pantry));

    let mut rx = agent.hub().subscribe("sse-s3");
    let reply = agent
        .process_message(
            "user-1",
            "tok",
            "Add one pack of beef-shank and three carrots, then give me a menu using what's in stock.",
            Some("sse-s3".to_owned()),
        )
        .await;

    assert!(!reply.confirmation_required);
    let mut names = pantry.names();
    names.sort();
    assert_eq!(names, vec!["beef shank", "carrot"]);

    // The two adds overlapped in flight.
    assert!(
        pantry.max_in_flight() >= 2,
        "independent adds should dispatch in parallel"
    );

    // The menu step saw the committed listing with both items.
    let menu_input = pantry
        .arguments_for("generate_menu_plan_with_history")
        .pop()
        .expect("menu tool invoked");
    let injected = menu_input["inventory"]
        .as_array()
        .expect("listing injected as an array");
    assert_eq!(injected.len(), 2);

    // Progress percentage strictly increases over its distinct values.
    let events = drain_events(&mut rx);
    let distinct = percentages(&events);
    assert!(
        distinct.windows(2).all(|w| w[0] < w[1]),
        "distinct percentages must strictly increase: {distinct:?}"
    );
    assert_eq!(distinct.last(), Some(&100));

    // Monotone completed counts, bounded by total.
    let mut last = 0u64;
    for event in &events {
        let completed = event["progress"]["completed_tasks"].as_u64().expect("count");
        assert!(completed >= last && completed <= 4);
        last = completed;
    }

    // The composed reply was grounded in the generated menu.
    assert!(reply.response.contains("braised beef shank with carrots"));
}

// ── S4: ambiguity → oldest → resume ──

#[tokio::test]
async fn ambiguous_delete_resumes_with_oldest_and_runs_downstream() {
    let plan = r#"{"tasks":[
        {"description": "Delete the milk", "tool": "inventory_delete_by_name",
         "parameters": {"item_name": "milk"}},
        {"description": "Suggest a menu", "tool": "generate_menu_plan_with_history",
         "parameters": {}, "dependencies": ["Delete the milk"]},
        {"description": "Find recipes", "tool": "search_recipe_from_web",
         "parameters": {"titles": {"from_task": "task_1", "path": "data.main"}},
         "dependencies": ["Suggest a menu"]}
    ]}"#;
    let llm = ScriptedLlm::new(vec![plan]).echo_compose();
    let pantry = FakePantry::new(vec![record("milk", 30), record("milk", 20), record("milk", 10)]);
    let agent = runtime(llm, Arc::clone(&pantry));
    let oldest_id = pantry.oldest_id("milk").expect("milk present");

    // Turn 1: plan suspends on the name-scoped delete.
    let reply = agent
        .process_message(
            "user-1",
            "tok",
            "delete the milk, then suggest a menu and recipes.",
            None,
        )
        .await;

    assert!(reply.confirmation_required);
    let context = reply.confirmation_context.expect("context returned");
    assert_eq!(context.candidate_items.len(), 3);
    let option_values: Vec<&str> = context.options.iter().map(|o| o.value.as_str()).collect();
    assert_eq!(option_values, vec!["oldest", "latest", "all", "cancel"]);
    assert!(reply.response.contains("3 matching record(s)"));
    assert_eq!(pantry.names().len(), 3, "suspension mutates nothing");

    // Turn 2: the user picks the oldest.
    let reply = agent
        .process_confirmation("user-1", "tok", "delete the old one", None)
        .await;

    assert!(!reply.confirmation_required);
    assert_eq!(pantry.names().len(), 2, "exactly one record removed");
    assert!(
        !pantry.ids().contains(&oldest_id),
        "the oldest record is the one removed"
    );

    // Downstream menu and recipe steps ran and reached the reply.
    assert!(pantry
        .invocations()
        .contains(&"generate_menu_plan_with_history".to_owned()));
    assert!(pantry
        .invocations()
        .contains(&"search_recipe_from_web".to_owned()));
    assert!(reply.response.contains("braised beef shank with carrots"));
    assert!(reply.response.contains("https://recipes.example/"));
}

// ── S5: ambiguity → cancel ──

#[tokio::test]
async fn cancel_reply_skips_remaining_without_mutation() {
    let plan = r#"{"tasks":[
        {"description": "Delete the milk", "tool": "inventory_delete_by_name",
         "parameters": {"item_name": "milk"}},
        {"description": "Suggest a menu", "tool": "generate_menu_plan_with_history",
         "parameters": {}, "dependencies": ["Delete the milk"]}
    ]}"#;
    let llm = ScriptedLlm::new(vec![plan]);
    let pantry = FakePantry::new(vec![record("milk", 30), record("milk", 20), record("milk", 10)]);
    let agent = runtime(llm, Arc::clone(&pantry));

    let reply = agent
        .process_message("user-1", "tok", "delete the milk, then suggest a menu and recipes.", None)
        .await;
    assert!(reply.confirmation_required);

    let mut rx = agent.hub().subscribe("sse-s5");
    let reply = agent
        .process_confirmation("user-1", "tok", "cancel.", Some("sse-s5".to_owned()))
        .await;

    assert!(!reply.confirmation_required);
    assert!(reply.response.contains("cancelled"));
    assert_eq!(pantry.names().len(), 3, "no inventory mutation after cancel");
    assert!(
        !pantry.invocations().iter().any(|t| t.starts_with("inventory_delete")),
        "no delete tool was ever invoked"
    );

    let events = drain_events(&mut rx);
    assert_eq!(
        events.last().expect("events emitted")["type"],
        "complete",
        "cancellation still closes the stream with a complete event"
    );
}

// ── S6: tool failure with fallback ──

#[tokio::test]
async fn fallback_absorbs_primary_failure_without_error_events() {
    let plan = r#"{"tasks":[{
        "description": "Generate a menu from stock",
        "tool": "generate_menu_plan_with_history",
        "parameters": {},
        "max_retries": 2,
        "fallback_tool": "search_menu_from_rag_with_history"
    }]}"#;
    let llm = ScriptedLlm::new(vec![plan]).echo_compose();
    let pantry = FakePantry::new(vec![record("carrot", 5)]).failing_tool("generate_menu_plan_with_history");
    let agent = runtime(llm, Arc::clone(&pantry));

    let mut rx = agent.hub().subscribe("sse-s6");
    let reply = agent
        .process_message(
            "user-1",
            "tok",
            "give me a menu from what I have",
            Some("sse-s6".to_owned()),
        )
        .await;

    // Primary attempted 1 + 2 retries, then the fallback succeeded.
    let primary_calls = pantry
        .invocations()
        .iter()
        .filter(|t| *t == "generate_menu_plan_with_history")
        .count();
    assert_eq!(primary_calls, 3);
    assert!(pantry
        .invocations()
        .contains(&"search_menu_from_rag_with_history".to_owned()));

    let events = drain_events(&mut rx);
    assert!(
        events.iter().all(|e| e["type"] != "error"),
        "the fallback absorbed the failure; no error event"
    );
    let complete = events.last().expect("events emitted");
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["progress"]["progress_percentage"], 100);

    // The fallback's result is what reaches the composer.
    assert!(reply.response.contains("roasted root vegetables"));
}

// ── S7: parallel menu proposals ──

#[tokio::test]
async fn parallel_proposals_render_side_by_side() {
    let plan = r#"{"tasks":[
        {"description": "Chef menu proposal", "tool": "generate_menu_plan_with_history",
         "parameters": {}},
        {"description": "Retrieval menu proposal", "tool": "search_menu_from_rag_with_history",
         "parameters": {}},
        {"description": "Look up recipe links", "tool": "search_recipe_from_web",
         "parameters": {
            "chef_title": {"from_task": "task_0", "path": "data.main"},
            "retrieval_title": {"from_task": "task_1", "path": "data.main"}
         },
         "dependencies": ["Chef menu proposal", "Retrieval menu proposal"]}
    ]}"#;
    let llm = ScriptedLlm::new(vec![plan]);
    let pantry = FakePantry::new(vec![record("beef shank", 20), record("carrot", 10)]);
    let agent = runtime(llm, Arc::clone(&pantry));

    let reply = agent
        .process_message("user-1", "tok", "recipes for what I have in stock.", None)
        .await;

    assert!(!reply.confirmation_required);

    // Both proposal tools ran before the lookup that references them.
    let calls = pantry.invocations();
    let lookup_pos = calls
        .iter()
        .position(|t| t == "search_recipe_from_web")
        .expect("lookup ran");
    for proposal in [
        "generate_menu_plan_with_history",
        "search_menu_from_rag_with_history",
    ] {
        let pos = calls
            .iter()
            .position(|t| t == proposal)
            .unwrap_or_else(|| panic!("{proposal} ran"));
        assert!(pos < lookup_pos, "{proposal} must precede the lookup");
    }
    assert!(pantry.max_in_flight() >= 2, "proposals dispatched concurrently");

    // The lookup received references to both proposals.
    let lookup_args = pantry
        .arguments_for("search_recipe_from_web")
        .pop()
        .expect("lookup arguments recorded");
    assert_eq!(lookup_args["chef_title"], "braised beef shank with carrots");
    assert_eq!(lookup_args["retrieval_title"], "hearty carrot and beef soup");

    // Both proposals appear side by side with distinct recipe URLs.
    assert!(reply.response.contains("Chef's proposal:"));
    assert!(reply.response.contains("From the recipe collection:"));
    assert!(reply.response.contains("braised beef shank with carrots"));
    assert!(reply.response.contains("hearty carrot and beef soup"));
    let url_count = reply.response.matches("https://recipes.example/").count();
    assert!(url_count >= 2, "two distinct recipe links rendered");
}
