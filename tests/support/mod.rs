//! Shared test doubles: a scripted LLM and an in-memory pantry backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use larder::llm::{LlmClient, LlmError};
use larder::tools::{ToolError, ToolSpec, ToolTransport};

/// LLM fake with a queue of planning replies.
///
/// `compose` returns a fixed string by default; [`echo_compose`] switches
/// it to echoing the prompt, which lets tests assert that task results
/// actually reached the composer.
pub struct ScriptedLlm {
    plans: Mutex<Vec<String>>,
    echo: AtomicBool,
}

impl ScriptedLlm {
    pub fn new(plans: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().map(str::to_owned).collect()),
            echo: AtomicBool::new(false),
        })
    }

    /// Make `compose` echo its prompt back.
    pub fn echo_compose(self: Arc<Self>) -> Arc<Self> {
        self.echo.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn plan(&self, _prompt: &str) -> Result<String, LlmError> {
        let mut plans = self.plans.lock().expect("test lock");
        if plans.is_empty() {
            Ok(r#"{"tasks":[]}"#.to_owned())
        } else {
            Ok(plans.remove(0))
        }
    }

    async fn compose(&self, prompt: &str) -> Result<String, LlmError> {
        if self.echo.load(Ordering::SeqCst) {
            Ok(prompt.to_owned())
        } else {
            Ok("composed reply".to_owned())
        }
    }
}

/// One inventory record as the backend would store it.
pub fn record(name: &str, minutes_ago: i64) -> serde_json::Value {
    let created = Utc::now()
        .checked_sub_signed(chrono::TimeDelta::minutes(minutes_ago))
        .expect("test timestamps in range");
    serde_json::json!({
        "id": format!("id-{name}-{minutes_ago}-{}", uuid_suffix()),
        "item_name": name,
        "quantity": 1.0,
        "unit": "unit",
        "storage_location": "fridge",
        "created_at": created,
    })
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().to_string().chars().take(8).collect()
}

/// In-memory pantry backend serving both tool families.
///
/// Records every invocation with its arguments, tracks how many calls were
/// in flight at once, and can be told to fail a named tool.
pub struct FakePantry {
    items: Mutex<Vec<serde_json::Value>>,
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
    failing: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakePantry {
    pub fn new(items: Vec<serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            invocations: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Make every invocation of `tool` fail with a domain error.
    pub fn failing_tool(self: Arc<Self>, tool: &str) -> Arc<Self> {
        self.failing
            .lock()
            .expect("test lock")
            .insert(tool.to_owned());
        self
    }

    /// Names of the stored records, in storage order.
    pub fn names(&self) -> Vec<String> {
        self.items
            .lock()
            .expect("test lock")
            .iter()
            .map(|i| i["item_name"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    /// Ids of the stored records.
    pub fn ids(&self) -> Vec<String> {
        self.items
            .lock()
            .expect("test lock")
            .iter()
            .map(|i| i["id"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    /// Id of the oldest record with the given name.
    pub fn oldest_id(&self, name: &str) -> Option<String> {
        self.items
            .lock()
            .expect("test lock")
            .iter()
            .filter(|i| i["item_name"] == name)
            .min_by_key(|i| i["created_at"].as_str().unwrap_or_default().to_owned())
            .map(|i| i["id"].as_str().unwrap_or_default().to_owned())
    }

    /// Tool names in invocation order.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("test lock")
            .iter()
            .map(|(tool, _)| tool.clone())
            .collect()
    }

    /// Argument objects recorded for a tool, in invocation order.
    pub fn arguments_for(&self, tool: &str) -> Vec<serde_json::Value> {
        self.invocations
            .lock()
            .expect("test lock")
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Highest number of concurrently in-flight invocations seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(
        &self,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let mut items = self.items.lock().expect("test lock");
        match tool {
            "inventory_list" => Ok(serde_json::Value::Array(items.clone())),
            "inventory_add" => {
                let name = arguments["item_name"].as_str().unwrap_or("unknown");
                let mut entry = record(name, 0);
                if let Some(quantity) = arguments.get("quantity") {
                    entry["quantity"] = quantity.clone();
                }
                items.push(entry);
                Ok(serde_json::json!({"added": name}))
            }
            "inventory_delete_by_name" => {
                let name = arguments["item_name"].as_str().unwrap_or_default();
                let before = items.len();
                items.retain(|i| i["item_name"] != name);
                Ok(serde_json::json!({"deleted_count": before.saturating_sub(items.len())}))
            }
            "inventory_delete_by_name_oldest" | "inventory_delete_by_name_latest" => {
                let name = arguments["item_name"].as_str().unwrap_or_default();
                let pick_latest = tool.ends_with("_latest");
                let target = items
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i["item_name"] == name)
                    .map(|(idx, i)| (idx, i["created_at"].as_str().unwrap_or_default().to_owned()))
                    .reduce(|best, candidate| {
                        let better = if pick_latest {
                            candidate.1 > best.1
                        } else {
                            candidate.1 < best.1
                        };
                        if better {
                            candidate
                        } else {
                            best
                        }
                    })
                    .map(|(idx, _)| idx);
                match target {
                    Some(idx) => {
                        let removed = items.remove(idx);
                        Ok(serde_json::json!({"deleted": removed["id"]}))
                    }
                    None => Err(ToolError::Domain(format!("no records named {name}"))),
                }
            }
            "generate_menu_plan_with_history" => Ok(serde_json::json!({
                "data": {"main": "braised beef shank with carrots"}
            })),
            "search_menu_from_rag_with_history" => Ok(serde_json::json!({
                "data": {
                    "main": "hearty carrot and beef soup",
                    "side": "roasted root vegetables"
                }
            })),
            "search_recipe_from_web" => {
                let recipes: Vec<serde_json::Value> = arguments
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .filter(|(key, _)| *key != "token")
                            .filter_map(|(_, value)| value.as_str())
                            .map(|title| {
                                serde_json::json!({
                                    "title": title,
                                    "url": format!("https://recipes.example/{}", slug(title)),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(serde_json::json!({"data": {"recipes": recipes}}))
            }
            "llm_chat" => Ok(serde_json::json!({
                "reply": arguments["message"].as_str().unwrap_or_default()
            })),
            other => Ok(serde_json::json!({"tool": other})),
        }
    }
}

fn slug(title: &str) -> String {
    title.to_lowercase().replace(' ', "-")
}

#[async_trait]
impl ToolTransport for FakePantry {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        Ok(Vec::new())
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.invocations
            .lock()
            .expect("test lock")
            .push((tool.to_owned(), arguments.clone()));

        let current = self
            .in_flight
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().expect("test lock").contains(tool) {
            return Err(ToolError::Domain("temporarily unavailable".to_owned()));
        }

        self.answer(tool, &arguments)
    }
}

/// Drain every event currently buffered on a stream subscription.
pub fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(serde_json::from_str(&frame).expect("frame is JSON"));
    }
    events
}

/// The distinct run of `progress_percentage` values across events.
pub fn percentages(events: &[serde_json::Value]) -> Vec<u64> {
    let mut distinct: Vec<u64> = Vec::new();
    for event in events {
        let value = event["progress"]["progress_percentage"]
            .as_u64()
            .expect("percentage present");
        if distinct.last() != Some(&value) {
            distinct.push(value);
        }
    }
    distinct
}
