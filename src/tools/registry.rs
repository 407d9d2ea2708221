//! Tool registry: name-based routing, catalogue cache, credential injection.
//!
//! The registry owns one transport per tool family and presents them as a
//! single namespace. Tool names route by prefix: `inventory_*` / `recipes_*`
//! go to the db transport, `generate_menu_*` / `search_menu_*` /
//! `search_recipe_*` to the recipe transport, everything else to the
//! default transport. The catalogue is introspected once at startup and
//! cached for the process lifetime.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{ToolError, ToolSpec, ToolTransport};

/// Sentinel credential replaced by the configured service token.
const DUMMY_TOKEN: &str = "dummy-token";

/// Argument name every tool accepts its credential under.
const TOKEN_ARG: &str = "token";

/// Routes tool invocations to the right transport and injects credentials.
pub struct ToolRegistry {
    db: Arc<dyn ToolTransport>,
    recipe: Arc<dyn ToolTransport>,
    default_transport: Arc<dyn ToolTransport>,
    /// Process-wide credential substituted for the dummy-token sentinel.
    service_token: Option<String>,
    /// Cached catalogue, populated by [`discover`](Self::discover).
    catalogue: RwLock<Vec<ToolSpec>>,
}

impl ToolRegistry {
    /// Create a registry over a db and a recipe transport.
    ///
    /// The db transport doubles as the default route for unknown names.
    pub fn new(
        db: Arc<dyn ToolTransport>,
        recipe: Arc<dyn ToolTransport>,
        service_token: Option<String>,
    ) -> Self {
        Self {
            default_transport: Arc::clone(&db),
            db,
            recipe,
            service_token,
            catalogue: RwLock::new(Vec::new()),
        }
    }

    /// Resolve the transport serving a tool name.
    fn route(&self, tool_name: &str) -> &Arc<dyn ToolTransport> {
        if tool_name.starts_with("inventory_") || tool_name.starts_with("recipes_") {
            &self.db
        } else if tool_name.starts_with("generate_menu_")
            || tool_name.starts_with("search_menu_")
            || tool_name.starts_with("search_recipe_")
        {
            &self.recipe
        } else {
            &self.default_transport
        }
    }

    /// Introspect every transport and cache the combined catalogue.
    ///
    /// A transport that fails to answer contributes nothing; discovery
    /// still succeeds so the process can start with a partial tool set.
    pub async fn discover(&self) -> usize {
        let mut specs = Vec::new();

        for (family, transport) in [("db", &self.db), ("recipe", &self.recipe)] {
            match transport.list_tools().await {
                Ok(mut listed) => {
                    info!(family, count = listed.len(), "tool family discovered");
                    specs.append(&mut listed);
                }
                Err(e) => {
                    warn!(family, error = %e, "tool listing failed; family unavailable");
                }
            }
        }

        let count = specs.len();
        *self.catalogue.write().await = specs;
        count
    }

    /// The cached catalogue (empty before [`discover`](Self::discover)).
    pub async fn list_tools(&self) -> Vec<ToolSpec> {
        self.catalogue.read().await.clone()
    }

    /// Names of every cached tool.
    pub async fn tool_names(&self) -> Vec<String> {
        self.catalogue
            .read()
            .await
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Invoke a tool, injecting the session credential.
    ///
    /// The credential is added as the `token` argument. The `dummy-token`
    /// sentinel is replaced by the configured service token when present.
    pub async fn invoke(
        &self,
        tool_name: &str,
        mut arguments: serde_json::Map<String, serde_json::Value>,
        auth_token: &str,
    ) -> Result<serde_json::Value, ToolError> {
        let token = if auth_token == DUMMY_TOKEN {
            match &self.service_token {
                Some(service) => {
                    info!(tool = tool_name, "substituting service credential for test token");
                    service.clone()
                }
                None => auth_token.to_owned(),
            }
        } else {
            auth_token.to_owned()
        };

        arguments.insert(TOKEN_ARG.to_owned(), serde_json::Value::String(token));

        self.route(tool_name)
            .invoke(tool_name, serde_json::Value::Object(arguments))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport that records invocations and answers from a script.
    struct RecordingTransport {
        name: &'static str,
        calls: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingTransport {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, serde_json::Value)> {
            self.calls.lock().expect("test lock").clone()
        }
    }

    #[async_trait]
    impl ToolTransport for RecordingTransport {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
            Ok(vec![ToolSpec {
                name: format!("{}_probe", self.name),
                description: format!("{} family probe", self.name),
                input_schema: serde_json::json!({}),
            }])
        }

        async fn invoke(
            &self,
            tool: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            self.calls
                .lock()
                .expect("test lock")
                .push((tool.to_owned(), arguments));
            Ok(serde_json::json!({"transport": self.name}))
        }
    }

    fn registry_with(
        service_token: Option<String>,
    ) -> (Arc<RecordingTransport>, Arc<RecordingTransport>, ToolRegistry) {
        let db = RecordingTransport::new("db");
        let recipe = RecordingTransport::new("recipe");
        let registry = ToolRegistry::new(
            Arc::clone(&db) as Arc<dyn ToolTransport>,
            Arc::clone(&recipe) as Arc<dyn ToolTransport>,
            service_token,
        );
        (db, recipe, registry)
    }

    #[tokio::test]
    async fn test_routing_by_prefix() {
        let (db, recipe, registry) = registry_with(None);

        for tool in ["inventory_add", "recipes_list", "llm_chat"] {
            registry
                .invoke(tool, serde_json::Map::new(), "tok")
                .await
                .expect("invoke should succeed");
        }
        registry
            .invoke("generate_menu_plan_with_history", serde_json::Map::new(), "tok")
            .await
            .expect("invoke should succeed");
        registry
            .invoke("search_recipe_from_web", serde_json::Map::new(), "tok")
            .await
            .expect("invoke should succeed");

        let db_tools: Vec<String> = db.calls().into_iter().map(|(t, _)| t).collect();
        let recipe_tools: Vec<String> = recipe.calls().into_iter().map(|(t, _)| t).collect();

        assert_eq!(db_tools, vec!["inventory_add", "recipes_list", "llm_chat"]);
        assert_eq!(
            recipe_tools,
            vec!["generate_menu_plan_with_history", "search_recipe_from_web"]
        );
    }

    #[tokio::test]
    async fn test_token_injected() {
        let (db, _recipe, registry) = registry_with(None);

        registry
            .invoke("inventory_list", serde_json::Map::new(), "user-jwt")
            .await
            .expect("invoke should succeed");

        let calls = db.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["token"], "user-jwt");
    }

    #[tokio::test]
    async fn test_dummy_token_substituted() {
        let (db, _recipe, registry) = registry_with(Some("service-key".to_owned()));

        registry
            .invoke("inventory_list", serde_json::Map::new(), "dummy-token")
            .await
            .expect("invoke should succeed");

        assert_eq!(db.calls()[0].1["token"], "service-key");
    }

    #[tokio::test]
    async fn test_dummy_token_passthrough_without_service_token() {
        let (db, _recipe, registry) = registry_with(None);

        registry
            .invoke("inventory_list", serde_json::Map::new(), "dummy-token")
            .await
            .expect("invoke should succeed");

        assert_eq!(
            db.calls()[0].1["token"], "dummy-token",
            "without a service token the sentinel passes through"
        );
    }

    #[tokio::test]
    async fn test_discover_caches_catalogue() {
        let (_db, _recipe, registry) = registry_with(None);

        assert!(registry.list_tools().await.is_empty());
        let count = registry.discover().await;
        assert_eq!(count, 2);

        let names = registry.tool_names().await;
        assert!(names.contains(&"db_probe".to_owned()));
        assert!(names.contains(&"recipe_probe".to_owned()));
    }
}
