use std::sync::Arc;

use crate::agent::orchestrator::TurnOrchestrator;
use crate::agent::prompt::PromptAssembler;
use crate::agent::session::{InMemorySessionStore, SessionStore};
use crate::agent::skills::SkillCatalog;
use crate::agent::tools::{ReadSkillTool, ToolRegistry};
use crate::auth::ClientAuth;
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::transport::{ChatUpstream, HttpTransport};
use crate::util::unix_now_secs;

/// Shared application state accessible to all handlers.
///
/// Every collaborator is constructed once at startup and passed in; nothing
/// here is a process-wide singleton.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: Arc<dyn ChatUpstream>,
    pub sessions: Arc<dyn SessionStore>,
    pub prompts: PromptAssembler,
    pub tools: Arc<ToolRegistry>,
    pub auth: ClientAuth,
    /// Unix seconds at startup; reported as `created` for listed models.
    pub started_at: u64,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: AppConfig,
        upstream: Arc<dyn ChatUpstream>,
        sessions: Arc<dyn SessionStore>,
        prompts: PromptAssembler,
        tools: Arc<ToolRegistry>,
        auth: ClientAuth,
    ) -> Self {
        Self {
            config,
            upstream,
            sessions,
            prompts,
            tools,
            auth,
            started_at: unix_now_secs(),
        }
    }

    /// Build the production state: HTTP upstream, in-memory sessions, skills
    /// and prompts from disk, key store from `client_authentication`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` when the HTTP client or key store cannot be set up.
    pub fn from_config(config: AppConfig) -> Result<Self, BridgeError> {
        let upstream = HttpTransport::new(&config.upstream)?;
        tracing::info!(url = upstream.url(), "upstream configured");

        let skills = Arc::new(SkillCatalog::load(&config.agent.skills_dir));
        let prompts = PromptAssembler::new(&config.agent.prompts_dir, Arc::clone(&skills));
        let tools = Arc::new(default_tools(skills));
        let auth = ClientAuth::from_config(&config.client_authentication)
            .map_err(|err| BridgeError::Config(err.to_string()))?;

        Ok(Self::new(
            config,
            Arc::new(upstream),
            Arc::new(InMemorySessionStore::new()),
            prompts,
            tools,
            auth,
        ))
    }

    /// An orchestrator bound to this state's upstream and tools.
    #[must_use]
    pub fn orchestrator(&self) -> TurnOrchestrator {
        TurnOrchestrator::new(
            Arc::clone(&self.upstream),
            Arc::clone(&self.tools),
            self.config.agent.max_tool_rounds,
        )
    }
}

/// Built-in tools registered for every deployment.
#[must_use]
pub fn default_tools(skills: Arc<SkillCatalog>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadSkillTool::new(skills)));
    registry
}
