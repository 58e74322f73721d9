pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod skills;
pub mod tools;

pub use orchestrator::{TurnOrchestrator, TurnOutcome, TurnRequest};
pub use prompt::PromptAssembler;
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use skills::{Skill, SkillCatalog};
pub use tools::{ReadSkillTool, Tool, ToolOutput, ToolRegistry};
