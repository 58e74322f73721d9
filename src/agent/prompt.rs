use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::skills::SkillCatalog;

const SKILLS_PLACEHOLDER: &str = "{{SKILLS_SUMMARY}}";

/// Builds the system prompt from `base.md`, `soul.md` and the skill catalog.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    prompts_dir: PathBuf,
    skills: Arc<SkillCatalog>,
}

impl PromptAssembler {
    #[must_use]
    pub fn new(prompts_dir: impl Into<PathBuf>, skills: Arc<SkillCatalog>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            skills,
        }
    }

    #[must_use]
    pub fn skills(&self) -> &Arc<SkillCatalog> {
        &self.skills
    }

    /// Assemble the prompt, inlining skills that match `query`.
    #[must_use]
    pub fn system_prompt(&self, query: Option<&str>) -> String {
        let base = self.load_file("base.md");
        let soul = self.load_file("soul.md");

        let matched = query
            .filter(|q| !q.is_empty())
            .map(|q| self.skills.find_skills(q))
            .unwrap_or_default();
        let segment = self.skills.prompt_segment(&matched);

        let mut prompt = base.replace(SKILLS_PLACEHOLDER, &segment);
        if !soul.is_empty() {
            prompt.push_str("\n<personality>\n");
            prompt.push_str(&soul);
            prompt.push_str("\n</personality>");
        }

        tracing::info!(
            chars = prompt.chars().count(),
            matched_skills = matched.len(),
            "assembled system prompt"
        );
        prompt
    }

    fn load_file(&self, name: &str) -> String {
        let path = self.prompts_dir.join(name);
        read_prompt_file(&path)
    }
}

fn read_prompt_file(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "prompt file not found");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::skills::Skill;

    fn catalog() -> Arc<SkillCatalog> {
        Arc::new(SkillCatalog::from_skills(vec![Skill {
            name: "weather".into(),
            description: "Forecasts".into(),
            instructions: "Call wttr.in".into(),
            tags: vec![],
            version: "1.0.0".into(),
        }]))
    }

    #[test]
    fn test_base_soul_and_skills() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.md"), "You are helpful.\n{{SKILLS_SUMMARY}}").unwrap();
        std::fs::write(dir.path().join("soul.md"), "Be warm.").unwrap();

        let assembler = PromptAssembler::new(dir.path(), catalog());
        let prompt = assembler.system_prompt(Some("what's the weather"));
        assert!(prompt.starts_with("You are helpful.\n\n### SPECIALIZED SKILLS\n"));
        assert!(prompt.contains("Instructions:\nCall wttr.in"));
        assert!(prompt.ends_with("\n<personality>\nBe warm.\n</personality>"));
    }

    #[test]
    fn test_missing_files_yield_empty_base() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = PromptAssembler::new(dir.path(), catalog());
        assert_eq!(assembler.system_prompt(None), "");
    }
}
