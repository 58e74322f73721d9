use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One loaded `SKILL.md`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub tags: Vec<String>,
    pub version: String,
}

impl Skill {
    /// Full document as returned by the `read_skill` tool.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "# Skill: {}\n\nDescription: {}\nInstructions:\n{}\n",
            self.name, self.description, self.instructions
        )
    }

    fn matches(&self, query_lower: &str) -> bool {
        std::iter::once(&self.name)
            .chain(std::iter::once(&self.description))
            .chain(self.tags.iter())
            .filter(|item| !item.is_empty())
            .any(|item| query_lower.contains(&item.to_lowercase()))
    }
}

#[derive(Debug, Deserialize)]
struct Frontmatter {
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid frontmatter in {path}: {source}")]
    Frontmatter {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Parse a `SKILL.md` document.
///
/// `Ok(None)` when the document has no `---` frontmatter block or no name.
pub fn parse_skill_document(content: &str) -> Result<Option<Skill>, serde_yaml::Error> {
    let Some(rest) = content.strip_prefix("---") else {
        return Ok(None);
    };
    let Some((frontmatter, body)) = rest.split_once("---") else {
        return Ok(None);
    };
    let meta: Frontmatter = serde_yaml::from_str(frontmatter)?;
    let Some(name) = meta.name.filter(|name| !name.trim().is_empty()) else {
        return Ok(None);
    };
    Ok(Some(Skill {
        name,
        description: meta.description.unwrap_or_default(),
        instructions: body.trim().to_string(),
        tags: meta.tags,
        version: meta.version.unwrap_or_else(|| "1.0.0".to_string()),
    }))
}

fn load_skill_file(path: &Path) -> Result<Option<Skill>, SkillError> {
    let content = std::fs::read_to_string(path).map_err(|source| SkillError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_skill_document(&content).map_err(|source| SkillError::Frontmatter {
        path: path.to_path_buf(),
        source,
    })
}

/// Skills loaded from `<dir>/<name>/SKILL.md`, ordered by name.
#[derive(Debug, Default, Clone)]
pub struct SkillCatalog {
    skills: Vec<Skill>,
}

impl SkillCatalog {
    #[must_use]
    pub fn from_skills(mut skills: Vec<Skill>) -> Self {
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills.dedup_by(|a, b| a.name == b.name);
        Self { skills }
    }

    /// Scan `dir`. Missing directories and unreadable skills are logged, not fatal.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "skills directory not readable");
                return Self::default();
            }
        };

        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let skill_file = entry.path().join("SKILL.md");
            if !skill_file.is_file() {
                continue;
            }
            match load_skill_file(&skill_file) {
                Ok(Some(skill)) => skills.push(skill),
                Ok(None) => {
                    tracing::debug!(path = %skill_file.display(), "skipping skill without frontmatter");
                }
                Err(err) => tracing::error!(error = %err, "failed to load skill"),
            }
        }
        let catalog = Self::from_skills(skills);
        tracing::info!(dir = %dir.display(), count = catalog.len(), "skills loaded");
        catalog
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.skills.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|skill| skill.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.iter().map(|skill| skill.name.as_str())
    }

    /// Skills whose name, description or any tag occurs in `query` (case-insensitive).
    #[must_use]
    pub fn find_skills(&self, query: &str) -> Vec<&Skill> {
        let query_lower = query.to_lowercase();
        self.skills
            .iter()
            .filter(|skill| skill.matches(&query_lower))
            .collect()
    }

    /// System prompt segment: matched skills in full, the rest by name.
    #[must_use]
    pub fn prompt_segment(&self, matched: &[&Skill]) -> String {
        if self.skills.is_empty() {
            return "No specialized skills loaded.".to_string();
        }

        let mut segment = String::from("\n### SPECIALIZED SKILLS\n");
        if matched.is_empty() {
            segment.push_str(
                "Use 'read_skill' to see details for any of the following available skills:\n",
            );
            segment.push_str("Available: ");
            segment.push_str(&self.names().collect::<Vec<_>>().join(", "));
            segment.push('\n');
            return segment;
        }

        segment.push_str(
            "The following relevant skills have been dynamically loaded based on your request:\n\n",
        );
        for skill in matched {
            segment.push_str(&format!(
                "#### Skill: {}\nDescription: {}\nInstructions:\n{}\n\n",
                skill.name, skill.description, skill.instructions
            ));
        }
        let others: Vec<&str> = self
            .names()
            .filter(|name| !matched.iter().any(|skill| skill.name == *name))
            .collect();
        if !others.is_empty() {
            segment.push_str(&format!(
                "Other available skills: {}. (Use 'read_skill' to see details if needed)\n",
                others.join(", ")
            ));
        }
        segment
    }
}
