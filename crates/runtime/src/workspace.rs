//! Agent workspaces — the on-disk directory whose markdown files compose
//! the system prompt.

use std::path::{Path, PathBuf};

use chrono::{Duration, Local};

use corral_domain::error::{Error, Result};

/// Recognized top-level workspace files, in prompt order.
const CONTEXT_FILES: &[&str] = &[
    "SOUL.md",
    "AGENTS.md",
    "TOOLS.md",
    "USER.md",
    "MEMORY.md",
    "HEARTBEAT.md",
    "BOOTSTRAP.md",
];

#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    pub name: String,
    pub content: String,
}

/// A loaded snapshot of one agent's workspace.
#[derive(Debug, Clone)]
pub struct AgentWorkspace {
    pub dir: PathBuf,
    pub agent_id: String,
    /// Present top-level context files, in prompt order.
    pub files: Vec<WorkspaceFile>,
    /// Today's and yesterday's daily memory logs.
    pub daily_memories: Vec<WorkspaceFile>,
    pub skills: Vec<WorkspaceFile>,
}

impl AgentWorkspace {
    /// Read the workspace from disk. The directory must exist; individual
    /// files are all optional.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NotFound(format!(
                "agent workspace not found: {}",
                dir.display()
            )));
        }
        let agent_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let files = CONTEXT_FILES
            .iter()
            .filter_map(|name| {
                read_optional(&dir.join(name)).map(|content| WorkspaceFile {
                    name: (*name).to_owned(),
                    content,
                })
            })
            .collect();

        let mut daily_memories = Vec::new();
        let memory_dir = dir.join("memory");
        if memory_dir.is_dir() {
            let today = Local::now().date_naive();
            for days_ago in 0..2 {
                let date = today - Duration::days(days_ago);
                let name = format!("{}.md", date.format("%Y-%m-%d"));
                if let Some(content) = read_optional(&memory_dir.join(&name)) {
                    daily_memories.push(WorkspaceFile { name, content });
                }
            }
        }

        let mut skills = Vec::new();
        let skills_dir = dir.join("skills");
        if skills_dir.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&skills_dir)
                .map_err(Error::Io)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "md"))
                .collect();
            entries.sort();
            for path in entries {
                if let Some(content) = read_optional(&path) {
                    skills.push(WorkspaceFile {
                        name: path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        content,
                    });
                }
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            agent_id,
            files,
            daily_memories,
            skills,
        })
    }

    /// Concatenate readable sections into the system prompt body.
    pub fn build_context(&self) -> String {
        let mut sections: Vec<String> = Vec::new();

        for file in &self.files {
            sections.push(format!("## {}\n{}", file.name, file.content));
        }
        for daily in &self.daily_memories {
            sections.push(format!("## memory/{}\n{}", daily.name, daily.content));
        }
        for skill in &self.skills {
            sections.push(format!("## skills/{}\n{}", skill.name, skill.content));
        }

        sections.join("\n\n---\n\n")
    }
}

/// Create a workspace directory with its `memory/` and `skills/` subdirs.
pub fn ensure_workspace(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir.join("memory")).map_err(Error::Io)?;
    std::fs::create_dir_all(dir.join("skills")).map_err(Error::Io)?;
    Ok(())
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "workspace file unreadable");
            None
        }
    }
}
