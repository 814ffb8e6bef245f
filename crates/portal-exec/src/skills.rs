//! Agent skill files stored in the container.

use serde::Serialize;

use crate::{
    fs::{FsError, RemoteFs},
    shell,
};

/// Workspace-local skills directory. Shadows the global one.
pub const LOCAL_SKILLS_DIR: &str = "/workspace/.opencode/skills";

/// Global skills directory.
pub const GLOBAL_SKILLS_DIR: &str = "/root/.config/opencode/skills";

/// A skill file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skill {
    pub name: String,
    pub path: String,
    pub description: String,
}

impl RemoteFs {
    /// List local then global skills; a local skill hides a global one of
    /// the same name.
    ///
    /// # Errors
    /// Returns error if a skills directory cannot be scanned.
    pub async fn list_skills(&self) -> Result<Vec<Skill>, FsError> {
        let mut skills: Vec<Skill> = Vec::new();

        for dir in [LOCAL_SKILLS_DIR, GLOBAL_SKILLS_DIR] {
            let script = format!(
                "find {} -name '*.md' -type f 2>/dev/null || true",
                shell::quote(dir)?
            );
            let output = self.exec(shell::sh_c(script)).await?;

            for path in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let Some(name) = skill_name(path) else {
                    continue;
                };
                if skills.iter().any(|s| s.name == name) {
                    continue;
                }
                let description = match self
                    .exec(vec!["head".into(), "-n".into(), "3".into(), path.into()])
                    .await
                {
                    Ok(head) => describe(&head.stdout),
                    Err(e) => {
                        tracing::debug!(path, "Could not read skill header: {e}");
                        String::new()
                    }
                };
                skills.push(Skill {
                    name: name.to_string(),
                    path: path.to_string(),
                    description,
                });
            }
        }

        Ok(skills)
    }

    /// Write a workspace-local skill and return its path.
    ///
    /// # Errors
    /// Returns `InvalidName` if nothing usable remains of `name`, or error if
    /// the write fails.
    pub async fn create_skill(&self, name: &str, content: &str) -> Result<String, FsError> {
        let safe = sanitize_skill_name(name);
        if safe.is_empty() {
            return Err(FsError::InvalidName(name.to_string()));
        }
        let path = format!("{LOCAL_SKILLS_DIR}/{safe}.md");

        self.mkdir(LOCAL_SKILLS_DIR).await?;
        self.write_file(&path, content.as_bytes()).await?;
        tracing::info!(container = %self.target(), path, "Created skill");
        Ok(path)
    }
}

/// File stem of a `.md` path.
fn skill_name(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    file.strip_suffix(".md").filter(|n| !n.is_empty())
}

/// Keep `[A-Za-z0-9_-]`, lowercased.
#[must_use]
pub fn sanitize_skill_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '-' | '_'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// First heading in the head of a skill file, else its first non-empty line.
#[must_use]
pub fn describe(head: &str) -> String {
    let mut first_line = None;
    for line in head.lines().map(str::trim) {
        if line.starts_with('#') {
            return line.trim_start_matches('#').trim_start().to_string();
        }
        if first_line.is_none() && !line.is_empty() {
            first_line = Some(line);
        }
    }
    first_line.unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::run::{CommandRunner, ExecError, ExecOutput};

    /// Fake container answering `find` and `head` from a fixed file table.
    struct FakeSkills {
        files: Vec<(&'static str, &'static str)>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeSkills {
        async fn run(&self, _target: &str, command: Vec<String>) -> Result<ExecOutput, ExecError> {
            self.commands.lock().unwrap().push(command.clone());
            let stdout = if command[0] == "head" {
                self.files
                    .iter()
                    .find(|(path, _)| *path == command[3])
                    .map(|(_, body)| body.lines().take(3).collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default()
            } else if command[0] == "sh" && command[2].starts_with("find") {
                let dir = command[2].split_whitespace().nth(1).unwrap_or_default();
                self.files
                    .iter()
                    .filter(|(path, _)| path.starts_with(dir))
                    .map(|(path, _)| format!("{path}\n"))
                    .collect()
            } else {
                String::new()
            };
            Ok(ExecOutput {
                stdout,
                exit_code: Some(0),
                ..ExecOutput::default()
            })
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe("# Deploy\nsteps"), "Deploy");
        assert_eq!(describe("\nintro line\n## Later heading"), "Later heading");
        assert_eq!(describe("\nplain text\nmore"), "plain text");
        assert_eq!(describe(""), "");
    }

    #[test]
    fn test_sanitize_skill_name() {
        assert_eq!(sanitize_skill_name("My Skill_v2!"), "myskill_v2");
        assert_eq!(sanitize_skill_name("../../etc"), "etc");
        assert_eq!(sanitize_skill_name("***"), "");
    }

    #[tokio::test]
    async fn test_local_skill_shadows_global() {
        let runner = Arc::new(FakeSkills {
            files: vec![
                ("/workspace/.opencode/skills/review.md", "# Code review\nbody"),
                ("/root/.config/opencode/skills/review.md", "# Global review"),
                ("/root/.config/opencode/skills/deploy.md", "Ship it\nnow"),
            ],
            commands: Mutex::new(Vec::new()),
        });
        let fs = RemoteFs::new(runner, "box");
        let skills = fs.list_skills().await.unwrap();

        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "review");
        assert_eq!(skills[0].description, "Code review");
        assert_eq!(skills[0].path, "/workspace/.opencode/skills/review.md");
        assert_eq!(skills[1].name, "deploy");
        assert_eq!(skills[1].description, "Ship it");
    }

    #[tokio::test]
    async fn test_create_skill() {
        let runner = Arc::new(FakeSkills {
            files: vec![],
            commands: Mutex::new(Vec::new()),
        });
        let fs = RemoteFs::new(runner.clone(), "box");
        let path = fs.create_skill("Release Notes", "# Notes").await.unwrap();
        assert_eq!(path, "/workspace/.opencode/skills/releasenotes.md");

        {
            let commands = runner.commands.lock().unwrap();
            assert_eq!(commands[0], vec!["mkdir", "-p", LOCAL_SKILLS_DIR]);
            assert!(commands[1][2].ends_with("> /workspace/.opencode/skills/releasenotes.md"));
        }

        assert!(matches!(
            fs.create_skill("!!", "x").await,
            Err(FsError::InvalidName(_))
        ));
    }
}
