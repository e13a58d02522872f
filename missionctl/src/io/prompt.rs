//! Prompt library: stage templates rendered with minijinja.
//!
//! Built-in templates are compiled in; a `<name>.md` file in the configured
//! prompts directory overrides or extends them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;
use tracing::{debug, warn};

const BUILTIN_TEMPLATES: [(&str, &str); 5] = [
    ("build", include_str!("prompts/build.md")),
    ("content_base", include_str!("prompts/content_base.md")),
    ("research", include_str!("prompts/research.md")),
    ("draft", include_str!("prompts/draft.md")),
    ("quality_review", include_str!("prompts/quality_review.md")),
];

pub struct PromptLibrary {
    env: Environment<'static>,
    sources: BTreeMap<String, String>,
}

impl PromptLibrary {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        Self {
            env: Environment::new(),
            sources: BUILTIN_TEMPLATES
                .iter()
                .map(|(name, body)| (name.to_string(), body.to_string()))
                .collect(),
        }
    }

    /// Built-ins overlaid with every `*.md` file found in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut library = Self::builtin();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "prompts directory missing, using built-ins");
            return Ok(library);
        }
        let entries =
            fs::read_dir(dir).with_context(|| format!("read prompts dir {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("read prompts dir {}", dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            library.insert(name, body);
        }
        Ok(library)
    }

    pub fn insert(&mut self, name: &str, body: impl Into<String>) {
        self.sources.insert(name.to_string(), body.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Render `name`; a missing template renders empty with a warning.
    pub fn render<S: Serialize>(&self, name: &str, vars: &S) -> Result<String> {
        let Some(source) = self.sources.get(name) else {
            warn!(template = name, "prompt template not found");
            return Ok(String::new());
        };
        self.env
            .render_str(source, vars)
            .with_context(|| format!("render prompt template {name}"))
    }

    /// Render each template and join the non-empty results with a blank line.
    pub fn render_composite<S: Serialize>(&self, names: &[&str], vars: &S) -> Result<String> {
        let mut parts = Vec::with_capacity(names.len());
        for name in names {
            let rendered = self.render(name, vars)?;
            if !rendered.trim().is_empty() {
                parts.push(rendered.trim_end().to_string());
            }
        }
        Ok(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("title".to_string(), "Fix login".to_string()),
            ("description".to_string(), "Users cannot log in".to_string()),
            ("branch_name".to_string(), "dev/ab12cd34".to_string()),
            ("repository".to_string(), "acme/app".to_string()),
            ("source_branch".to_string(), "main".to_string()),
        ])
    }

    #[test]
    fn builtin_build_template_renders_task_fields() {
        let library = PromptLibrary::builtin();
        let prompt = library.render("build", &vars()).expect("render");
        assert!(prompt.contains("Fix login"));
        assert!(prompt.contains("dev/ab12cd34"));
        assert!(prompt.contains("acme/app"));
    }

    #[test]
    fn missing_template_renders_empty() {
        let library = PromptLibrary::builtin();
        assert_eq!(library.render("nope", &vars()).expect("render"), "");
    }

    #[test]
    fn composite_joins_with_blank_line() {
        let mut library = PromptLibrary::builtin();
        library.insert("a", "Base for {{ title }}\n");
        library.insert("b", "Stage step");
        library.insert("empty", "   ");
        let prompt = library
            .render_composite(&["a", "empty", "b"], &vars())
            .expect("render");
        assert_eq!(prompt, "Base for Fix login\n\nStage step");
    }

    #[test]
    fn directory_overrides_builtins() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("build.md"), "Custom {{ title }}").expect("write");
        fs::write(temp.path().join("notes.txt"), "ignored").expect("write");
        let library = PromptLibrary::load(temp.path()).expect("load");
        assert_eq!(library.render("build", &vars()).expect("render"), "Custom Fix login");
        assert!(!library.contains("notes"));
        assert!(library.contains("research"));
    }
}
