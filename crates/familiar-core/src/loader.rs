//! Grimoire and spell resolution.
//!
//! Names resolve by exact file stem: the user-writable directory is checked first
//! (`<name>.yaml`, then `<name>.yml`), then the built-in set. User definitions shadow
//! built-ins of the same name.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::grimoire::{Grimoire, GrimoireError, Result};

/// Read-only built-in grimoires and spells, constructed once and shared.
#[derive(Debug, Clone, Default)]
pub struct BuiltinSet {
    grimoires: BTreeMap<String, String>,
    spells: BTreeMap<String, String>,
}

impl BuiltinSet {
    /// The set compiled into the binary.
    pub fn embedded() -> Self {
        Self::from_sources(
            [
                ("default", include_str!("../grimoires/default.yaml")),
                ("quick", include_str!("../grimoires/quick.yaml")),
            ],
            [
                ("implement", include_str!("../spells/implement.md")),
                ("fix-tests", include_str!("../spells/fix-tests.md")),
            ],
        )
    }

    /// A set with no built-ins, for tests that want only user definitions.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_sources<'a>(
        grimoires: impl IntoIterator<Item = (&'a str, &'a str)>,
        spells: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            grimoires: grimoires
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            spells: spells
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn grimoire_names(&self) -> impl Iterator<Item = &str> {
        self.grimoires.keys().map(String::as_str)
    }
}

/// Where a grimoire definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrimoireOrigin {
    User,
    Builtin,
}

/// Listing entry; definitions that fail to load are listed with their error.
#[derive(Debug, Clone, Serialize)]
pub struct GrimoireSummary {
    pub name: String,
    pub origin: GrimoireOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Loader {
    user_dir: PathBuf,
    spell_dir: PathBuf,
    builtins: Arc<BuiltinSet>,
}

impl Loader {
    pub fn new(user_dir: PathBuf, spell_dir: PathBuf, builtins: Arc<BuiltinSet>) -> Self {
        Self {
            user_dir,
            spell_dir,
            builtins,
        }
    }

    /// Load and validate a grimoire by name.
    pub fn load(&self, name: &str) -> Result<Grimoire> {
        if !is_valid_name(name) {
            return Err(GrimoireError::NotFound(name.to_string()));
        }

        if let Some(path) = self.user_file(name) {
            let source = read(&path)?;
            return Grimoire::from_yaml(&source, &path.display().to_string());
        }

        match self.builtins.grimoires.get(name) {
            Some(source) => Grimoire::from_yaml(source, &format!("builtin:{name}")),
            None => Err(GrimoireError::NotFound(name.to_string())),
        }
    }

    /// All resolvable grimoire names, user definitions first shadowing built-ins.
    pub fn list(&self) -> Vec<GrimoireSummary> {
        let mut entries: BTreeMap<String, GrimoireOrigin> = self
            .builtins
            .grimoire_names()
            .map(|n| (n.to_string(), GrimoireOrigin::Builtin))
            .collect();

        if let Ok(dir) = fs::read_dir(&self.user_dir) {
            for entry in dir.flatten() {
                let path = entry.path();
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml");
                let stem = path.file_stem().and_then(|s| s.to_str());
                if let (true, Some(stem)) = (is_yaml, stem) {
                    entries.insert(stem.to_string(), GrimoireOrigin::User);
                }
            }
        }

        entries
            .into_iter()
            .map(|(name, origin)| match self.load(&name) {
                Ok(g) => GrimoireSummary {
                    name,
                    origin,
                    description: Some(g.description),
                    error: None,
                },
                Err(e) => GrimoireSummary {
                    name,
                    origin,
                    description: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Resolve an agent step's `spell`: a spell file in the user spell directory, then a
    /// built-in spell, otherwise the value itself is the prompt text.
    pub fn resolve_spell(&self, spell: &str) -> Result<String> {
        let name = spell.trim();
        if !is_valid_name(name) {
            return Ok(spell.to_string());
        }

        let path = self.spell_dir.join(format!("{name}.md"));
        if path.is_file() {
            return read(&path);
        }
        if let Some(text) = self.builtins.spells.get(name) {
            return Ok(text.clone());
        }
        Ok(spell.to_string())
    }

    fn user_file(&self, name: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.user_dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
    }
}

/// Names are single path components without whitespace.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && !name.chars().any(char::is_whitespace)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| GrimoireError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const USER_DEFAULT: &str =
        "name: default\ndescription: user override\nsteps:\n  - {name: only, type: merge}\n";

    fn loader(dir: &TempDir, builtins: BuiltinSet) -> Loader {
        Loader::new(
            dir.path().join("grimoires"),
            dir.path().join("spells"),
            Arc::new(builtins),
        )
    }

    #[test]
    fn embedded_grimoires_are_valid() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir, BuiltinSet::embedded());
        for name in ["default", "quick"] {
            let g = loader.load(name).unwrap();
            assert_eq!(g.name, name);
        }
        assert!(loader.list().iter().all(|s| s.error.is_none()));
    }

    #[test]
    fn user_definition_shadows_builtin() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("grimoires")).unwrap();
        fs::write(dir.path().join("grimoires/default.yml"), USER_DEFAULT).unwrap();

        let loader = loader(&dir, BuiltinSet::embedded());
        let g = loader.load("default").unwrap();
        assert_eq!(g.description, "user override");

        let listed = loader.list();
        let default = listed.iter().find(|s| s.name == "default").unwrap();
        assert_eq!(default.origin, GrimoireOrigin::User);
    }

    #[test]
    fn unknown_and_unsafe_names_are_not_found() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir, BuiltinSet::empty());
        for name in ["missing", "../etc/passwd", "a b", ""] {
            assert!(loader.load(name).unwrap_err().is_not_found(), "{name}");
        }
    }

    #[test]
    fn broken_user_file_fails_with_descriptive_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("grimoires")).unwrap();
        fs::write(
            dir.path().join("grimoires/broken.yaml"),
            "name: broken\ndescription: d\nsteps:\n  - {name: s, type: script}\n",
        )
        .unwrap();

        let loader = loader(&dir, BuiltinSet::empty());
        let err = loader.load("broken").unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("command"), "{err}");

        let listed = loader.list();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].error.is_some());
    }

    #[test]
    fn spells_resolve_user_then_builtin_then_inline() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("spells")).unwrap();
        fs::write(dir.path().join("spells/implement.md"), "custom implement").unwrap();

        let loader = loader(&dir, BuiltinSet::embedded());
        assert_eq!(loader.resolve_spell("implement").unwrap(), "custom implement");
        assert!(loader
            .resolve_spell("fix-tests")
            .unwrap()
            .contains("{{ input.failures }}"));
        assert_eq!(
            loader.resolve_spell("Write a haiku about the task").unwrap(),
            "Write a haiku about the task"
        );
        assert_eq!(loader.resolve_spell("nonexistent").unwrap(), "nonexistent");
    }
}
