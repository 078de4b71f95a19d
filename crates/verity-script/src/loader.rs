//! RON script and model loader

use crate::error::{Error, Result};
use crate::schema::metamodel::Metamodel;
use crate::schema::model::ModelDef;
use crate::schema::script::ScriptDef;
use std::fs;
use std::path::{Path, PathBuf};
use verity_core::{Model, ModelRepository, Script};

/// Loader for RON scripts, models and metamodels
///
/// Relative paths are resolved against an optional base path, so a
/// configuration written on one machine can be loaded on another that keeps
/// the same files under a different root. Models accumulate into a
/// [`ModelRepository`] returned by [`Loader::finish`].
pub struct Loader {
    base_path: Option<PathBuf>,
    repository: ModelRepository,
}

impl Loader {
    /// Create a new loader
    pub fn new() -> Self {
        Self {
            base_path: None,
            repository: ModelRepository::new(),
        }
    }

    /// Resolve relative paths against `base`
    pub fn with_base_path(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base.into());
        self
    }

    /// Resolve a path against the base path
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Load a constraint script from a file
    pub fn load_script_file(&self, path: impl AsRef<Path>) -> Result<Script> {
        let path = self.resolve(path);
        let content = fs::read_to_string(&path)?;
        self.load_script_str(&content, path.display().to_string())
    }

    /// Load a constraint script from a RON string
    pub fn load_script_str(&self, content: &str, origin: impl Into<String>) -> Result<Script> {
        let def: ScriptDef = ron::from_str(content)?;
        let script = def.into_script(origin)?;
        tracing::debug!(
            origin = %script.origin,
            contexts = script.contexts.len(),
            constraints = script.constraint_count(),
            "loaded script"
        );
        Ok(script)
    }

    /// Load a metamodel from a file
    pub fn load_metamodel_file(&self, path: impl AsRef<Path>) -> Result<Metamodel> {
        let content = fs::read_to_string(self.resolve(path))?;
        self.load_metamodel_str(&content)
    }

    /// Load a metamodel from a RON string
    pub fn load_metamodel_str(&self, content: &str) -> Result<Metamodel> {
        let metamodel: Metamodel = ron::from_str(content)?;
        for (i, kind) in metamodel.kinds.iter().enumerate() {
            if metamodel.kinds[..i].iter().any(|k| k.id == kind.id) {
                return Err(Error::DuplicateDefinition(format!("kind {}", kind.id)));
            }
        }
        Ok(metamodel)
    }

    /// Load a model file, optionally checking it against a metamodel file
    ///
    /// The model name defaults to the file stem.
    pub fn load_model_file(
        &mut self,
        path: impl AsRef<Path>,
        metamodel: Option<&Path>,
    ) -> Result<()> {
        let path = self.resolve(path);
        let content = fs::read_to_string(&path)?;
        let default_name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("model")
            .to_string();
        let metamodel = match metamodel {
            Some(mm) => Some(self.load_metamodel_file(mm)?),
            None => None,
        };
        self.load_model_str(&content, &default_name, metamodel.as_ref())
    }

    /// Load a model from a RON string
    pub fn load_model_str(
        &mut self,
        content: &str,
        default_name: &str,
        metamodel: Option<&Metamodel>,
    ) -> Result<()> {
        let def: ModelDef = ron::from_str(content)?;
        let mut model = Model::new(def.name.unwrap_or_else(|| default_name.to_string()));
        if self.repository.get(&model.name).is_some() {
            return Err(Error::DuplicateDefinition(format!("model {}", model.name)));
        }
        for element in def.elements {
            model.elements.insert(element)?;
        }
        if let Some(mm) = metamodel {
            mm.check(&model)?;
        }
        tracing::debug!(model = %model.name, elements = model.elements.len(), "loaded model");
        self.repository.add(model)?;
        Ok(())
    }

    /// Load every `.ron` file in a directory as a model (no metamodel check)
    pub fn load_model_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(path);

        if !path.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Not a directory: {:?}", path),
            )));
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "ron").unwrap_or(false))
            .collect();
        // Directory order is platform dependent; models must load in a stable order
        files.sort();
        for file in files {
            self.load_model_file(&file, None)?;
        }
        Ok(())
    }

    /// Finish loading and return the models
    pub fn finish(self) -> ModelRepository {
        self.repository
    }

    /// Get the models loaded so far
    pub fn repository(&self) -> &ModelRepository {
        &self.repository
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}
