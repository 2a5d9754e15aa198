//! Manifest template rendering
//!
//! VM and cloud-init manifests are YAML templates with `${NAME}` placeholders.
//! Substitution resolves from the caller-supplied map first, then the process
//! environment, and preserves the placeholder literally on a miss so that a
//! rendered manifest never silently drops a field.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template directory '{0}': {1}")]
    Io(String, #[source] std::io::Error),
    #[error("template '{0}' not found")]
    Missing(String),
}

/// In-memory store of the manifest templates, loaded once at startup.
pub struct TemplateStore {
    templates: HashMap<String, String>,
}

impl TemplateStore {
    /// Load every `*.yaml` file in the directory, keyed by file name.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let mut templates = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TemplateError::Io(dir.display().to_string(), e))?;

        for entry in entries {
            let entry = entry.map_err(|e| TemplateError::Io(dir.display().to_string(), e))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let body = std::fs::read_to_string(&path)
                .map_err(|e| TemplateError::Io(path.display().to_string(), e))?;
            templates.insert(name, body);
        }

        info!(dir = %dir.display(), count = templates.len(), "loaded manifest templates");
        Ok(TemplateStore { templates })
    }

    #[cfg(test)]
    pub fn from_map(templates: HashMap<String, String>) -> Self {
        TemplateStore { templates }
    }

    /// Render a named template with the given variables.
    pub fn render(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        let body = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::Missing(name.to_string()))?;
        Ok(substitute(body, vars))
    }
}

/// Substitute `${NAME}` placeholders: caller map first, then the process
/// environment, literal preservation on miss.
pub fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                let valid = !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_');
                if valid {
                    match vars
                        .get(name)
                        .cloned()
                        .or_else(|| std::env::var(name).ok())
                    {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&input[i..i + 3 + end]),
                    }
                    i += 3 + end;
                    continue;
                }
            }
        }
        let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_from_map() {
        let out = substitute(
            "name: ${VM_NAME}\nnamespace: ${NAMESPACE}",
            &vars(&[("VM_NAME", "cp-cluster1"), ("NAMESPACE", "cluster1")]),
        );
        assert_eq!(out, "name: cp-cluster1\nnamespace: cluster1");
    }

    #[test]
    fn test_substitute_env_fallback() {
        unsafe { std::env::set_var("CKS_TPL_FALLBACK", "from-env") };
        let out = substitute("value: ${CKS_TPL_FALLBACK}", &HashMap::new());
        assert_eq!(out, "value: from-env");
    }

    #[test]
    fn test_map_wins_over_env() {
        unsafe { std::env::set_var("CKS_TPL_SHADOWED", "from-env") };
        let out = substitute(
            "value: ${CKS_TPL_SHADOWED}",
            &vars(&[("CKS_TPL_SHADOWED", "from-map")]),
        );
        assert_eq!(out, "value: from-map");
    }

    #[test]
    fn test_miss_preserved_literally() {
        let out = substitute("runcmd: echo ${CKS_TPL_DEFINITELY_UNSET}", &HashMap::new());
        assert_eq!(out, "runcmd: echo ${CKS_TPL_DEFINITELY_UNSET}");
    }

    #[test]
    fn test_non_placeholder_dollars_untouched() {
        let out = substitute("price is $5, pid is $$, brace ${", &HashMap::new());
        assert_eq!(out, "price is $5, pid is $$, brace ${");
    }

    #[test]
    fn test_render_missing_template() {
        let store = TemplateStore::from_map(HashMap::new());
        let err = store.render("worker-node-vm.yaml", &HashMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Missing(_)));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: VirtualMachine").unwrap();
        std::fs::write(dir.path().join("b.yml"), "kind: Secret").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TemplateStore::load(dir.path()).unwrap();
        assert!(store.render("a.yaml", &HashMap::new()).is_ok());
        assert!(store.render("b.yml", &HashMap::new()).is_ok());
        assert!(store.render("notes.txt", &HashMap::new()).is_err());
    }
}
