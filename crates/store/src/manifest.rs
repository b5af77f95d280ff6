//! Reading multi-document YAML manifests from disk.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as Json;
use stagehand_core::ConfigError;
use tracing::debug;

/// One YAML document converted to JSON.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    /// Position of the document within its file.
    pub index: usize,
    pub body: Json,
}

/// Load a file, or every `.yaml`/`.yml` file under a directory in path order.
pub fn load_path(path: &Path) -> Result<Vec<Document>, ConfigError> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        collect_yaml(path, &mut files)?;
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut docs = Vec::new();
    for f in files {
        let source = f.display().to_string();
        let text = std::fs::read_to_string(&f).map_err(|e| manifest_err(&source, format!("reading: {}", e)))?;
        let parsed = parse_documents(&source, &text)?;
        debug!(file = %source, docs = parsed.len(), "manifest loaded");
        docs.extend(parsed);
    }
    metrics::counter!("catalog_documents_loaded", docs.len() as u64);
    Ok(docs)
}

fn collect_yaml(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let src = dir.display().to_string();
    let entries = std::fs::read_dir(dir).map_err(|e| manifest_err(&src, format!("listing: {}", e)))?;
    for entry in entries {
        let p = entry.map_err(|e| manifest_err(&src, format!("listing: {}", e)))?.path();
        if p.is_dir() {
            collect_yaml(&p, out)?;
        } else if matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            out.push(p);
        }
    }
    Ok(())
}

/// Split `---` separated documents. Empty documents are skipped.
pub fn parse_documents(source: &str, text: &str) -> Result<Vec<Document>, ConfigError> {
    let max = crate::max_yaml_bytes();
    if text.len() > max {
        return Err(manifest_err(source, format!("YAML payload too large (>{} bytes)", max)));
    }
    let mut out = Vec::new();
    for (index, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de)
            .map_err(|e| manifest_err(source, format!("parsing YAML document {}: {}", index, e)))?;
        if val.is_null() {
            continue;
        }
        let body = serde_json::to_value(val)
            .map_err(|e| manifest_err(source, format!("converting document {} to JSON: {}", index, e)))?;
        if !body.is_object() {
            return Err(manifest_err(source, format!("document {} is not a mapping", index)));
        }
        out.push(Document { source: source.to_string(), index, body });
    }
    Ok(out)
}

fn manifest_err(file: &str, reason: String) -> ConfigError {
    ConfigError::Manifest { file: file.to_string(), reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_documents_and_skips_empty() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n";
        let docs = parse_documents("t.yaml", y).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].body["kind"], "ConfigMap");
        assert_eq!(docs[1].body["kind"], "Secret");
        assert_eq!(docs[1].index, 2);
    }

    #[test]
    fn scalar_documents_are_rejected() {
        let e = parse_documents("t.yaml", "just a string\n").unwrap_err().to_string();
        assert!(e.contains("not a mapping"), "e={}", e);
    }

    #[test]
    fn loads_directory_in_path_order() {
        let dir = std::env::temp_dir().join(format!(
            "stagehand-manifest-{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("b.yaml"), "kind: B\n").unwrap();
        std::fs::write(dir.join("a.yml"), "kind: A\n").unwrap();
        std::fs::write(dir.join("nested/c.yaml"), "kind: C\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        let docs = load_path(&dir).unwrap();
        let kinds: Vec<_> = docs.iter().map(|d| d.body["kind"].as_str().unwrap().to_string()).collect();
        assert_eq!(kinds, vec!["A", "B", "C"]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
