//! Workflow file loading.
//!
//! A workflow file is a YAML mapping whose key order is kept: the order of
//! `+task` keys decides the default dependency chain. The workflow name is
//! the file name without its extension.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use taskflow_types::document::Document;
use taskflow_types::workflow::WorkflowDefinition;

/// Extensions stripped from a workflow file name.
const WORKFLOW_EXTENSIONS: &[&str] = &["dig", "yml", "yaml"];

/// Read and parse a workflow file. Does not compile it.
pub async fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = workflow_name(path)?;
    parse_workflow_yaml(&name, &content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_workflow_yaml(name: &str, yaml: &str) -> Result<WorkflowDefinition> {
    let value: Value = serde_yaml_ng::from_str(yaml)?;
    let config = Document::from_value(value)?;
    Ok(WorkflowDefinition::new(name, config))
}

fn workflow_name(path: &Path) -> Result<String> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        bail!("{} is not a workflow file", path.display());
    };
    let name = match file_name.rsplit_once('.') {
        Some((stem, ext)) if WORKFLOW_EXTENSIONS.contains(&ext) => stem,
        _ => file_name,
    };
    if name.is_empty() {
        bail!("{} is not a workflow file", path.display());
    }
    Ok(name.to_string())
}

/// Parse repeated `key=value` arguments into session parameters.
pub fn parse_params(params: &[String]) -> Result<Document> {
    let mut doc = Document::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("parameter '{param}' must be key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("parameter '{param}' has an empty key");
        }
        doc.set(key, value.to_string());
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_parse_keeps_key_order() {
        let def = parse_workflow_yaml(
            "etl",
            "timezone: Asia/Tokyo\n+load:\n  sh>: echo load\n+extract:\n  sh>: echo extract\n",
        )
        .unwrap();
        let keys: Vec<&String> = def.config.keys().collect();
        assert_eq!(keys, ["timezone", "+load", "+extract"]);
        assert_eq!(def.timezone, "Asia/Tokyo");
    }

    #[test]
    fn test_parse_rejects_non_mapping() {
        assert!(parse_workflow_yaml("etl", "- a\n- b\n").is_err());
    }

    #[test]
    fn test_workflow_name_strips_known_extensions() {
        assert_eq!(workflow_name(&PathBuf::from("flows/etl.dig")).unwrap(), "etl");
        assert_eq!(workflow_name(&PathBuf::from("daily.report.yml")).unwrap(), "daily.report");
        assert_eq!(workflow_name(&PathBuf::from("plain")).unwrap(), "plain");
    }

    #[tokio::test]
    async fn test_load_workflow_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.dig");
        tokio::fs::write(&path, "+say:\n  echo>: hello\n").await.unwrap();

        let def = load_workflow_file(&path).await.unwrap();
        assert_eq!(def.name, "hello");
        assert_eq!(def.timezone, "UTC");
        assert!(def.config.has("+say"));
    }

    #[tokio::test]
    async fn test_load_missing_file_names_path() {
        let err = load_workflow_file(&PathBuf::from("/nonexistent/wf.dig")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wf.dig"));
    }

    #[test]
    fn test_parse_params() {
        let doc = parse_params(&["target=prod".to_string(), "expr=a=b".to_string()]).unwrap();
        assert_eq!(doc.get_str("target").unwrap(), "prod");
        assert_eq!(doc.get_str("expr").unwrap(), "a=b");
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=x".to_string()]).is_err());
    }
}
