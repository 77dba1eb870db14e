//! 子代理 profile 文件加载
//!
//! ```toml
//! [[profile]]
//! name = "doc-writer"
//! description = "Documentation"
//! trigger_patterns = ["write.*docs?"]
//! instruction = "You write clear technical documentation."
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::core::AgentError;
use crate::subagents::SubagentProfile;

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profile: Vec<SubagentProfile>,
}

/// 解析 profile TOML 文本
pub fn parse_profiles(content: &str) -> Result<Vec<SubagentProfile>, AgentError> {
    let file: ProfileFile = toml::from_str(content)
        .map_err(|e| AgentError::RoutingConfig(format!("invalid profile file: {e}")))?;
    Ok(file.profile)
}

/// 读取并解析 profile 文件
pub fn load_profiles(path: impl AsRef<Path>) -> Result<Vec<SubagentProfile>, AgentError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::RoutingConfig(format!("cannot read {}: {e}", path.display()))
    })?;
    let profiles = parse_profiles(&content)?;
    tracing::info!(path = %path.display(), count = profiles.len(), "loaded subagent profiles");
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_profiles_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[profile]]
name = "doc-writer"
trigger_patterns = ["write.*docs?"]
instruction = "You write documentation."

[[profile]]
name = "tester"
description = "Writes tests"
trigger_patterns = ["write.*tests?", "add.*coverage"]
instruction = "You write tests."
"#
        )
        .unwrap();

        let profiles = load_profiles(file.path()).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "doc-writer");
        assert_eq!(profiles[0].description, "");
        assert_eq!(profiles[1].trigger_patterns.len(), 2);
    }

    #[test]
    fn test_missing_file_is_routing_error() {
        let err = load_profiles("/nonexistent/profiles.toml").unwrap_err();
        assert!(matches!(err, AgentError::RoutingConfig(_)));
    }

    #[test]
    fn test_missing_field_is_routing_error() {
        let err = parse_profiles("[[profile]]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, AgentError::RoutingConfig(_)));
    }
}
