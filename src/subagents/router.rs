//! 任务路由（子代理分类器）
//!
//! 按 profile 顺序逐个匹配首条用户输入（小写化后，正则大小写不敏感），首个命中者胜出。
//! 模式在构造时编译，非法模式是启动期错误；classify 本身纯函数、不会失败。

use regex::{Regex, RegexBuilder};

use crate::core::AgentError;
use crate::subagents::{builtin_profiles, SubagentProfile};

struct CompiledProfile {
    profile: SubagentProfile,
    patterns: Vec<Regex>,
}

pub struct TaskRouter {
    profiles: Vec<CompiledProfile>,
}

impl TaskRouter {
    pub fn new(profiles: Vec<SubagentProfile>) -> Result<Self, AgentError> {
        let mut compiled: Vec<CompiledProfile> = Vec::with_capacity(profiles.len());
        for profile in profiles {
            if compiled.iter().any(|c| c.profile.name == profile.name) {
                return Err(AgentError::RoutingConfig(format!(
                    "duplicate profile name '{}'",
                    profile.name
                )));
            }
            let patterns = profile
                .trigger_patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p).case_insensitive(true).build().map_err(|e| {
                        AgentError::RoutingConfig(format!(
                            "invalid pattern '{p}' in profile '{}': {e}",
                            profile.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            compiled.push(CompiledProfile { profile, patterns });
        }
        Ok(Self { profiles: compiled })
    }

    pub fn with_builtin() -> Result<Self, AgentError> {
        Self::new(builtin_profiles())
    }

    /// 不做任何路由
    pub fn empty() -> Self {
        Self {
            profiles: Vec::new(),
        }
    }

    /// 返回首个匹配的 profile；空输入或无匹配返回 None
    pub fn classify(&self, text: &str) -> Option<&SubagentProfile> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        let matched = self
            .profiles
            .iter()
            .find(|c| c.patterns.iter().any(|re| re.is_match(&text)))
            .map(|c| &c.profile);
        match matched {
            Some(profile) => tracing::info!(profile = %profile.name, "task routed to subagent"),
            None => tracing::debug!("no subagent matched"),
        }
        matched
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.iter().map(|c| c.profile.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_routing() {
        let router = TaskRouter::with_builtin().unwrap();
        assert_eq!(
            router.classify("Review this code for security issues").map(|p| p.name.as_str()),
            Some("code-reviewer")
        );
        assert_eq!(
            router.classify("Debug this error message").map(|p| p.name.as_str()),
            Some("debug-specialist")
        );
        assert!(router.classify("What's the weather like?").is_none());
        assert!(router.classify("   ").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let router = TaskRouter::with_builtin().unwrap();
        // 同时命中 "review.*code" 与 "fix.*bug"，按顺序取 code-reviewer
        let profile = router.classify("review the code and fix the bug").unwrap();
        assert_eq!(profile.name, "code-reviewer");
    }

    #[test]
    fn test_classification_is_deterministic() {
        let router = TaskRouter::with_builtin().unwrap();
        let first = router.classify("please help me debug").map(|p| p.name.clone());
        for _ in 0..10 {
            assert_eq!(router.classify("please help me debug").map(|p| p.name.clone()), first);
        }
    }

    #[test]
    fn test_invalid_pattern_fails_at_construction() {
        let profile = SubagentProfile::new("bad", "", &["(unclosed"], "x");
        let err = TaskRouter::new(vec![profile]).err().unwrap();
        assert!(matches!(err, AgentError::RoutingConfig(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = SubagentProfile::new("same", "", &["a"], "x");
        let b = SubagentProfile::new("same", "", &["b"], "y");
        assert!(TaskRouter::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_empty_router() {
        let router = TaskRouter::empty();
        assert!(router.classify("review this code").is_none());
        assert!(router.profile_names().is_empty());
    }
}
