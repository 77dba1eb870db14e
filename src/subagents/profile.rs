//! 子代理 profile：名称、触发模式、专用系统指令

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubagentProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 大小写不敏感的正则，任一匹配即命中
    pub trigger_patterns: Vec<String>,
    /// 替换默认系统提示词的专用指令
    pub instruction: String,
}

impl SubagentProfile {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        trigger_patterns: &[&str],
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            trigger_patterns: trigger_patterns.iter().map(|p| p.to_string()).collect(),
            instruction: instruction.into(),
        }
    }

    /// 回合开始前展示给用户的委派提示
    pub fn notice(&self) -> String {
        format!("Using {} specialist...", self.name)
    }
}

const CODE_REVIEWER_INSTRUCTION: &str = "You are a senior code reviewer with expertise in security, performance, and maintainability.

Your review process:
1. Analyze code structure and patterns
2. Identify security vulnerabilities and anti-patterns
3. Assess performance implications and bottlenecks
4. Check adherence to coding standards
5. Provide prioritized, actionable feedback with specific line references

Focus on the most impactful issues first. For each issue found, explain the problem,
give a specific fix, and state the severity (Critical, High, Medium, Low).
Security vulnerabilities and performance issues take priority over style.";

const DEBUG_SPECIALIST_INSTRUCTION: &str = "You are a debugging specialist with systematic problem-solving expertise.

Your debugging methodology:
1. Error analysis: examine error messages, stack traces and symptoms
2. Context investigation: understand the code around the failure
3. Reproduction: find a reliable way to reproduce the issue
4. Root cause: identify the underlying cause, not just the symptom
5. Minimal fix: provide a targeted solution
6. Verification: explain how to confirm the fix works

Ask clarifying questions when the error description is incomplete.";

/// 内置 profile，按优先级排列（先匹配者胜出）
pub fn builtin_profiles() -> Vec<SubagentProfile> {
    vec![
        SubagentProfile::new(
            "code-reviewer",
            "Specialized code review and security analysis",
            &[
                r"review.*code",
                r"code.*review",
                r"check.*security",
                r"analyze.*quality",
                r"audit.*code",
                r"security.*analysis",
                r"code.*audit",
                r"review.*security",
                r"check.*vulnerabilit",
                r"security.*check",
            ],
            CODE_REVIEWER_INSTRUCTION,
        ),
        SubagentProfile::new(
            "debug-specialist",
            "Systematic debugging and error resolution",
            &[
                r"debug.*error",
                r"fix.*bug",
                r"troubleshoot.*issue",
                r"analyze.*crash",
                r"investigate.*failure",
                r"error.*analysis",
                r"debugging.*help",
                r"solve.*error",
                r"bug.*fix",
                r"crash.*analysis",
                r"exception.*debug",
                r"debug.*exception",
                r"help.*debug",
                r"stack.*trace",
            ],
            DEBUG_SPECIALIST_INSTRUCTION,
        ),
    ]
}
