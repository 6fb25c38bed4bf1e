use serde::{Deserialize, Serialize};

/// What the guard does with a span matched by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardAction {
    /// Delete the matched span.
    Strip,
    /// Replace the matched span with a fixed marker.
    Redact { marker: String },
}

/// One entry of the injection pattern table.
///
/// Patterns are matched case-insensitively regardless of inline flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRule {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_action")]
    pub action: GuardAction,
}

fn default_action() -> GuardAction {
    GuardAction::Strip
}

impl GuardRule {
    pub fn strip(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            action: GuardAction::Strip,
        }
    }
}

/// Built-in pattern table: instruction overrides, persona switches and
/// chat-template role tags, in English and Chinese.
pub fn builtin_rules() -> Vec<GuardRule> {
    vec![
        // Instruction overrides
        GuardRule::strip(
            "ignore_rules",
            r"\bignore\s+(?:all\s+|any\s+|the\s+|your\s+|previous\s+|prior\s+|above\s+)*(?:rules?|restrictions?|instructions?|prompts?|guidelines?)\b",
        ),
        GuardRule::strip(
            "disregard_instructions",
            r"\bdisregard\s+(?:all\s+|any\s+|the\s+|your\s+|previous\s+|prior\s+|above\s+)*(?:rules?|restrictions?|instructions?|prompts?)\b",
        ),
        GuardRule::strip(
            "forget_instructions",
            r"\bforget\s+(?:everything\s+|all\s+|your\s+|the\s+|previous\s+|prior\s+|above\s+)+(?:rules?|instructions?|prompts?)\b",
        ),
        GuardRule::strip("new_instructions", r"\bnew\s+instructions?\s*:"),
        GuardRule::strip(
            "unconditional_obedience",
            r"\bunconditionally\s+(?:obey|comply|follow)\b",
        ),
        // Persona switches
        GuardRule::strip(
            "act_as_persona",
            r"\bact\s+as\s+(?:(?:a|an|my|the)\s+)?[\w-]+",
        ),
        GuardRule::strip(
            "pretend_persona",
            r"\bpretend\s+(?:you\s+are|to\s+be)\s+(?:(?:a|an|my|the)\s+)?[\w-]+",
        ),
        GuardRule::strip("you_are_now", r"\byou\s+are\s+now\s+(?:a|an|my|the)\s+[\w-]+"),
        GuardRule::strip("jailbreak_mode", r"\b(?:DAN|do\s+anything\s+now|developer)\s+mode\b"),
        // Chat-template role tags. A bare "system:" only counts at the start
        // of a line, where a chat transcript would put it.
        GuardRule::strip("system_tag", r"(?m:^[ \t]*)(?:system|assistant)[ \t]*:"),
        GuardRule::strip("llama_tags", r"<<SYS>>|<</SYS>>|\[/?INST\]"),
        GuardRule::strip("chatml_tags", r"<\|im_(?:start|end)\|>"),
        // Chinese variants
        GuardRule::strip(
            "ignore_rules_zh",
            r"(?:忽略|无视|忘记)(?:之前的|以上的|上面的|所有的?|全部的?)?(?:规则|限制|指令|要求|提示)",
        ),
        GuardRule::strip("unconditional_obedience_zh", r"无条件(?:服从|遵守|执行)"),
        GuardRule::strip("act_as_persona_zh", r"(?:扮演|假装你是|你现在是)\s*\S{1,10}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_have_unique_names() {
        let rules = builtin_rules();
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), rules.len());
    }

    #[test]
    fn builtin_rules_compile() {
        for rule in builtin_rules() {
            assert!(regex::Regex::new(&rule.pattern).is_ok(), "{}", rule.name);
        }
    }

    #[test]
    fn rule_deserializes_with_default_action() {
        let json = r#"{"name": "custom", "pattern": "obey\\s+me"}"#;
        let rule: GuardRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.action, GuardAction::Strip);
    }

    #[test]
    fn redact_action_round_trips_from_config() {
        let json = r#"{"name": "c", "pattern": "x", "action": {"type": "redact", "marker": "[FILTERED]"}}"#;
        let rule: GuardRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule.action,
            GuardAction::Redact {
                marker: "[FILTERED]".into()
            }
        );
    }
}
