//! 联系方式检测与违规升级策略
//!
//! 纯函数，不涉及存储。持久化与副作用由应用层的审核服务负责。

use once_cell::sync::Lazy;
use regex::Regex;

/// 电话号码形状的子串：可选国家码前缀，随后是 3-3-4 分组，分隔符可为空格、点或短横线。
///
/// 只匹配 ASCII 数字，全角或其他文字的数字不算。
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+[0-9]{1,2}\s?)?\(?[0-9]{3}\)?[\s.-]?[0-9]{3}[\s.-]?[0-9]{4}")
        .expect("phone pattern is a valid regex")
});

/// 返回第一个匹配到的联系方式子串。
pub fn detect_contact(content: &str) -> Option<&str> {
    PHONE_PATTERN.find(content).map(|m| m.as_str())
}

/// 根据累计违规次数决定的处置动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// 仅记录违规
    None,
    /// 第 4 次：发出警告
    Warn,
    /// 第 5 次：标记账号
    Flag,
    /// 第 6 次及以后：封禁账号
    Block,
}

impl EscalationAction {
    /// 警告和标记只在恰好达到 4、5 次时触发一次；封禁对 6 次及以上都生效。
    pub fn for_count(incident_count: u64) -> Self {
        match incident_count {
            4 => Self::Warn,
            5 => Self::Flag,
            count if count >= 6 => Self::Block,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_phone_shapes() {
        assert_eq!(detect_contact("call me at 555-123-4567"), Some("555-123-4567"));
        assert_eq!(detect_contact("5551234567 anytime"), Some("5551234567"));
        assert_eq!(detect_contact("ring (555) 123 4567"), Some("(555) 123 4567"));
        assert_eq!(detect_contact("+1 555.123.4567"), Some("+1 555.123.4567"));
    }

    #[test]
    fn returns_first_match_only() {
        assert_eq!(
            detect_contact("555-123-4567 or 555-765-4321"),
            Some("555-123-4567")
        );
    }

    #[test]
    fn ignores_text_without_phone_numbers() {
        assert_eq!(detect_contact("hello there"), None);
        assert_eq!(detect_contact("my pin is 1234"), None);
        assert_eq!(detect_contact("555-1234"), None);
    }

    #[test]
    fn ignores_non_ascii_digits() {
        assert_eq!(detect_contact("رقمي ٥٥٥-١٢٣-٤٥٦٧"), None);
        assert_eq!(detect_contact("５５５１２３４５６７"), None);
        assert_eq!(detect_contact("٥٥٥-123-4567"), None);
    }

    #[test]
    fn escalation_triggers_on_exact_counts() {
        for count in 0..=3 {
            assert_eq!(EscalationAction::for_count(count), EscalationAction::None);
        }
        assert_eq!(EscalationAction::for_count(4), EscalationAction::Warn);
        assert_eq!(EscalationAction::for_count(5), EscalationAction::Flag);
        for count in [6, 7, 10, 100] {
            assert_eq!(EscalationAction::for_count(count), EscalationAction::Block);
        }
    }
}
