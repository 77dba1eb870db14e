//! Kimi 内联工具调用标记
//!
//! 部分 OpenAI 兼容端点（Moonshot/Kimi）在未返回结构化 tool_calls 时，会把调用以特殊标记写进正文：
//!
//! ```text
//! <|tool_calls_section_begin|>
//! <|tool_call_begin|>functions.read_file:0<|tool_call_argument_begin|>{"path": "a.rs"}<|tool_call_end|>
//! <|tool_calls_section_end|>
//! ```
//!
//! MarkerScanner 接收流式文本，把标记段从可见文本中剔除并解析出调用；
//! 行尾可能是标记前缀的片段会暂缓输出，直到能判断为止。

use serde_json::Value;

use crate::memory::ToolInvocation;

pub const SECTION_BEGIN: &str = "<|tool_calls_section_begin|>";
pub const SECTION_END: &str = "<|tool_calls_section_end|>";
pub const CALL_BEGIN: &str = "<|tool_call_begin|>";
pub const ARGUMENT_BEGIN: &str = "<|tool_call_argument_begin|>";
pub const CALL_END: &str = "<|tool_call_end|>";

/// 流式标记扫描器
#[derive(Debug, Default)]
pub struct MarkerScanner {
    buffer: String,
    in_section: bool,
    invocations: Vec<ToolInvocation>,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段文本，返回可以立即展示的部分
    pub fn push(&mut self, text: &str) -> String {
        self.buffer.push_str(text);
        let mut visible = String::new();

        loop {
            if self.in_section {
                let Some(end) = self.buffer.find(SECTION_END) else {
                    break;
                };
                let parsed = parse_section(&self.buffer[..end], self.invocations.len());
                self.invocations.extend(parsed);
                self.buffer.drain(..end + SECTION_END.len());
                self.in_section = false;
            } else if let Some(begin) = self.buffer.find(SECTION_BEGIN) {
                visible.push_str(&self.buffer[..begin]);
                self.buffer.drain(..begin + SECTION_BEGIN.len());
                self.in_section = true;
            } else {
                let split = self.buffer.len() - partial_marker_len(&self.buffer, SECTION_BEGIN);
                visible.push_str(&self.buffer[..split]);
                self.buffer.drain(..split);
                break;
            }
        }

        visible
    }

    /// 流结束：返回仍需展示的文本。未闭合的标记段若能解析出调用则按调用处理，否则原样还给正文
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        if !self.in_section {
            return rest;
        }
        self.in_section = false;

        let parsed = parse_section(&rest, self.invocations.len());
        if parsed.is_empty() {
            format!("{SECTION_BEGIN}{rest}")
        } else {
            self.invocations.extend(parsed);
            String::new()
        }
    }

    /// 取出目前解析到的调用
    pub fn take_invocations(&mut self) -> Vec<ToolInvocation> {
        std::mem::take(&mut self.invocations)
    }
}

/// buffer 末尾与 marker 前缀重合的最大长度（marker 为 ASCII，截断点必在字符边界上）
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| buffer.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// 解析标记段内的所有调用；offset 用于给无 id 的调用编号
pub fn parse_section(section: &str, offset: usize) -> Vec<ToolInvocation> {
    section
        .split(CALL_BEGIN)
        .skip(1)
        .filter_map(|item| {
            let body = item.split(CALL_END).next().unwrap_or(item).trim();
            parse_call(body)
        })
        .enumerate()
        .map(|(i, (id, name, arguments))| {
            let id = id.unwrap_or_else(|| format!("call_marker_{}", offset + i));
            ToolInvocation::new(id, name, arguments)
        })
        .collect()
}

/// 两种格式：`functions.NAME:IDX<|tool_call_argument_begin|>{json}`，或 `{"name": ..., "arguments": ...}`
fn parse_call(body: &str) -> Option<(Option<String>, String, Value)> {
    if let Some((head, args)) = body.split_once(ARGUMENT_BEGIN) {
        let head = head.trim();
        let name = head
            .trim_start_matches("functions.")
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if name.is_empty() {
            return None;
        }
        return Some((Some(head.to_string()), name, parse_arguments(args)));
    }

    let value: Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("args"))
        .map(|a| match a {
            Value::String(raw) => parse_arguments(raw),
            other => other.clone(),
        })
        .unwrap_or_else(|| Value::Object(Default::default()));
    let id = value.get("id").and_then(|v| v.as_str()).map(str::to_string);
    Some((id, name, arguments))
}

/// 参数串解析：空串视为 {}，解析失败保留原文交给参数校验
pub fn parse_arguments(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECTION: &str = "<|tool_calls_section_begin|><|tool_call_begin|>functions.read_file:0<|tool_call_argument_begin|>{\"path\": \"a.rs\"}<|tool_call_end|><|tool_calls_section_end|>";

    #[test]
    fn test_plain_text_passes_through() {
        let mut scanner = MarkerScanner::new();
        assert_eq!(scanner.push("hello "), "hello ");
        assert_eq!(scanner.push("world"), "world");
        assert_eq!(scanner.finish(), "");
        assert!(scanner.take_invocations().is_empty());
    }

    #[test]
    fn test_section_is_hidden_and_parsed() {
        let mut scanner = MarkerScanner::new();
        let visible = scanner.push(&format!("Let me look.{SECTION}"));
        assert_eq!(visible, "Let me look.");
        let calls = scanner.take_invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "read_file");
        assert_eq!(calls[0].id, "functions.read_file:0");
        assert_eq!(calls[0].arguments, json!({"path": "a.rs"}));
    }

    #[test]
    fn test_markers_split_across_chunks() {
        let mut scanner = MarkerScanner::new();
        let mut visible = String::new();
        for piece in format!("ok {SECTION} bye").as_bytes().chunks(5) {
            visible.push_str(&scanner.push(std::str::from_utf8(piece).unwrap()));
        }
        visible.push_str(&scanner.finish());
        assert_eq!(visible, "ok  bye");
        assert_eq!(scanner.take_invocations().len(), 1);
    }

    #[test]
    fn test_partial_prefix_is_released_when_not_a_marker() {
        let mut scanner = MarkerScanner::new();
        assert_eq!(scanner.push("a <|tool"), "a ");
        assert_eq!(scanner.push("s are fun"), "<|tools are fun");
    }

    #[test]
    fn test_json_call_format() {
        let section = r#"<|tool_call_begin|>{"name": "echo", "arguments": "{\"text\": \"hi\"}"}<|tool_call_end|><|tool_call_begin|>{"name": "echo", "args": {"text": "again"}}<|tool_call_end|>"#;
        let calls = parse_section(section, 0);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({"text": "hi"}));
        assert_eq!(calls[1].arguments, json!({"text": "again"}));
        assert_eq!(calls[1].id, "call_marker_1");
    }

    #[test]
    fn test_unterminated_section_without_calls_is_returned_as_text() {
        let mut scanner = MarkerScanner::new();
        assert_eq!(scanner.push("x<|tool_calls_section_begin|>oops"), "x");
        assert_eq!(scanner.finish(), "<|tool_calls_section_begin|>oops");
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_arguments("{bad"), json!("{bad"));
    }
}
