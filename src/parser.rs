//! Turns a free-form model reply into a [`ParsedResponse`].
//!
//! Two reply shapes are understood. The JSON shape the system prompt asks for:
//!
//! ```text
//! {"thought": "...", "action": {"type": "click", "params": {"x": 10, "y": 20}}, "status": "in_progress"}
//! ```
//!
//! and the looser section-header shape many models drift into:
//!
//! ```text
//! Thought: the run dialog is open
//! Action: type_text("notepad")
//! ```
//!
//! Parsing never fails. Anything that cannot be turned into an action comes back
//! as [`Action::Unparsable`] with the reason attached. When a reply contains more
//! than one action, the last one wins.

use crate::action::{Action, MouseButton, ParsedResponse, ScrollDirection};
use regex::{Match, Regex};
use serde_json::{Map, Value};
use std::ops::Range;
use std::sync::OnceLock;

const DEFAULT_DONE_MESSAGE: &str = "Task completed";
const DEFAULT_FAIL_REASON: &str = "Model declared the task unachievable";
const DEFAULT_SCROLL_AMOUNT: u32 = 3;
const DEFAULT_WAIT_MS: u64 = 1000;
const PREVIEW_CHARS: usize = 200;

/// Parses a raw model reply. Pure: the same input always yields the same value.
pub fn parse(raw: &str) -> ParsedResponse {
    let text = strip_reasoning_markers(raw);
    let text = text.trim();
    if text.is_empty() {
        return ParsedResponse::unparsable("Model returned an empty reply", "empty reply");
    }

    let spans = json_object_spans(text);
    match last_json_action(&spans) {
        Some((at, obj)) if section_offset(text, &spans).map_or(true, |s| at > s) => from_json(&obj),
        _ => from_sections(text),
    }
}

/// Where the last section-style directive starts: an `Action:` marker or a
/// known call outside any JSON object.
fn section_offset(text: &str, spans: &[(usize, &str)]) -> Option<usize> {
    let marker = last_action_marker(text).map(|m| m.start());
    let call = find_calls(text)
        .into_iter()
        .rev()
        .filter(|c| !spans.iter().any(|(at, span)| (*at..at + span.len()).contains(&c.offset)))
        .find(|c| Verb::from_name(c.verb).is_some())
        .map(|c| c.offset);
    marker.max(call)
}

// ========================= Pre-processing =========================

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn think_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)(^|\s)/(no_)?think\b").expect("static regex"))
}

fn strip_reasoning_markers(raw: &str) -> String {
    let without_blocks = think_block().replace_all(raw, "");
    think_marker().replace_all(&without_blocks, "$1").into_owned()
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

// ========================= JSON replies =========================

/// Top-level `{...}` spans in `text` with their byte offsets, skipping braces
/// inside string literals.
fn json_object_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push((s, &text[s..=i]));
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

/// An object counts as an action when it has an `action` key or a `type`
/// naming a known verb; `{"type": "info"}` quoted in prose does not.
fn last_json_action(spans: &[(usize, &str)]) -> Option<(usize, Map<String, Value>)> {
    spans.iter().rev().find_map(|&(at, span)| match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(obj)) if is_json_action(&obj) => Some((at, obj)),
        _ => None,
    })
}

fn is_json_action(obj: &Map<String, Value>) -> bool {
    obj.contains_key("action")
        || obj
            .get("type")
            .and_then(|v| v.as_str())
            .is_some_and(|t| Verb::from_name(t).is_some())
}

fn from_json(obj: &Map<String, Value>) -> ParsedResponse {
    let thought = obj
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    let action = match obj.get("action") {
        Some(Value::Object(action)) => json_action(action, &thought),
        Some(Value::String(call)) => call_action(call, &thought),
        Some(other) => Err(format!("invalid action format: {other}")),
        None => json_action(obj, &thought),
    };

    let declared = obj
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase());

    let action = match (declared.as_deref(), action) {
        (Some("completed" | "complete" | "done" | "success"), Ok(a)) if a.is_executable() => {
            Ok(Action::Done { message: non_empty_or(&thought, DEFAULT_DONE_MESSAGE) })
        }
        (Some("failed" | "fail" | "failure"), Ok(a)) if a.is_executable() => {
            Ok(Action::Failed { reason: non_empty_or(&thought, DEFAULT_FAIL_REASON) })
        }
        (_, action) => action,
    };

    finish(thought, action)
}

fn json_action(action: &Map<String, Value>, thought: &str) -> Result<Action, String> {
    let verb = action
        .get("type")
        .or_else(|| action.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| "action has no type".to_string())?;

    let params = match action.get("params").or_else(|| action.get("arguments")) {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Null) | None => {
            let mut flat = action.clone();
            flat.remove("type");
            flat.remove("name");
            flat
        }
        Some(other) => return Err(format!("invalid params format: {other}")),
    };

    let args = Args(
        params
            .iter()
            .map(|(k, v)| Arg { name: Some(k.to_ascii_lowercase()), value: ArgValue::from_json(v) })
            .collect(),
    );
    let verb = Verb::from_name(verb).ok_or_else(|| format!("unknown action '{verb}'"))?;
    verb.build(&args, thought)
}

// ========================= Section replies =========================

fn action_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\*{0,2}\baction\b\*{0,2}\s*[:：]\*{0,2}").expect("static regex"))
}

fn thought_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\*{0,2}\b(thought|thinking|reasoning)\b\*{0,2}\s*[:：]\*{0,2}").expect("static regex")
    })
}

fn call_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\(").expect("static regex"))
}

/// Byte ranges of double-quoted strings and parenthesised argument lists.
/// A quote left open at the end of a line is taken as prose, not a string.
fn enclosed_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
                if depth == 0 {
                    ranges.push(start..i + 1);
                }
            } else if c == '\n' && depth == 0 {
                quote = None;
            }
            continue;
        }
        match c {
            '"' => {
                quote = Some('"');
                if depth == 0 {
                    start = i;
                }
            }
            '\'' if depth > 0 => quote = Some('\''),
            '(' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            ')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    ranges.push(start..i + 1);
                }
            }
            _ => {}
        }
    }
    ranges
}

fn outside(marker: Match<'_>, ranges: &[Range<usize>]) -> bool {
    !ranges.iter().any(|r| r.contains(&marker.start()))
}

/// The last `Action:` marker that is not part of a quoted string or call argument.
fn last_action_marker(text: &str) -> Option<Match<'_>> {
    let ranges = enclosed_ranges(text);
    action_marker().find_iter(text).filter(|m| outside(*m, &ranges)).last()
}

/// Splits a section-style reply into its thought and candidate action text.
fn split_sections(text: &str) -> (String, String) {
    let ranges = enclosed_ranges(text);
    let action_at = last_action_marker(text);
    let thought_at = thought_marker().find_iter(text).find(|m| outside(*m, &ranges));

    match (thought_at, action_at) {
        (Some(t), Some(a)) if t.end() <= a.start() => {
            (text[t.end()..a.start()].trim().to_string(), text[a.end()..].trim().to_string())
        }
        (_, Some(a)) => (text[..a.start()].trim().to_string(), text[a.end()..].trim().to_string()),
        (Some(t), None) => {
            let rest = &text[t.end()..];
            match rest.find('\n') {
                Some(nl) => (rest[..nl].trim().to_string(), rest[nl..].trim().to_string()),
                None => (rest.trim().to_string(), String::new()),
            }
        }
        (None, None) => (String::new(), text.to_string()),
    }
}

fn from_sections(text: &str) -> ParsedResponse {
    let (mut thought, candidate) = split_sections(text);
    if candidate.is_empty() {
        let reason = format!("no action found in reply: {}", preview(text));
        return finish(thought, Err(reason));
    }

    let calls = find_calls(&candidate);
    let chosen = calls
        .iter()
        .rev()
        .find_map(|call| Verb::from_name(call.verb).map(|verb| (call, verb)));

    let action = match chosen {
        Some((call, verb)) => {
            if thought.is_empty() {
                thought = candidate[..call.offset].trim().to_string();
            }
            split_args(call.args).and_then(|args| verb.build(&args, &thought))
        }
        None => match calls.last() {
            Some(call) => Err(format!("unknown action '{}'", call.verb)),
            None => bare_verb(&candidate, &thought),
        },
    };
    finish(thought, action)
}

/// Parses a single call string such as `click(10, 20)`.
fn call_action(call: &str, thought: &str) -> Result<Action, String> {
    let calls = find_calls(call);
    match calls.last() {
        Some(c) => {
            let verb = Verb::from_name(c.verb).ok_or_else(|| format!("unknown action '{}'", c.verb))?;
            verb.build(&split_args(c.args)?, thought)
        }
        None => bare_verb(call, thought),
    }
}

/// A reply whose directive is a lone word, e.g. `Action: done`.
fn bare_verb(candidate: &str, thought: &str) -> Result<Action, String> {
    let trimmed = candidate.trim().trim_matches(|c: char| c == '`' || c == '*');
    let mut words = trimmed.splitn(2, char::is_whitespace);
    let word = words
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
    let rest = words.next().unwrap_or_default().trim().trim_start_matches([':', '-']).trim();

    match Verb::from_name(word) {
        Some(verb @ (Verb::Done | Verb::Failed)) => {
            let args = if rest.is_empty() {
                Args::default()
            } else {
                Args(vec![Arg { name: None, value: ArgValue::Text(rest.to_string()) }])
            };
            verb.build(&args, thought)
        }
        Some(_) => Err(format!("action '{word}' is missing its arguments")),
        None => Err(format!("no action found in reply: {}", preview(candidate))),
    }
}

fn finish(thought: String, action: Result<Action, String>) -> ParsedResponse {
    match action {
        Ok(action) => ParsedResponse::new(thought, action),
        Err(reason) => {
            let thought = if thought.is_empty() {
                format!("Failed to parse model reply: {reason}")
            } else {
                thought
            };
            ParsedResponse::unparsable(thought, reason)
        }
    }
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s.trim().to_string()
    }
}

// ========================= Calls and arguments =========================

struct Call<'a> {
    verb: &'a str,
    args: &'a str,
    offset: usize,
}

/// Every `verb(...)` in `text`, with balanced parentheses and quoted strings honoured.
fn find_calls(text: &str) -> Vec<Call<'_>> {
    let mut calls = Vec::new();
    let mut from = 0;
    while let Some(caps) = call_start().captures_at(text, from) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else { break };
        match closing_paren(text, whole.end()) {
            Some(close) => {
                calls.push(Call { verb: name.as_str(), args: &text[whole.end()..close], offset: whole.start() });
                from = close + 1;
            }
            None => from = whole.end(),
        }
    }
    calls
}

fn closing_paren(text: &str, open_end: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text[open_end..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open_end + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Clone, Debug, PartialEq)]
enum ArgValue {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl ArgValue {
    fn from_json(v: &Value) -> Self {
        match v {
            Value::String(s) => ArgValue::Text(s.clone()),
            Value::Number(n) => n.as_f64().map(ArgValue::Number).unwrap_or(ArgValue::Text(n.to_string())),
            Value::Bool(b) => ArgValue::Bool(*b),
            Value::Array(items) => ArgValue::List(
                items
                    .iter()
                    .map(|i| match i {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => ArgValue::Text(other.to_string()),
        }
    }

    fn from_token(token: &str) -> Self {
        let token = token.trim();
        if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            return ArgValue::List(
                split_top_level(inner)
                    .into_iter()
                    .map(|item| unquote(item.trim()))
                    .filter(|item| !item.is_empty())
                    .collect(),
            );
        }
        if is_quoted(token) {
            return ArgValue::Text(unquote(token));
        }
        match token.to_ascii_lowercase().as_str() {
            "true" => return ArgValue::Bool(true),
            "false" => return ArgValue::Bool(false),
            _ => {}
        }
        match token.parse::<f64>() {
            Ok(n) if n.is_finite() => ArgValue::Number(n),
            _ => ArgValue::Text(token.to_string()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => Some(*n),
            ArgValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    fn as_i32(&self) -> Option<i32> {
        self.as_f64()
            .map(f64::round)
            .filter(|n| *n >= i32::MIN as f64 && *n <= i32::MAX as f64)
            .map(|n| n as i32)
    }

    fn as_text(&self) -> Option<String> {
        match self {
            ArgValue::Text(s) => Some(s.clone()),
            ArgValue::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            ArgValue::Number(n) => Some(n.to_string()),
            ArgValue::Bool(b) => Some(b.to_string()),
            ArgValue::List(_) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            ArgValue::Number(n) => Some(*n != 0.0),
            ArgValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            ArgValue::List(_) => None,
        }
    }
}

fn is_quoted(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), token.chars().last()) {
        (Some(a), Some(b)) if token.len() >= 2 => a == b && matches!(a, '"' | '\'' | '`'),
        _ => false,
    }
}

fn unquote(token: &str) -> String {
    if !is_quoted(token) {
        return token.to_string();
    }
    let inner = &token[1..token.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits on commas that are outside quotes and brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn named_arg() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*[=:]\s*(.*)$").expect("static regex"))
}

fn split_args(inner: &str) -> Result<Args, String> {
    let mut args = Vec::new();
    for piece in split_top_level(inner) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let arg = match named_arg().captures(piece) {
            Some(caps) if !is_quoted(piece) && !caps[2].starts_with("//") => Arg {
                name: Some(caps[1].to_ascii_lowercase()),
                value: ArgValue::from_token(&caps[2]),
            },
            _ => Arg { name: None, value: ArgValue::from_token(piece) },
        };
        args.push(arg);
    }
    Ok(Args(args))
}

#[derive(Clone, Debug)]
struct Arg {
    name: Option<String>,
    value: ArgValue,
}

#[derive(Clone, Debug, Default)]
struct Args(Vec<Arg>);

impl Args {
    fn named(&self, names: &[&str]) -> Option<&ArgValue> {
        self.0
            .iter()
            .find(|a| a.name.as_deref().is_some_and(|n| names.contains(&n)))
            .map(|a| &a.value)
    }

    fn positional(&self) -> impl Iterator<Item = &ArgValue> {
        self.0.iter().filter(|a| a.name.is_none()).map(|a| &a.value)
    }

    fn get(&self, names: &[&str], pos: usize) -> Option<&ArgValue> {
        self.named(names).or_else(|| self.positional().nth(pos))
    }

    fn point(&self) -> Result<(i32, i32), String> {
        if let Some(ArgValue::List(items)) =
            self.named(&["coordinate", "coordinates", "point", "position", "pos"]).or_else(|| self.positional().next())
        {
            return match items.as_slice() {
                [x, y] => {
                    let x = ArgValue::from_token(x).as_i32().ok_or_else(|| format!("x is not an integer: {x}"))?;
                    let y = ArgValue::from_token(y).as_i32().ok_or_else(|| format!("y is not an integer: {y}"))?;
                    Ok((x, y))
                }
                _ => Err(format!("expected a point [x, y], got {} values", items.len())),
            };
        }
        let x = self.get(&["x"], 0).ok_or("missing x coordinate")?;
        let y = self.get(&["y"], 1).ok_or("missing y coordinate")?;
        let x = x.as_i32().ok_or_else(|| format!("x is not an integer: {x:?}"))?;
        let y = y.as_i32().ok_or_else(|| format!("y is not an integer: {y:?}"))?;
        Ok((x, y))
    }

    fn text(&self, names: &[&str]) -> Option<String> {
        self.get(names, 0).and_then(ArgValue::as_text)
    }
}

// ========================= Verb vocabulary =========================

#[derive(Clone, Copy, Debug, PartialEq)]
enum Verb {
    Move,
    Click(MouseButton, bool),
    TypeText,
    KeyPress,
    Hotkey,
    Scroll(Option<ScrollDirection>),
    Wait,
    Done,
    Failed,
}

impl Verb {
    fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase().replace('-', "_");
        let verb = match name.as_str() {
            "move" | "move_to" | "mouse_move" | "hover" => Verb::Move,
            "click" | "left_click" | "tap" => Verb::Click(MouseButton::Left, false),
            "double_click" | "doubleclick" | "dblclick" => Verb::Click(MouseButton::Left, true),
            "right_click" | "rightclick" => Verb::Click(MouseButton::Right, false),
            "middle_click" => Verb::Click(MouseButton::Middle, false),
            "type" | "type_text" | "typetext" | "write" | "input" | "input_text" => Verb::TypeText,
            "key" | "key_press" | "keypress" | "press" | "press_key" => Verb::KeyPress,
            "hotkey" | "key_combo" | "shortcut" => Verb::Hotkey,
            "scroll" => Verb::Scroll(None),
            "scroll_up" => Verb::Scroll(Some(ScrollDirection::Up)),
            "scroll_down" => Verb::Scroll(Some(ScrollDirection::Down)),
            "scroll_left" => Verb::Scroll(Some(ScrollDirection::Left)),
            "scroll_right" => Verb::Scroll(Some(ScrollDirection::Right)),
            "wait" | "sleep" | "pause" => Verb::Wait,
            "done" | "complete" | "completed" | "finish" | "finished" => Verb::Done,
            "failed" | "fail" | "abort" => Verb::Failed,
            _ => return None,
        };
        Some(verb)
    }

    fn build(self, args: &Args, thought: &str) -> Result<Action, String> {
        match self {
            Verb::Move => {
                let (x, y) = args.point()?;
                Ok(Action::Move { x, y })
            }
            Verb::Click(button, double) => click(args, button, double),
            Verb::TypeText => {
                let text = args
                    .text(&["text", "content", "value", "string"])
                    .ok_or("type_text requires a text argument")?;
                Ok(Action::TypeText { text })
            }
            Verb::KeyPress => key_press(args),
            Verb::Hotkey => {
                let keys = chord(args)?;
                Ok(Action::Hotkey { keys })
            }
            Verb::Scroll(fixed) => scroll(args, fixed),
            Verb::Wait => wait(args),
            Verb::Done => Ok(Action::Done {
                message: args
                    .text(&["message", "summary", "result", "text"])
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| non_empty_or(thought, DEFAULT_DONE_MESSAGE)),
            }),
            Verb::Failed => Ok(Action::Failed {
                reason: args
                    .text(&["reason", "message", "error", "text"])
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| non_empty_or(thought, DEFAULT_FAIL_REASON)),
            }),
        }
    }
}

fn click(args: &Args, button: MouseButton, double: bool) -> Result<Action, String> {
    let (x, y) = args.point()?;
    let button = match args.named(&["button"]).or_else(|| args.positional().nth(2)) {
        Some(v) => {
            let name = v.as_text().ok_or("button must be a name")?;
            MouseButton::from_name(&name).ok_or_else(|| format!("unknown mouse button '{name}'"))?
        }
        None => button,
    };
    let clicks = match args.named(&["clicks", "count"]) {
        Some(v) => v.as_i32().ok_or("clicks must be an integer")?,
        None => 1,
    };
    let double = double
        || clicks >= 2
        || args.named(&["double", "double_click"]).and_then(ArgValue::as_bool).unwrap_or(false);
    Ok(Action::Click { x, y, button, double })
}

fn split_chord(s: &str) -> Vec<String> {
    s.split('+').map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect()
}

fn key_press(args: &Args) -> Result<Action, String> {
    let value = args.get(&["key", "keys", "name"], 0).ok_or("key_press requires a key")?;
    if let ArgValue::List(keys) = value {
        return match keys.as_slice() {
            [] => Err("key_press requires a key".into()),
            [single] => Ok(Action::KeyPress { key: single.trim().to_string() }),
            _ => Ok(Action::Hotkey { keys: keys.iter().map(|k| k.trim().to_string()).collect() }),
        };
    }
    let key = value.as_text().ok_or("key must be a string")?;
    let chord = split_chord(&key);
    match chord.len() {
        0 => Err("key_press requires a key".into()),
        1 => Ok(Action::KeyPress { key: chord[0].clone() }),
        _ => Ok(Action::Hotkey { keys: chord }),
    }
}

fn chord(args: &Args) -> Result<Vec<String>, String> {
    let keys: Vec<String> = match args.named(&["keys", "key", "combo", "combination"]) {
        Some(ArgValue::List(keys)) => keys.clone(),
        Some(other) => split_chord(&other.as_text().ok_or("keys must be strings")?),
        None => {
            let mut keys = Vec::new();
            for v in args.positional() {
                match v {
                    ArgValue::List(items) => keys.extend(items.iter().cloned()),
                    other => keys.extend(split_chord(&other.as_text().ok_or("keys must be strings")?)),
                }
            }
            keys
        }
    };
    let keys: Vec<String> = keys.into_iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect();
    if keys.is_empty() {
        return Err("hotkey requires at least one key".into());
    }
    Ok(keys)
}

fn scroll(args: &Args, fixed: Option<ScrollDirection>) -> Result<Action, String> {
    let mut direction = fixed;
    let mut amount: Option<i32> = None;

    if let Some(v) = args.named(&["direction", "dir"]) {
        let name = v.as_text().ok_or("direction must be a name")?;
        direction = Some(ScrollDirection::from_name(&name).ok_or_else(|| format!("unknown scroll direction '{name}'"))?);
    }
    if let Some(v) = args.named(&["amount", "clicks", "delta", "distance"]) {
        amount = Some(v.as_i32().ok_or("scroll amount must be an integer")?);
    }
    for v in args.positional() {
        match v {
            ArgValue::Number(_) if amount.is_none() => amount = v.as_i32(),
            ArgValue::Text(t) if direction.is_none() => match ScrollDirection::from_name(t) {
                Some(d) => direction = Some(d),
                None => return Err(format!("unknown scroll direction '{t}'")),
            },
            _ => {}
        }
    }

    let (direction, amount) = match (direction, amount) {
        (Some(d), Some(a)) => (d, a.unsigned_abs()),
        (Some(d), None) => (d, DEFAULT_SCROLL_AMOUNT),
        (None, Some(a)) if a >= 0 => (ScrollDirection::Up, a.unsigned_abs()),
        (None, Some(a)) => (ScrollDirection::Down, a.unsigned_abs()),
        (None, None) => return Err("scroll requires a direction or an amount".into()),
    };
    if amount == 0 {
        return Err("scroll amount must be non-zero".into());
    }
    Ok(Action::Scroll { direction, amount })
}

fn wait(args: &Args) -> Result<Action, String> {
    let ms = if let Some(v) = args.named(&["ms", "milliseconds", "millis"]) {
        v.as_f64().ok_or("wait duration must be a number")?
    } else if let Some(v) = args.get(&["seconds", "secs", "duration", "time", "s"], 0) {
        v.as_f64().ok_or("wait duration must be a number")? * 1000.0
    } else {
        DEFAULT_WAIT_MS as f64
    };
    if ms < 0.0 {
        return Err("wait duration must not be negative".into());
    }
    Ok(Action::Wait { ms: ms.round() as u64 })
}
