//! String template rendering over context documents.
//!
//! Templates embed `{{ ... }}` placeholders. A placeholder body is either a
//! bare path expression (`{{steps.fetch.output.title}}`) or a helper call
//! (`{{json steps.fetch.output}}`). Placeholders resolve against the full
//! context document with pointer hydration, so a template never sees a
//! pointer wrapper. Placeholders that resolve to nothing render as the
//! empty string and record a warning event; an unknown helper or a helper
//! missing a required argument is a configuration error, since no context
//! can make it render.
//!
//! Helper grammar: tokens are whitespace-separated, single quotes keep a
//! token together and mark it as a string literal. The first token names
//! the helper; everything after it is arguments.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use tickflow_types::event::{MappingEvent, MappingEventStatus};
use tickflow_types::flow::{MappingFormat, TemplateMapping};

use crate::error::StepFailure;
use crate::ports::PointerStore;
use crate::value::offload;
use crate::value::path::{self, PathSegment};
use crate::value::resolver::{compare_values, ValueResolver};

/// Registered helper names. A single-token placeholder is a path
/// expression; a multi-token placeholder must start with one of these.
const HELPERS: [&str; 6] = ["json", "slice", "compare", "default", "urlencode", "grouped"];

/// Application/x-www-form-urlencoded-safe set: RFC 3986 unreserved
/// characters stay literal, everything else is percent-encoded.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ---------------------------------------------------------------------------
// Rendered
// ---------------------------------------------------------------------------

/// A rendered template plus the events produced while resolving it.
#[derive(Debug, Default)]
pub struct Rendered {
    pub text: String,
    pub events: Vec<MappingEvent>,
}

// ---------------------------------------------------------------------------
// TemplateEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TemplateEngine<S> {
    resolver: ValueResolver<S>,
}

impl<S: PointerStore + Clone> TemplateEngine<S> {
    pub fn new(resolver: ValueResolver<S>) -> Self {
        Self { resolver }
    }

    /// Render `template` against `context`, substituting every `{{ ... }}`
    /// placeholder. Text outside placeholders passes through untouched; an
    /// unterminated `{{` is emitted literally.
    pub async fn render(&self, template: &str, context: &Value) -> Result<Rendered, StepFailure> {
        let mut text = String::with_capacity(template.len());
        let mut events = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            text.push_str(&rest[..open]);
            let body_start = open + 2;
            match find_close(&rest[body_start..]) {
                Some(close) => {
                    let body = rest[body_start..body_start + close].trim();
                    let rendered = self.render_placeholder(body, context, &mut events).await?;
                    text.push_str(&rendered);
                    rest = &rest[body_start + close + 2..];
                }
                None => {
                    text.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        text.push_str(rest);

        Ok(Rendered { text, events })
    }

    async fn render_placeholder(
        &self,
        body: &str,
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        let tokens = split_tokens(body);
        if tokens.len() >= 2 {
            let Some(helper) = HELPERS.iter().find(|h| **h == tokens[0]) else {
                return Err(StepFailure::configuration(format!(
                    "unknown template helper '{}' in placeholder '{body}'",
                    tokens[0]
                )));
            };
            return self.apply_helper(helper, &tokens[1..], context, events).await;
        }

        let resolved = self.resolver.resolve(body, context, true).await?;
        events.extend(resolved.events);
        match resolved.value {
            Some(value) => Ok(value_to_string(&value)),
            None => {
                events.push(MappingEvent::now(
                    "templateRender",
                    MappingEventStatus::Warn,
                    format!("placeholder '{body}' resolved to nothing, rendered empty"),
                ));
                Ok(String::new())
            }
        }
    }

    //  -------------------------------------------------------------------
    //  Helpers
    //  -------------------------------------------------------------------

    async fn apply_helper(
        &self,
        helper: &str,
        args: &[String],
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        match helper {
            "json" => {
                let Some(value) = self.arg_value(&args[0], context, events).await? else {
                    return Ok(String::new());
                };
                Ok(serde_json::to_string(&value).unwrap_or_default())
            }
            "urlencode" => {
                let Some(value) = self.arg_value(&args[0], context, events).await? else {
                    return Ok(String::new());
                };
                Ok(utf8_percent_encode(&value_to_string(&value), URL_ENCODE_SET).to_string())
            }
            "slice" => self.helper_slice(args, context, events).await,
            "compare" => self.helper_compare(args, context, events).await,
            "default" => self.helper_default(args, context, events).await,
            "grouped" => self.helper_grouped(args, context, events).await,
            _ => Ok(String::new()),
        }
    }

    /// Resolve a path argument, warning and yielding `None` when undefined.
    async fn arg_value(
        &self,
        path_arg: &str,
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<Option<Value>, StepFailure> {
        let resolved = self.resolver.resolve(path_arg, context, true).await?;
        events.extend(resolved.events);
        if resolved.value.is_none() {
            events.push(MappingEvent::now(
                "templateRender",
                MappingEventStatus::Warn,
                format!("helper argument '{path_arg}' resolved to nothing"),
            ));
        }
        Ok(resolved.value)
    }

    /// `slice <path> <start> [<end>]` -- array slice with Python-style
    /// negative indexes, rendered as compact JSON.
    async fn helper_slice(
        &self,
        args: &[String],
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        let (Some(start_arg), end_arg) = (args.get(1), args.get(2)) else {
            return Err(StepFailure::configuration(
                "slice helper expects <path> <start> [<end>]",
            ));
        };
        let Some(value) = self.arg_value(&args[0], context, events).await? else {
            return Ok(String::new());
        };
        let Value::Array(items) = value else {
            events.push(helper_misuse("slice", "value is not an array"));
            return Ok(String::new());
        };
        let len = items.len() as i64;
        let clamp = |raw: i64| -> usize {
            let idx = if raw < 0 { len + raw } else { raw };
            idx.clamp(0, len) as usize
        };
        let start = clamp(start_arg.parse::<i64>().unwrap_or(0));
        let end = clamp(
            end_arg
                .and_then(|a| a.parse::<i64>().ok())
                .unwrap_or(len),
        );
        let window: Vec<Value> = if start < end {
            items[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(serde_json::to_string(&window).unwrap_or_default())
    }

    /// `compare <path> <op> <literal> [<then>] [<else>]` -- renders `then`
    /// or `else` (default `true`/`false`). An undefined path compares as
    /// JSON null, so `compare maybe == null` tests absence.
    async fn helper_compare(
        &self,
        args: &[String],
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        let (Some(op_arg), Some(literal_arg)) = (args.get(1), args.get(2)) else {
            return Err(StepFailure::configuration(
                "compare helper expects <path> <op> <literal> [<then>] [<else>]",
            ));
        };
        let Some(op) = path::parse_op(op_arg) else {
            return Err(StepFailure::configuration(format!(
                "compare helper: unknown operator '{op_arg}'"
            )));
        };
        let resolved = self.resolver.resolve(&args[0], context, true).await?;
        events.extend(resolved.events);
        let actual = resolved.value.unwrap_or(Value::Null);
        let literal = parse_literal_arg(literal_arg);
        let outcome = compare_values(&actual, op, &literal);
        let branch = if outcome { args.get(3) } else { args.get(4) };
        Ok(match branch {
            Some(token) => value_to_string(&parse_literal_arg(token)),
            None => outcome.to_string(),
        })
    }

    /// `default <path> <fallback>` -- the resolved value unless it is
    /// undefined or null.
    async fn helper_default(
        &self,
        args: &[String],
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        let Some(fallback_arg) = args.get(1) else {
            return Err(StepFailure::configuration(
                "default helper expects <path> <fallback>",
            ));
        };
        let resolved = self.resolver.resolve(&args[0], context, true).await?;
        events.extend(resolved.events);
        match resolved.value {
            Some(value) if !value.is_null() => Ok(value_to_string(&value)),
            _ => Ok(value_to_string(&parse_literal_arg(fallback_arg))),
        }
    }

    /// `grouped <path> <key_field> [<item_template>] [<item_sep>] [<group_sep>]`
    ///
    /// Groups array items by the value of `key_field`, preserving first
    /// appearance order, and renders one line per group:
    /// `<key>: <item><item_sep><item>...`. Item templates use single-brace
    /// `{field}` placeholders resolved against each item; without a
    /// template, items render as compact JSON.
    async fn helper_grouped(
        &self,
        args: &[String],
        context: &Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<String, StepFailure> {
        let Some(key_arg) = args.get(1) else {
            return Err(StepFailure::configuration(
                "grouped helper expects <path> <key_field> [<item_template>]",
            ));
        };
        let Some(value) = self.arg_value(&args[0], context, events).await? else {
            return Ok(String::new());
        };
        let Value::Array(items) = value else {
            events.push(helper_misuse("grouped", "value is not an array"));
            return Ok(String::new());
        };

        let key_field = unquote(key_arg).unwrap_or(key_arg);
        let item_template = args.get(2).map(|a| unquote(a).unwrap_or(a));
        let item_sep = args.get(3).map(|a| unquote(a).unwrap_or(a)).unwrap_or(", ");
        let group_sep = args.get(4).map(|a| unquote(a).unwrap_or(a)).unwrap_or("\n");

        let mut order: Vec<String> = Vec::new();
        let mut groups: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for item in &items {
            let key = value_to_string(item.get(key_field).unwrap_or(&Value::Null));
            let line = match item_template {
                Some(template) => render_item_template(template, item),
                None => serde_json::to_string(item).unwrap_or_default(),
            };
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(line);
        }

        let lines: Vec<String> = order
            .iter()
            .map(|key| {
                let members = groups.get(key).map(|m| m.join(item_sep)).unwrap_or_default();
                format!("{key}: {members}")
            })
            .collect();
        Ok(lines.join(group_sep))
    }

    //  -------------------------------------------------------------------
    //  Structured rendering
    //  -------------------------------------------------------------------

    /// Build declarative template-context entries. Each mapping resolves a
    /// source path, optionally narrows object fields, and formats the
    /// result. Undefined sources record a Warn event and omit the key; a
    /// customString mapping without an item template or over a non-array
    /// source is a configuration error.
    pub async fn build_context(
        &self,
        mappings: &[TemplateMapping],
        context: &Value,
    ) -> Result<(Map<String, Value>, Vec<MappingEvent>), StepFailure> {
        let mut built = Map::new();
        let mut events = Vec::new();

        for mapping in mappings {
            let resolved = self
                .resolver
                .resolve(&mapping.source_json_path, context, true)
                .await?;
            events.extend(resolved.events);
            let Some(mut value) = resolved.value else {
                events.push(MappingEvent::now(
                    "templateMapping",
                    MappingEventStatus::Warn,
                    format!(
                        "source '{}' resolved to nothing, key '{}' omitted",
                        mapping.source_json_path, mapping.context_key
                    ),
                ));
                continue;
            };

            if let Some(fields) = &mapping.select_fields {
                value = narrow_fields(value, fields);
            }

            let formatted = match mapping.format_as {
                MappingFormat::Raw => value,
                MappingFormat::Json => {
                    Value::String(serde_json::to_string(&value).unwrap_or_default())
                }
                MappingFormat::CustomString => {
                    let Some(template) = &mapping.item_template else {
                        return Err(StepFailure::configuration(format!(
                            "template mapping '{}' uses customString without an item template",
                            mapping.context_key
                        )));
                    };
                    let Value::Array(items) = value else {
                        return Err(StepFailure::configuration(format!(
                            "template mapping '{}' uses customString on a non-array source",
                            mapping.context_key
                        )));
                    };
                    let mut lines = Vec::with_capacity(items.len());
                    for item in &items {
                        let rendered = self.render(template, item).await?;
                        events.extend(rendered.events);
                        lines.push(rendered.text);
                    }
                    let separator = mapping.join_separator.as_deref().unwrap_or("\n");
                    Value::String(lines.join(separator))
                }
            };
            built.insert(mapping.context_key.clone(), formatted);
        }

        Ok((built, events))
    }

    /// Render every embedded template string inside a config document.
    /// Strings without `{{` pass through untouched, preserving their JSON
    /// type; rendered placeholders always produce strings.
    pub async fn render_config(
        &self,
        config: Value,
        context: &Value,
    ) -> Result<(Value, Vec<MappingEvent>), StepFailure> {
        let mut templated = Vec::new();
        let mut trail = Vec::new();
        collect_template_strings(&config, &mut trail, &mut templated);
        if templated.is_empty() {
            return Ok((config, Vec::new()));
        }

        let mut config = config;
        let mut events = Vec::new();
        for (trail, template) in templated {
            let rendered = self.render(&template, context).await?;
            events.extend(rendered.events);
            offload::replace_at(&mut config, &trail, Value::String(rendered.text));
        }
        Ok((config, events))
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value to a display string for template substitution.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Find the byte offset of the closing `}}`, skipping quoted spans.
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'}' if !in_quote && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Whitespace tokenizer; single quotes keep a token together and are kept
/// in the token text so paths like `items['a b']` survive intact.
fn split_tokens(body: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in body.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quote => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Strip surrounding single quotes from a fully-quoted token.
fn unquote(token: &str) -> Option<&str> {
    token.strip_prefix('\'')?.strip_suffix('\'')
}

/// Quoted tokens are string literals; bare tokens parse as JSON with a
/// plain-string fallback.
fn parse_literal_arg(token: &str) -> Value {
    if let Some(inner) = unquote(token) {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string()))
}

fn helper_misuse(helper: &str, problem: &str) -> MappingEvent {
    MappingEvent::now(
        "templateRender",
        MappingEventStatus::Error,
        format!("{helper} helper: {problem}, rendered empty"),
    )
}

/// Substitute single-brace `{field}` placeholders with values from `item`.
/// Dotted field names walk nested objects. Unresolved placeholders render
/// empty.
fn render_item_template(template: &str, item: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open + 1..].find('}') {
            Some(close) => {
                let field = &rest[open + 1..open + 1 + close];
                let mut value = item;
                let mut found = true;
                for part in field.split('.') {
                    match value.get(part) {
                        Some(next) => value = next,
                        None => {
                            found = false;
                            break;
                        }
                    }
                }
                if found {
                    out.push_str(&value_to_string(value));
                }
                rest = &rest[open + 1 + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn narrow_fields(value: Value, fields: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| narrow_fields(item, fields))
                .collect(),
        ),
        other => other,
    }
}

fn collect_template_strings(
    value: &Value,
    trail: &mut Vec<PathSegment>,
    out: &mut Vec<(Vec<PathSegment>, String)>,
) {
    match value {
        Value::String(s) if s.contains("{{") => out.push((trail.clone(), s.clone())),
        Value::Object(map) => {
            for (key, child) in map {
                trail.push(PathSegment::Key(key.clone()));
                collect_template_strings(child, trail, out);
                trail.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                trail.push(PathSegment::Index(index));
                collect_template_strings(child, trail, out);
                trail.pop();
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
