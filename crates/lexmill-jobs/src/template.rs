//! Prompt template engine.
//!
//! Two modes share one value formatting so they agree on flat templates:
//!
//! - flat: `{{name}}` replaced from a string map, unknown names become `""`
//! - loop: a small block language with `{% for x in coll %}...{% endfor %}`,
//!   `{% if [not] path %}...{% else %}...{% endif %}`, dotted access
//!   `{{ x.field }}` and `{{ loop.index }}` / `loop.index0` / `loop.first` /
//!   `loop.last`
//!
//! Loop mode is only entered when the source contains a `{% for` or `{% if`
//! tag.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use lexmill_core::{Error, Result};

static FLAT_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid regex"));

static BLOCK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*(for|if)\b").expect("valid regex"));

static PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("valid regex")
});

/// True when `src` needs the loop engine.
pub fn is_loop_template(src: &str) -> bool {
    BLOCK_TAG.is_match(src)
}

/// Flat `{{name}}` substitution. Never fails.
pub fn render_flat(src: &str, variables: &BTreeMap<String, String>) -> String {
    FLAT_VAR
        .replace_all(src, |caps: &regex::Captures<'_>| {
            variables.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// String form of a context value, shared by both modes.
pub fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items
            .iter()
            .map(display_item)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(_) => display_item(value),
    }
}

fn display_item(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(map) => ["label", "lemma", "name", "code"]
            .iter()
            .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => display_value(other),
    }
}

/// Flatten a context into the string map used by flat mode.
///
/// Nested objects contribute dotted keys (`frame.name`) so that flat and
/// loop rendering resolve the same paths.
pub fn flatten_context(ctx: &Map<String, JsonValue>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in ctx {
        out.insert(key.clone(), display_value(value));
        if let JsonValue::Object(inner) = value {
            for (k, v) in inner {
                out.insert(format!("{key}.{k}"), display_value(v));
            }
        }
    }
    out
}

fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Array(a)) => !a.is_empty(),
        Some(JsonValue::Object(o)) => !o.is_empty(),
    }
}

// =============================================================================
// PARSING
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Var(String),
    For { var: String, collection: String },
    EndFor,
    If { path: String, negate: bool },
    Else,
    EndIf,
}

impl Token {
    fn name(&self) -> &'static str {
        match self {
            Token::EndFor => "endfor",
            Token::Else => "else",
            Token::EndIf => "endif",
            _ => "tag",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    For {
        var: String,
        collection: String,
        body: Vec<Node>,
    },
    If {
        path: String,
        negate: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

fn check_path(path: &str) -> Result<()> {
    if PATH.is_match(path) {
        Ok(())
    } else {
        Err(Error::Render(format!("invalid variable path '{path}'")))
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = src;
    loop {
        let next_var = rest.find("{{");
        let next_tag = rest.find("{%");
        let (start, is_tag) = match (next_var, next_tag) {
            (None, None) => break,
            (Some(v), None) => (v, false),
            (None, Some(t)) => (t, true),
            (Some(v), Some(t)) => {
                if t < v {
                    (t, true)
                } else {
                    (v, false)
                }
            }
        };
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let close = if is_tag { "%}" } else { "}}" };
        let body_start = start + 2;
        let end = rest[body_start..]
            .find(close)
            .ok_or_else(|| Error::Render(format!("unclosed '{}'", &rest[start..body_start])))?;
        let inner = rest[body_start..body_start + end]
            .trim()
            .trim_matches('-')
            .trim();
        rest = &rest[body_start + end + 2..];

        if !is_tag {
            check_path(inner)?;
            tokens.push(Token::Var(inner.to_string()));
            continue;
        }
        let words: Vec<&str> = inner.split_whitespace().collect();
        let token = match words.as_slice() {
            ["for", var, "in", collection] => {
                check_path(var)?;
                check_path(collection)?;
                Token::For {
                    var: var.to_string(),
                    collection: collection.to_string(),
                }
            }
            ["endfor"] => Token::EndFor,
            ["if", "not", path] => {
                check_path(path)?;
                Token::If {
                    path: path.to_string(),
                    negate: true,
                }
            }
            ["if", path] => {
                check_path(path)?;
                Token::If {
                    path: path.to_string(),
                    negate: false,
                }
            }
            ["else"] => Token::Else,
            ["endif"] => Token::EndIf,
            _ => return Err(Error::Render(format!("unsupported tag '{{% {inner} %}}'"))),
        };
        tokens.push(token);
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    Ok(tokens)
}

fn parse_until(
    tokens: &mut std::vec::IntoIter<Token>,
    stops: &[Token],
) -> Result<(Vec<Node>, Option<Token>)> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Text(t) => nodes.push(Node::Text(t)),
            Token::Var(p) => nodes.push(Node::Var(p)),
            Token::For { var, collection } => {
                let (body, _) = parse_until(tokens, &[Token::EndFor])?;
                nodes.push(Node::For {
                    var,
                    collection,
                    body,
                });
            }
            Token::If { path, negate } => {
                let (then, term) = parse_until(tokens, &[Token::Else, Token::EndIf])?;
                let otherwise = if term == Some(Token::Else) {
                    parse_until(tokens, &[Token::EndIf])?.0
                } else {
                    Vec::new()
                };
                nodes.push(Node::If {
                    path,
                    negate,
                    then,
                    otherwise,
                });
            }
            closer => {
                if stops.contains(&closer) {
                    return Ok((nodes, Some(closer)));
                }
                return Err(Error::Render(format!(
                    "unexpected '{{% {} %}}'",
                    closer.name()
                )));
            }
        }
    }
    match stops.last() {
        None => Ok((nodes, None)),
        Some(expected) => Err(Error::Render(format!(
            "missing '{{% {} %}}'",
            expected.name()
        ))),
    }
}

// =============================================================================
// TEMPLATE
// =============================================================================

/// A parsed loop-mode template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self> {
        let mut tokens = tokenize(src)?.into_iter();
        let (nodes, _) = parse_until(&mut tokens, &[])?;
        Ok(Self { nodes })
    }

    /// Collections iterated by any `for` tag, in first-seen order.
    pub fn loop_collections(&self) -> Vec<String> {
        fn walk(nodes: &[Node], out: &mut Vec<String>) {
            for node in nodes {
                match node {
                    Node::For {
                        collection, body, ..
                    } => {
                        if !out.contains(collection) {
                            out.push(collection.clone());
                        }
                        walk(body, out);
                    }
                    Node::If {
                        then, otherwise, ..
                    } => {
                        walk(then, out);
                        walk(otherwise, out);
                    }
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    /// Prepend `fragment` to the body of every loop over `collection`.
    ///
    /// `{var}` in the fragment is replaced by the loop variable's name.
    pub fn inject_loop_prefix(&mut self, collection: &str, fragment: &str) -> Result<()> {
        fn walk(nodes: &mut [Node], collection: &str, fragment: &str) -> Result<()> {
            for node in nodes.iter_mut() {
                match node {
                    Node::For {
                        var,
                        collection: c,
                        body,
                    } => {
                        if c == collection {
                            let prefix = Template::parse(&fragment.replace("{var}", var))?;
                            body.splice(0..0, prefix.nodes);
                        }
                        walk(body, collection, fragment)?;
                    }
                    Node::If {
                        then, otherwise, ..
                    } => {
                        walk(then, collection, fragment)?;
                        walk(otherwise, collection, fragment)?;
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        walk(&mut self.nodes, collection, fragment)
    }

    /// Render against `ctx`. Iterating a value that is not a list is an error;
    /// a missing collection iterates zero times.
    pub fn render(&self, ctx: &Map<String, JsonValue>) -> Result<String> {
        let mut out = String::new();
        let mut scopes: Vec<Map<String, JsonValue>> = Vec::new();
        render_nodes(&self.nodes, ctx, &mut scopes, &mut out)?;
        Ok(out)
    }
}

fn lookup<'a>(
    path: &str,
    root: &'a Map<String, JsonValue>,
    scopes: &'a [Map<String, JsonValue>],
) -> Option<&'a JsonValue> {
    let mut parts = path.split('.');
    let head = parts.next()?;
    let mut current = scopes
        .iter()
        .rev()
        .find_map(|s| s.get(head))
        .or_else(|| root.get(head))?;
    for part in parts {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render_nodes(
    nodes: &[Node],
    root: &Map<String, JsonValue>,
    scopes: &mut Vec<Map<String, JsonValue>>,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var(path) => {
                if let Some(v) = lookup(path, root, scopes) {
                    out.push_str(&display_value(v));
                }
            }
            Node::If {
                path,
                negate,
                then,
                otherwise,
            } => {
                let cond = truthy(lookup(path, root, scopes)) != *negate;
                render_nodes(if cond { then } else { otherwise }, root, scopes, out)?;
            }
            Node::For {
                var,
                collection,
                body,
            } => {
                let items = match lookup(collection, root, scopes) {
                    None | Some(JsonValue::Null) => continue,
                    Some(JsonValue::Array(items)) => items.clone(),
                    Some(_) => {
                        return Err(Error::Render(format!("'{collection}' is not a list")))
                    }
                };
                let len = items.len();
                for (i, item) in items.into_iter().enumerate() {
                    let mut scope = Map::new();
                    scope.insert(var.clone(), item);
                    scope.insert(
                        "loop".into(),
                        serde_json::json!({
                            "index": i + 1,
                            "index0": i,
                            "first": i == 0,
                            "last": i + 1 == len,
                        }),
                    );
                    scopes.push(scope);
                    let result = render_nodes(body, root, scopes, out);
                    scopes.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}
