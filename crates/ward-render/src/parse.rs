//! Template source parsing.
//!
//! A template is literal text interleaved with actions enclosed in the
//! configured delimiters. Supported actions:
//!
//! | action                              | output                                |
//! |-------------------------------------|---------------------------------------|
//! | `key "path"`                        | value of `path`                       |
//! | `keyOrDefault "path" "fallback"`    | value of `path`, or `fallback`        |
//! | `name`                              | value of the key bound to `name`      |
//! | `"literal"`                         | the literal                           |
//! | `/* comment */`                     | nothing                               |
//!
//! `{{- ` trims whitespace before an action and ` -}}` trims whitespace
//! after it. All other text is reproduced byte for byte.

use std::collections::BTreeMap;

use crate::error::{RenderError, RenderResult};

/// Default left delimiter.
pub const DEFAULT_LEFT: &str = "{{";

/// Default right delimiter.
pub const DEFAULT_RIGHT: &str = "}}";

/// The pair of strings that open and close an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    left: String,
    right: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            left: DEFAULT_LEFT.to_string(),
            right: DEFAULT_RIGHT.to_string(),
        }
    }
}

impl Delimiters {
    /// Creates a delimiter pair.
    ///
    /// # Errors
    ///
    /// Returns an error if either side is empty, contains whitespace, or
    /// both sides are equal.
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> RenderResult<Self> {
        let left = left.into();
        let right = right.into();
        if left.is_empty() || right.is_empty() {
            return Err(RenderError::InvalidDelimiters(
                "delimiters cannot be empty".to_string(),
            ));
        }
        if left.chars().chain(right.chars()).any(char::is_whitespace) {
            return Err(RenderError::InvalidDelimiters(
                "delimiters cannot contain whitespace".to_string(),
            ));
        }
        if left == right {
            return Err(RenderError::InvalidDelimiters(format!(
                "left and right delimiters are both '{left}'"
            )));
        }
        Ok(Self { left, right })
    }

    /// The opening delimiter.
    #[must_use]
    pub fn left(&self) -> &str {
        &self.left
    }

    /// The closing delimiter.
    #[must_use]
    pub fn right(&self) -> &str {
        &self.right
    }
}

/// Options fixed at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Action delimiters.
    pub delimiters: Delimiters,
    /// Variable name to key path bindings for bare identifiers.
    pub vars: BTreeMap<String, String>,
}

/// A parsed template element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Text(String),
    Key {
        path: String,
        default: Option<String>,
    },
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
}

pub(crate) fn parse(source: &str, options: &ParseOptions) -> RenderResult<Vec<Node>> {
    let left = options.delimiters.left();
    let right = options.delimiters.right();

    let mut nodes = Vec::new();
    let mut pos = 0;
    let mut trim_next = false;

    loop {
        let open = source[pos..].find(left).map(|o| pos + o);
        let mut text = &source[pos..open.unwrap_or(source.len())];
        if trim_next {
            text = text.trim_start_matches(|c: char| c.is_ascii_whitespace());
            trim_next = false;
        }

        let Some(open) = open else {
            push_text(&mut nodes, text);
            break;
        };

        let line = line_at(source, open);
        let mut body_start = open + left.len();
        if has_left_trim(&source[body_start..]) {
            text = text.trim_end_matches(|c: char| c.is_ascii_whitespace());
            body_start += 1;
        }
        push_text(&mut nodes, text);

        let close = find_close(source, body_start, right)
            .ok_or_else(|| {
                RenderError::syntax(line, format!("unclosed action, expected '{right}'"))
            })?;

        let mut body = &source[body_start..close];
        if has_right_trim(body) {
            body = &body[..body.len() - 1];
            trim_next = true;
        }

        if let Some(node) = parse_action(body, line, options)? {
            nodes.push(node);
        }
        pos = close + right.len();
    }

    Ok(nodes)
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

fn has_left_trim(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('-') && chars.next().is_some_and(|c| c.is_ascii_whitespace())
}

fn has_right_trim(body: &str) -> bool {
    body.strip_suffix('-')
        .and_then(|b| b.chars().next_back())
        .is_some_and(|c| c.is_ascii_whitespace())
}

/// Finds the closing delimiter, skipping over string literals and comments.
fn find_close(source: &str, from: usize, right: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    let mut in_comment = false;
    let mut chars = source[from..].char_indices();

    while let Some((offset, c)) = chars.next() {
        let i = from + offset;
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
        if in_comment {
            if source[i..].starts_with("*/") {
                in_comment = false;
                chars.next();
            }
            continue;
        }
        if source[i..].starts_with(right) {
            return Some(i);
        }
        if c == '"' {
            in_string = true;
        } else if source[i..].starts_with("/*") {
            in_comment = true;
            chars.next();
        }
    }
    None
}

fn parse_action(body: &str, line: usize, options: &ParseOptions) -> RenderResult<Option<Node>> {
    let body = body.trim();

    if let Some(comment) = body.strip_prefix("/*") {
        return if comment.ends_with("*/") {
            Ok(None)
        } else {
            Err(RenderError::syntax(line, "unclosed comment"))
        };
    }

    let tokens = tokenize(body, line)?;
    match tokens.as_slice() {
        [] => Err(RenderError::syntax(line, "empty action")),
        [Token::Str(s)] => Ok(Some(Node::Literal(s.clone()))),
        [Token::Str(_), ..] => Err(RenderError::syntax(
            line,
            "unexpected arguments after string literal",
        )),
        [Token::Ident(name), args @ ..] => match name.as_str() {
            "key" => match args {
                [Token::Str(path)] => key_node(path, None, line).map(Some),
                _ => Err(RenderError::syntax(
                    line,
                    format!("key expects 1 string argument, got {}", args.len()),
                )),
            },
            "keyOrDefault" => match args {
                [Token::Str(path), Token::Str(default)] => {
                    key_node(path, Some(default.clone()), line).map(Some)
                }
                _ => Err(RenderError::syntax(
                    line,
                    format!("keyOrDefault expects 2 string arguments, got {}", args.len()),
                )),
            },
            var if args.is_empty() => match options.vars.get(var) {
                Some(path) => key_node(path, None, line).map(Some),
                None => Err(RenderError::syntax(line, format!("undefined variable '{var}'"))),
            },
            other => Err(RenderError::syntax(line, format!("unknown function '{other}'"))),
        },
    }
}

fn key_node(path: &str, default: Option<String>, line: usize) -> RenderResult<Node> {
    if path.is_empty() {
        return Err(RenderError::syntax(line, "key path cannot be empty"));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(RenderError::syntax(
            line,
            format!("key path '{path}' contains whitespace"),
        ));
    }
    Ok(Node::Key {
        path: path.to_string(),
        default,
    })
}

fn tokenize(body: &str, line: usize) -> RenderResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = body.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, '"')) => value.push('"'),
                        Some((_, '\\')) => value.push('\\'),
                        Some((_, other)) => {
                            return Err(RenderError::syntax(
                                line,
                                format!("unknown escape '\\{other}'"),
                            ));
                        }
                        None => break,
                    },
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(RenderError::syntax(line, "unterminated string"));
            }
            tokens.push(Token::Str(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(body[start..end].to_string()));
        } else {
            return Err(RenderError::syntax(
                line,
                format!("unexpected character '{c}'"),
            ));
        }
    }

    Ok(tokens)
}
