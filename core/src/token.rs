//! Command tokens and shell-safe rendering.
//!
//! A command is declared as a sequence of tokens rather than a flat
//! string. Literal tokens are quoted so that they survive the remote
//! shell untouched, raw tokens pass through verbatim for deliberate
//! shell constructs, and index functions defer resolution until a
//! fan-out assigns each invocation its index.

use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Token type
// ---------------------------------------------------------------------------

/// A callable that resolves to a token once a fan-out index is known.
#[derive(Clone)]
pub struct IndexFn(Rc<dyn Fn(usize) -> CommandToken>);

impl IndexFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize) -> CommandToken + 'static,
    {
        IndexFn(Rc::new(f))
    }

    pub fn call(&self, index: usize) -> CommandToken {
        (self.0)(index)
    }
}

impl fmt::Debug for IndexFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IndexFn(..)")
    }
}

/// One element of a command line.
#[derive(Debug, Clone)]
pub enum CommandToken {
    /// Quoted before being handed to the remote shell.
    Literal(String),
    /// Passed through verbatim; the caller owns any quoting.
    Raw(String),
    /// Resolved per invocation during an indexed fan-out.
    IndexFn(IndexFn),
}

impl CommandToken {
    pub fn literal(s: impl Into<String>) -> Self {
        CommandToken::Literal(s.into())
    }

    pub fn raw(s: impl Into<String>) -> Self {
        CommandToken::Raw(s.into())
    }

    pub fn index_fn<F>(f: F) -> Self
    where
        F: Fn(usize) -> CommandToken + 'static,
    {
        CommandToken::IndexFn(IndexFn::new(f))
    }

    /// Resolves this token to its unquoted value for the given index.
    ///
    /// Used when a token names a file rather than part of a command
    /// line, so no shell quoting is applied.
    pub fn resolve_value(&self, index: usize) -> String {
        match self {
            CommandToken::Literal(s) | CommandToken::Raw(s) => s.clone(),
            CommandToken::IndexFn(f) => f.call(index).resolve_value(index),
        }
    }
}

impl PartialEq for CommandToken {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CommandToken::Literal(a), CommandToken::Literal(b)) => a == b,
            (CommandToken::Raw(a), CommandToken::Raw(b)) => a == b,
            // Index functions have no useful identity.
            _ => false,
        }
    }
}

impl From<&str> for CommandToken {
    fn from(s: &str) -> Self {
        CommandToken::Literal(s.to_string())
    }
}

impl From<String> for CommandToken {
    fn from(s: String) -> Self {
        CommandToken::Literal(s)
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandToken::Literal(s) => f.write_str(&quote(s)),
            CommandToken::Raw(s) => f.write_str(s),
            CommandToken::IndexFn(_) => f.write_str("<index>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Quotes a string for a POSIX shell.
///
/// Strings made only of characters that no shell interprets pass
/// through bare. Anything else is wrapped in single quotes, with
/// embedded single quotes spliced out.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Renders a token sequence into a single command string.
///
/// Fails if the sequence contains an index function; those only make
/// sense inside an indexed fan-out.
pub fn render(tokens: &[CommandToken]) -> Result<String> {
    let mut parts = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            CommandToken::IndexFn(_) => {
                return Err(Error::Usage(
                    "index function token used outside an indexed fan-out".to_string(),
                ));
            }
            other => parts.push(other.to_string()),
        }
    }
    Ok(parts.join(" "))
}

/// Renders a token sequence for one invocation of an indexed fan-out.
pub fn render_indexed(tokens: &[CommandToken], index: usize) -> String {
    let parts: Vec<String> = tokens.iter().map(|t| render_one(t, index)).collect();
    parts.join(" ")
}

fn render_one(token: &CommandToken, index: usize) -> String {
    match token {
        CommandToken::IndexFn(f) => render_one(&f.call(index), index),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
