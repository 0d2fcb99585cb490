//! Command line formatting
//!
//! Arguments are rendered the same way for plain commands and bundle entry
//! commands:
//!
//! - `bool` becomes `true` / `false`
//! - a sequence of strings expands positionally; blank elements become `-`
//! - `Null` arguments are dropped
//! - anything else is rendered with `Display`
//! - a token containing whitespace is wrapped in double quotes
//!
//! Alongside the executed line every command has a single-line rendering with
//! each argument shell-escaped, used for audit logs.

use std::borrow::Cow;

use crate::error::{ProxyError, Result};

/// Replaces command text and arguments of sensitive calls in logs and responses
pub const REDACTED: &str = "*** REDACTED ***";

/// A single command argument
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    /// Dropped from the command line
    Null,
    Bool(bool),
    Text(String),
    /// Expanded positionally
    List(Vec<String>),
    /// Any other value, already rendered with `Display`
    Value(String),
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Text(value)
    }
}

impl From<&String> for CommandArg {
    fn from(value: &String) -> Self {
        CommandArg::Text(value.clone())
    }
}

impl From<bool> for CommandArg {
    fn from(value: bool) -> Self {
        CommandArg::Bool(value)
    }
}

impl From<Vec<String>> for CommandArg {
    fn from(value: Vec<String>) -> Self {
        CommandArg::List(value)
    }
}

impl From<Vec<&str>> for CommandArg {
    fn from(value: Vec<&str>) -> Self {
        CommandArg::List(value.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for CommandArg {
    fn from(value: &[&str]) -> Self {
        CommandArg::List(value.iter().map(|item| item.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandArg {
    fn from(value: [&str; N]) -> Self {
        CommandArg::List(value.iter().map(|item| item.to_string()).collect())
    }
}

impl<T: Into<CommandArg>> From<Option<T>> for CommandArg {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CommandArg::Null)
    }
}

macro_rules! impl_value_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CommandArg {
                fn from(value: $ty) -> Self {
                    CommandArg::Value(value.to_string())
                }
            }
        )*
    };
}

impl_value_arg!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64, char);

/// Build a `Vec<CommandArg>` from heterogeneous values.
///
/// ```
/// use hive_proxy::{args, CommandArg};
///
/// let args = args!["a b", None::<&str>, true, vec!["x", "y z"]];
/// assert_eq!(args.len(), 4);
/// assert_eq!(args[1], CommandArg::Null);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::CommandArg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::CommandArg::from($arg)),+]
    };
}

/// Wrap a token in double quotes when it contains whitespace
fn quote_token(token: &str) -> Cow<'_, str> {
    if token.is_empty() {
        Cow::Borrowed("\"\"")
    } else if token.chars().any(char::is_whitespace) {
        Cow::Owned(format!("\"{}\"", token))
    } else {
        Cow::Borrowed(token)
    }
}

/// A command plus its expanded argument tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedCommand {
    command: String,
    tokens: Vec<String>,
}

impl FormattedCommand {
    /// Expand `args` according to the formatting rules
    pub fn new(command: impl Into<String>, args: &[CommandArg]) -> Self {
        let mut tokens = Vec::new();

        for arg in args {
            match arg {
                CommandArg::Null => {}
                CommandArg::Bool(value) => tokens.push(value.to_string()),
                CommandArg::Text(value) | CommandArg::Value(value) => tokens.push(value.clone()),
                CommandArg::List(items) => {
                    for item in items {
                        if item.trim().is_empty() {
                            tokens.push("-".to_string());
                        } else {
                            tokens.push(item.clone());
                        }
                    }
                }
            }
        }

        Self {
            command: command.into(),
            tokens,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Expanded argument tokens before quoting
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The line executed on the node
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for token in &self.tokens {
            line.push(' ');
            line.push_str(&quote_token(token));
        }
        line
    }

    /// Single-line rendering with every argument shell-escaped, for audit logs
    pub fn bash_command(&self) -> String {
        let mut line = self.command.clone();
        for token in &self.tokens {
            line.push(' ');
            line.push_str(&shell_escape::unix::escape(Cow::Borrowed(token.as_str())));
        }
        line
    }

    /// Reject embedded `<` / `>`; the execution wrapper owns stdout/stderr.
    pub fn check_redirection(&self) -> Result<()> {
        let line = self.command_line();
        if line.contains('<') || line.contains('>') {
            return Err(ProxyError::InvalidCommand(format!(
                "redirection is not supported, use a command bundle instead: {}",
                line
            )));
        }
        Ok(())
    }
}

/// Shell-escape a single path or word for commands built by the engine
pub fn escape(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}
