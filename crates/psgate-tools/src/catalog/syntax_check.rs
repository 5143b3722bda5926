use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;

use psgate_core::error::{PsgateError, Result};

use crate::args::SyntaxCheckArgs;
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Static PowerShell syntax scan: balanced delimiters, terminated
/// strings and here-strings, closed block comments. Never spawns.
pub struct SyntaxCheckTool;

impl Tool for SyntaxCheckTool {
    fn name(&self) -> &str {
        "powershell-syntax-check"
    }

    fn description(&self) -> &str {
        "Statically check a PowerShell script for balanced delimiters and terminated strings without executing it."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "script": { "type": "string", "description": "Script text to check" },
                "filePath": { "type": "string", "description": "Path to a script file to check" }
            }
        })
    }

    fn call(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args: SyntaxCheckArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;
            let script = match (&args.script, &args.file_path) {
                (Some(s), _) => s.clone(),
                (None, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
                    PsgateError::InvalidArgs(format!("cannot read {}: {}", path, e))
                })?,
                (None, None) => {
                    return Err(PsgateError::InvalidArgs(
                        "one of 'script' or 'filePath' is required".into(),
                    ))
                }
            };
            let report = check_syntax(&script);
            Ok(ToolOutput::ok(serde_json::to_value(&report)?))
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntaxReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    HereSingle,
    HereDouble,
}

pub fn check_syntax(script: &str) -> SyntaxReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if script.trim().is_empty() {
        return SyntaxReport {
            is_valid: false,
            errors: vec!["script is empty".to_string()],
            warnings,
        };
    }

    let chars: Vec<char> = script.chars().collect();
    let mut mode = Mode::Normal;
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '\n' {
            line += 1;
            if mode == Mode::LineComment {
                mode = Mode::Normal;
            }
            i += 1;
            continue;
        }

        match mode {
            Mode::Normal => match c {
                '\'' => mode = Mode::SingleQuote,
                '"' => mode = Mode::DoubleQuote,
                '#' => mode = Mode::LineComment,
                '<' if next == Some('#') => {
                    mode = Mode::BlockComment;
                    i += 1;
                }
                '@' if next == Some('\'') => {
                    mode = Mode::HereSingle;
                    i += 1;
                }
                '@' if next == Some('"') => {
                    mode = Mode::HereDouble;
                    i += 1;
                }
                '(' | '{' | '[' => stack.push((c, line)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => errors.push(format!(
                            "line {}: '{}' closes '{}' opened on line {}",
                            line, c, open, open_line
                        )),
                        None => errors.push(format!("line {}: unmatched '{}'", line, c)),
                    }
                }
                '`' if next.is_none() => {
                    warnings.push("script ends with a line continuation".to_string());
                }
                _ => {}
            },
            Mode::SingleQuote => {
                if c == '\'' {
                    // Doubled quote is an escaped quote inside the string.
                    if next == Some('\'') {
                        i += 1;
                    } else {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::DoubleQuote => {
                if c == '`' {
                    i += 1; // escaped character
                } else if c == '"' {
                    if next == Some('"') {
                        i += 1;
                    } else {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::LineComment => {}
            Mode::BlockComment => {
                if c == '#' && next == Some('>') {
                    mode = Mode::Normal;
                    i += 1;
                }
            }
            Mode::HereSingle => {
                if c == '\'' && next == Some('@') {
                    mode = Mode::Normal;
                    i += 1;
                }
            }
            Mode::HereDouble => {
                if c == '"' && next == Some('@') {
                    mode = Mode::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    match mode {
        Mode::SingleQuote | Mode::DoubleQuote => {
            errors.push("unterminated string literal".to_string())
        }
        Mode::BlockComment => errors.push("unterminated block comment".to_string()),
        Mode::HereSingle | Mode::HereDouble => {
            errors.push("unterminated here-string".to_string())
        }
        _ => {}
    }
    for (open, open_line) in stack {
        errors.push(format!("unclosed '{}' opened on line {}", open, open_line));
    }

    if script.to_lowercase().contains("invoke-expression") || script.to_lowercase().contains("iex ")
    {
        warnings.push("Invoke-Expression makes scripts hard to audit".to_string());
    }

    SyntaxReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}
