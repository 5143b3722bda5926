use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted literal regex"));

// A token counts as path-shaped when it carries a drive prefix, a path
// separator, or a leading dot/tilde segment.
static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([a-z]:[\\/]|[\\/]|\.{1,2}[\\/]|~[\\/]).*|.*[\\/].*").expect("path token regex")
});

/// Normalize a command for learning-store keys and learned-safe lookup.
///
/// Lowercases, collapses whitespace runs, and strips literals: quoted
/// substrings and path-shaped tokens are replaced with placeholder
/// tokens so distinct-looking invocations map to the same key.
pub fn normalize(command: &str) -> String {
    let stripped = QUOTED.replace_all(command, "<str>");
    let tokens: Vec<&str> = stripped
        .split_whitespace()
        .map(|tok| {
            if tok != "<str>" && PATH_TOKEN.is_match(tok) {
                "<path>"
            } else {
                tok
            }
        })
        .collect();
    tokens.join(" ").to_lowercase()
}

/// Built-in PowerShell alias table used during classification.
/// Maps the lowercased first token to the cmdlet it resolves to.
static ALIASES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("iex", "Invoke-Expression"),
        ("ls", "Get-ChildItem"),
        ("gci", "Get-ChildItem"),
        ("dir", "Get-ChildItem"),
        ("rm", "Remove-Item"),
        ("del", "Remove-Item"),
        ("ri", "Remove-Item"),
        ("erase", "Remove-Item"),
        ("rd", "Remove-Item"),
        ("rmdir", "Remove-Item"),
        ("cp", "Copy-Item"),
        ("copy", "Copy-Item"),
        ("mv", "Move-Item"),
        ("move", "Move-Item"),
        ("cat", "Get-Content"),
        ("type", "Get-Content"),
        ("gc", "Get-Content"),
        ("curl", "Invoke-WebRequest"),
        ("wget", "Invoke-WebRequest"),
        ("iwr", "Invoke-WebRequest"),
        ("irm", "Invoke-RestMethod"),
        ("ps", "Get-Process"),
        ("gps", "Get-Process"),
        ("kill", "Stop-Process"),
        ("spps", "Stop-Process"),
        ("sleep", "Start-Sleep"),
        ("pwd", "Get-Location"),
        ("gl", "Get-Location"),
        ("cd", "Set-Location"),
        ("sl", "Set-Location"),
        ("echo", "Write-Output"),
        ("write", "Write-Output"),
        ("cls", "Clear-Host"),
        ("clear", "Clear-Host"),
        ("gcm", "Get-Command"),
        ("gm", "Get-Member"),
        ("select", "Select-Object"),
        ("where", "Where-Object"),
        ("sort", "Sort-Object"),
        ("sal", "Set-Alias"),
        ("saps", "Start-Process"),
        ("start", "Start-Process"),
        ("ni", "New-Item"),
        ("sc", "Set-Content"),
    ])
});

/// Resolve the leading token against the built-in alias table.
///
/// Returns the command with the first token substituted plus the
/// (alias, cmdlet) pair, or None when the first token is not an alias.
pub fn resolve_alias(command: &str) -> Option<(String, &'static str, &'static str)> {
    let trimmed = command.trim_start();
    let first = trimmed.split_whitespace().next()?;
    let lower = first.to_lowercase();
    let (alias, cmdlet) = ALIASES.get_key_value(lower.as_str()).map(|(a, c)| (*a, *c))?;
    let rest = &trimmed[first.len()..];
    Some((format!("{}{}", cmdlet, rest), alias, cmdlet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses() {
        assert_eq!(normalize("Get-Date   -Format  U"), "get-date -format u");
    }

    #[test]
    fn strips_quoted_literals() {
        assert_eq!(
            normalize(r#"Write-Output "hello world""#),
            "write-output <str>"
        );
        assert_eq!(normalize("Write-Output 'a b c'"), "write-output <str>");
    }

    #[test]
    fn strips_path_tokens() {
        assert_eq!(normalize(r"Remove-Item C:\temp\x.txt"), "remove-item <path>");
        assert_eq!(normalize("Remove-Item ./x.txt"), "remove-item <path>");
        assert_eq!(normalize("cat /etc/hosts"), "cat <path>");
        assert_eq!(normalize("ls ~/projects"), "ls <path>");
    }

    #[test]
    fn bare_flags_survive() {
        assert_eq!(normalize("MyTool --flag"), "mytool --flag");
    }

    #[test]
    fn same_key_for_distinct_literals() {
        let a = normalize(r#"Remove-Item "C:\a\b.txt""#);
        let b = normalize("remove-item   'D:/other/file.log'");
        assert_eq!(a, b);
    }

    #[test]
    fn alias_resolution() {
        let (resolved, alias, cmdlet) = resolve_alias("ls -Force").unwrap();
        assert_eq!(resolved, "Get-ChildItem -Force");
        assert_eq!(alias, "ls");
        assert_eq!(cmdlet, "Get-ChildItem");
    }

    #[test]
    fn alias_is_case_insensitive() {
        let (resolved, _, _) = resolve_alias("IEX $payload").unwrap();
        assert!(resolved.starts_with("Invoke-Expression"));
    }

    #[test]
    fn non_alias_passes_through() {
        assert!(resolve_alias("Get-Date").is_none());
        assert!(resolve_alias("").is_none());
    }
}
