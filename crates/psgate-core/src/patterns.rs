use regex::Regex;

use crate::error::{PsgateError, Result};
use crate::types::Tier;

/// A single classification pattern before compilation.
#[derive(Debug, Clone)]
pub struct PatternDef {
    pub id: &'static str,
    pub tier: Tier,
    pub category: &'static str,
    pub pattern: &'static str,
}

const fn def(id: &'static str, tier: Tier, category: &'static str, pattern: &'static str) -> PatternDef {
    PatternDef { id, tier, category, pattern }
}

/// Built-in pattern tables, ordered by insertion within each tier.
/// All patterns are case-insensitive; classification runs them against
/// the alias-resolved command text.
pub fn builtin_patterns() -> Vec<PatternDef> {
    vec![
        // ── BLOCKED ─────────────────────────────────────────────
        def("blk-encoded-command", Tier::Blocked, "SECURITY_THREAT",
            r"(?i)-e(nc(odedcommand)?)?\s+[A-Za-z0-9+/=]{16,}"),
        def("blk-download-exec", Tier::Blocked, "SECURITY_THREAT",
            r"(?i)(invoke-expression|iex)\s*\(?.*\b(downloadstring|downloadfile|invoke-webrequest|invoke-restmethod)"),
        def("blk-disable-defender", Tier::Blocked, "SECURITY_THREAT",
            r"(?i)set-mppreference\s+.*-disablerealtimemonitoring"),
        def("blk-shadow-copy", Tier::Blocked, "SECURITY_THREAT",
            r"(?i)vssadmin\s+delete\s+shadows"),
        def("blk-credential-dump", Tier::Blocked, "SECURITY_THREAT",
            r"(?i)(mimikatz|sekurlsa|lsass\.exe.*procdump|procdump.*lsass)"),
        def("blk-root-wipe", Tier::Blocked, "OS_DESTRUCTIVE",
            r"(?i)remove-item\s+.*(-recurse\b.*-force|-force\b.*-recurse).*\s+[a-z]:[\\/]\s*$"),
        def("blk-rm-root", Tier::Blocked, "OS_DESTRUCTIVE",
            r"(?i)rm\s+(-\w+\s+)*-rf?\s+/\s*$"),
        def("blk-boot-config", Tier::Blocked, "OS_DESTRUCTIVE",
            r"(?i)bcdedit\s+.*(deletevalue|/set\s+.*recoveryenabled\s+no)"),
        // ── CRITICAL ────────────────────────────────────────────
        def("crit-force-push", Tier::Critical, "VCS_DESTRUCTIVE",
            r"(?i)git\s+push\s+.*(--force\b|-f\b)"),
        def("crit-branch-delete-remote", Tier::Critical, "VCS_DESTRUCTIVE",
            r"(?i)git\s+push\s+.*--delete"),
        def("crit-format-volume", Tier::Critical, "OS_DESTRUCTIVE",
            r"(?i)(format-volume|clear-disk|initialize-disk)"),
        def("crit-mkfs", Tier::Critical, "OS_DESTRUCTIVE", r"(?i)mkfs\."),
        def("crit-dd-device", Tier::Critical, "OS_DESTRUCTIVE", r"(?i)dd\s+if=.*of=/dev/"),
        def("crit-shutdown", Tier::Critical, "OS_DESTRUCTIVE",
            r"(?i)(stop-computer|restart-computer|shutdown\s+/s|shutdown\s+/r)"),
        def("crit-drop-table", Tier::Critical, "DATA_DESTRUCTIVE", r"(?i)drop\s+(table|database)"),
        def("crit-registry-hklm", Tier::Critical, "OS_DESTRUCTIVE",
            r"(?i)remove-item(property)?\s+.*hklm:"),
        // ── DANGEROUS ───────────────────────────────────────────
        def("dng-recursive-delete", Tier::Dangerous, "FS_DELETE",
            r"(?i)remove-item\s+.*-recurse"),
        def("dng-rm-rf", Tier::Dangerous, "FS_DELETE", r"(?i)rm\s+(-\w*)?r"),
        def("dng-rmdir-s", Tier::Dangerous, "FS_DELETE", r"(?i)rmdir\s+/s"),
        def("dng-git-clean", Tier::Dangerous, "VCS_MUTATION", r"(?i)git\s+clean\s+.*-[a-z]*f"),
        def("dng-git-reset-hard", Tier::Dangerous, "VCS_MUTATION", r"(?i)git\s+reset\s+--hard"),
        def("dng-exec-policy", Tier::Dangerous, "SECURITY_THREAT",
            r"(?i)set-executionpolicy\s+(unrestricted|bypass)"),
        def("dng-new-service", Tier::Dangerous, "OS_MUTATION",
            r"(?i)(new-service|sc\.exe\s+create|schtasks\s+/create)"),
        def("dng-firewall", Tier::Dangerous, "OS_MUTATION",
            r"(?i)(netsh\s+(advfirewall|firewall)|set-netfirewallprofile)"),
        def("dng-stop-process-force", Tier::Dangerous, "PROCESS_CONTROL",
            r"(?i)stop-process\s+.*-force"),
        def("dng-chmod-777", Tier::Dangerous, "OS_MUTATION", r"(?i)chmod\s+777"),
        def("dng-pipe-to-shell", Tier::Dangerous, "SECURITY_THREAT",
            r"(?i)(curl|wget|invoke-webrequest|iwr)\s+.*\|\s*(ba)?sh"),
        // ── RISKY ───────────────────────────────────────────────
        def("rsk-remove-item", Tier::Risky, "FS_DELETE", r"(?i)remove-item\s"),
        def("rsk-del", Tier::Risky, "FS_DELETE", r"(?i)\bdel\s"),
        def("rsk-move-item", Tier::Risky, "FS_MUTATION", r"(?i)(move-item|rename-item)\s"),
        def("rsk-set-content", Tier::Risky, "FS_MUTATION",
            r"(?i)(set-content|add-content|out-file)\s"),
        def("rsk-copy-item", Tier::Risky, "FS_MUTATION", r"(?i)copy-item\s"),
        def("rsk-git-push", Tier::Risky, "VCS_MUTATION", r"(?i)git\s+push\b"),
        def("rsk-git-mutate", Tier::Risky, "VCS_MUTATION",
            r"(?i)git\s+(commit|merge|rebase|cherry-pick|revert|stash)\b"),
        def("rsk-stop-process", Tier::Risky, "PROCESS_CONTROL", r"(?i)stop-process\b"),
        def("rsk-start-process", Tier::Risky, "PROCESS_CONTROL", r"(?i)start-process\b"),
        def("rsk-web-download", Tier::Risky, "NET_MUTATION",
            r"(?i)(invoke-webrequest|invoke-restmethod|start-bitstransfer)\b"),
        def("rsk-install", Tier::Risky, "PKG_MUTATION",
            r"(?i)(install-module|install-package|npm\s+install|pip\s+install|winget\s+install|choco\s+install)"),
        def("rsk-set-item", Tier::Risky, "OS_MUTATION", r"(?i)set-item(property)?\s"),
        def("rsk-new-item", Tier::Risky, "FS_MUTATION", r"(?i)new-item\s"),
        def("rsk-set-env", Tier::Risky, "OS_MUTATION", r"(?i)\[environment\]::setenvironmentvariable"),
        // ── SAFE ────────────────────────────────────────────────
        def("safe-get-cmdlet", Tier::Safe, "READ_ONLY", r"(?i)^\s*get-\w+"),
        def("safe-test-path", Tier::Safe, "READ_ONLY", r"(?i)^\s*(test-path|test-connection|resolve-path)\b"),
        def("safe-measure", Tier::Safe, "READ_ONLY", r"(?i)^\s*(measure-object|measure-command)\b"),
        def("safe-select-string", Tier::Safe, "READ_ONLY", r"(?i)^\s*select-string\b"),
        def("safe-compare", Tier::Safe, "READ_ONLY", r"(?i)^\s*(compare-object|select-object|sort-object|where-object|foreach-object|group-object|format-table|format-list|out-string)\b"),
        def("safe-write-output", Tier::Safe, "DIAGNOSTIC", r"(?i)^\s*(write-output|write-host|echo)\b"),
        def("safe-git-read", Tier::Safe, "VCS_READ",
            r"(?i)^\s*git\s+(status|log|diff|show|branch\s*$|branch\s+-[av]|remote\s+-v|fetch\b)"),
        def("safe-identity", Tier::Safe, "DIAGNOSTIC", r"(?i)^\s*(whoami|hostname)\s*$"),
        def("safe-psversion", Tier::Safe, "DIAGNOSTIC", r"(?i)^\s*\$psversiontable"),
        def("safe-help", Tier::Safe, "DIAGNOSTIC", r"(?i)^\s*(help|man)\s"),
    ]
}

/// One compiled classification pattern.
#[derive(Debug)]
pub struct CompiledPattern {
    pub id: String,
    pub tier: Tier,
    pub category: String,
    pub regex: Regex,
}

/// All patterns for one snapshot, compiled and grouped by tier.
/// Scanning walks tiers in severity order; within a tier, insertion
/// order decides ties.
#[derive(Debug)]
pub struct PatternSet {
    tiers: Vec<(Tier, Vec<CompiledPattern>)>,
}

impl PatternSet {
    /// Compile built-ins plus runtime overrides.
    ///
    /// Merge rules: drop any pattern whose id appears in `suppress`,
    /// then append `additional_safe` to SAFE and `additional_blocked`
    /// to BLOCKED. A pattern that fails to compile is fatal.
    pub fn compile(
        base: &[PatternDef],
        additional_safe: &[String],
        additional_blocked: &[String],
        suppress: &[String],
    ) -> Result<Self> {
        let mut tiers: Vec<(Tier, Vec<CompiledPattern>)> = vec![
            (Tier::Blocked, Vec::new()),
            (Tier::Critical, Vec::new()),
            (Tier::Dangerous, Vec::new()),
            (Tier::Risky, Vec::new()),
            (Tier::Safe, Vec::new()),
        ];

        let mut push = |tier: Tier, id: String, category: String, pattern: &str| -> Result<()> {
            let regex = Regex::new(pattern).map_err(|e| PsgateError::PatternCompile {
                id: id.clone(),
                message: e.to_string(),
            })?;
            let bucket = tiers
                .iter_mut()
                .find(|(t, _)| *t == tier)
                .map(|(_, v)| v)
                .ok_or_else(|| PsgateError::Internal(format!("no bucket for tier {}", tier)))?;
            bucket.push(CompiledPattern { id, tier, category, regex });
            Ok(())
        };

        for p in base {
            if suppress.iter().any(|s| s == p.id) {
                continue;
            }
            push(p.tier, p.id.to_string(), p.category.to_string(), p.pattern)?;
        }
        for (i, pat) in additional_safe.iter().enumerate() {
            push(Tier::Safe, format!("cfg-safe-{}", i), "CONFIG_SAFE".into(), pat)?;
        }
        for (i, pat) in additional_blocked.iter().enumerate() {
            push(Tier::Blocked, format!("cfg-blocked-{}", i), "CONFIG_BLOCKED".into(), pat)?;
        }

        Ok(Self { tiers })
    }

    /// First match in the highest-severity tier, or None.
    pub fn scan(&self, text: &str) -> Option<&CompiledPattern> {
        for (_, patterns) in &self.tiers {
            for p in patterns {
                if p.regex.is_match(text) {
                    return Some(p);
                }
            }
        }
        None
    }

    pub fn pattern_count(&self) -> usize {
        self.tiers.iter().map(|(_, v)| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled() -> PatternSet {
        PatternSet::compile(&builtin_patterns(), &[], &[], &[]).unwrap()
    }

    #[test]
    fn builtins_compile() {
        let set = compiled();
        assert!(set.pattern_count() > 30);
    }

    #[test]
    fn force_push_is_critical() {
        let set = compiled();
        let m = set.scan("git push --force origin main").unwrap();
        assert_eq!(m.tier, Tier::Critical);
        assert_eq!(m.category, "VCS_DESTRUCTIVE");
    }

    #[test]
    fn plain_push_is_risky() {
        let set = compiled();
        let m = set.scan("git push origin main").unwrap();
        assert_eq!(m.tier, Tier::Risky);
    }

    #[test]
    fn remove_item_is_risky() {
        let set = compiled();
        let m = set.scan("Remove-Item ./x.txt").unwrap();
        assert_eq!(m.tier, Tier::Risky);
        assert_eq!(m.category, "FS_DELETE");
    }

    #[test]
    fn recursive_remove_escalates() {
        let set = compiled();
        let m = set.scan("Remove-Item C:\\build -Recurse").unwrap();
        assert_eq!(m.tier, Tier::Dangerous);
    }

    #[test]
    fn get_date_is_safe() {
        let set = compiled();
        let m = set.scan("Get-Date").unwrap();
        assert_eq!(m.tier, Tier::Safe);
    }

    #[test]
    fn higher_severity_preempts() {
        // Matches both safe-git-read (no) and crit-force-push; also the
        // risky git push pattern. Critical must win.
        let set = compiled();
        let m = set.scan("git push -f origin main").unwrap();
        assert_eq!(m.tier, Tier::Critical);
    }

    #[test]
    fn encoded_command_blocked() {
        let set = compiled();
        let m = set
            .scan("powershell -enc SQBuAHYAbwBrAGUALQBFAHgAcAByAGUAcwBzAGkAbwBuAA==")
            .unwrap();
        assert_eq!(m.tier, Tier::Blocked);
        assert_eq!(m.category, "SECURITY_THREAT");
    }

    #[test]
    fn suppress_drops_pattern() {
        let set = PatternSet::compile(
            &builtin_patterns(),
            &[],
            &[],
            &["rsk-git-push".to_string()],
        )
        .unwrap();
        // With the risky push pattern suppressed, a plain push matches nothing
        // in RISKY; the mutation pattern does not cover push.
        let m = set.scan("git push origin main");
        assert!(m.is_none() || m.unwrap().tier != Tier::Risky || m.unwrap().id != "rsk-git-push");
    }

    #[test]
    fn additional_blocked_wins_over_builtin_safe() {
        let set = PatternSet::compile(
            &builtin_patterns(),
            &[],
            &[r"(?i)get-secretvault".to_string()],
            &[],
        )
        .unwrap();
        let m = set.scan("Get-SecretVault").unwrap();
        assert_eq!(m.tier, Tier::Blocked);
    }

    #[test]
    fn invalid_pattern_is_fatal() {
        let err = PatternSet::compile(
            &builtin_patterns(),
            &["(unclosed".to_string()],
            &[],
            &[],
        );
        assert!(matches!(err, Err(PsgateError::PatternCompile { .. })));
    }
}
