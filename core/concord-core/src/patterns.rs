//! Compiled regex patterns for reading shell commands.
//!
//! Detection is heuristic: it only has to catch the common ways an agent
//! writes a file from a shell (redirection, `tee`, in-place `sed`) so the
//! delegation gate can treat them like a direct edit.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Shell Write Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// Single- or double-quoted span.
pub static RE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).unwrap());

/// `> target` or `>> target`, not preceded by `-`, `=` or `>` (arrows, `=>`).
/// A `&` right after the operator is an fd duplication and never matches.
pub static RE_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[^-=>])>>?\s*("[^"]+"|'[^']+'|[^\s;&|<>()'"]+)"#).unwrap()
});

pub static RE_TEE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\btee\s+(?:-[a-zA-Z]+\s+)*("[^"]+"|'[^']+'|[^\s;&|<>()'"]+)"#).unwrap()
});

/// `sed` invocation carrying `-i` (GNU or BSD spelling) up to the end of its
/// pipeline segment.
pub static RE_SED_IN_PLACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsed\s+(?:[^;&|]*\s)?-[a-zA-Z]*i[^;&|]*").unwrap());

const DEVICE_TARGETS: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty"];

/// Returns the files a shell command would write, in order of appearance.
pub fn shell_write_targets(command: &str) -> Vec<String> {
    // `>` inside quotes is data, not a redirect.
    let masked = RE_QUOTED.replace_all(command, |caps: &regex::Captures| caps[0].replace('>', "_"));

    let mut targets = Vec::new();
    for caps in RE_REDIRECT.captures_iter(&masked) {
        push_target(&mut targets, &caps[1]);
    }
    for caps in RE_TEE.captures_iter(&masked) {
        push_target(&mut targets, &caps[1]);
    }
    for found in RE_SED_IN_PLACE.find_iter(&masked) {
        if let Some(last) = found.as_str().split_whitespace().last() {
            if !last.starts_with('-') {
                push_target(&mut targets, last);
            }
        }
    }
    targets
}

/// Replaces every quoted span with `_`, so arguments like a grep needle are
/// never read as commands.
pub fn mask_quoted(command: &str) -> String {
    RE_QUOTED.replace_all(command, "_").into_owned()
}

fn push_target(targets: &mut Vec<String>, raw: &str) {
    let target = raw.trim_matches(|c| c == '"' || c == '\'');
    if target.is_empty() || DEVICE_TARGETS.contains(&target) {
        return;
    }
    if !targets.iter().any(|t| t == target) {
        targets.push(target.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_targets() {
        assert_eq!(shell_write_targets("echo hi > out.txt"), vec!["out.txt"]);
        assert_eq!(shell_write_targets("cat a >>log/run.log"), vec!["log/run.log"]);
        assert_eq!(
            shell_write_targets(r#"printf x > "my file.rs""#),
            vec!["my file.rs"]
        );
    }

    #[test]
    fn test_fd_duplication_and_devices_are_ignored() {
        assert!(shell_write_targets("cargo build 2>&1 | head").is_empty());
        assert!(shell_write_targets("ls > /dev/null").is_empty());
        assert!(shell_write_targets("git log --format='%h -> %s'").is_empty());
    }

    #[test]
    fn test_quoted_arrow_is_not_a_redirect() {
        assert!(shell_write_targets(r#"echo "a > b""#).is_empty());
    }

    #[test]
    fn test_tee_and_sed_in_place() {
        assert_eq!(shell_write_targets("echo x | tee -a notes.md"), vec!["notes.md"]);
        assert_eq!(
            shell_write_targets("sed -i 's/a/b/' src/main.rs"),
            vec!["src/main.rs"]
        );
        assert_eq!(
            shell_write_targets("sed -i '' -e 's/a/b/' lib.rs && echo done"),
            vec!["lib.rs"]
        );
    }

    #[test]
    fn test_mask_quoted_hides_arguments() {
        assert_eq!(
            mask_quoted(r#"grep -rn "cargo test" README.md"#),
            "grep -rn _ README.md"
        );
        assert_eq!(mask_quoted("echo 'a; b' && ls"), "echo _ && ls");
        assert_eq!(mask_quoted("cargo test"), "cargo test");
    }

    #[test]
    fn test_plain_commands_write_nothing() {
        assert!(shell_write_targets("cargo test --all").is_empty());
        assert!(shell_write_targets("sed 's/a/b/' input.txt").is_empty());
        assert!(shell_write_targets("rg 'fn main' src").is_empty());
    }
}
