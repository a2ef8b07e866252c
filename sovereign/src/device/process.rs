//! Remote process discovery helpers.
//!
//! Guests are found by pattern over `ps -ef`. The query pipeline itself shows
//! up in the listing, so every pattern is rewritten to the bracket form
//! (`crosvm` -> `[c]rosvm`): the regex still matches the guest while the
//! literal text of the grep no longer matches itself.

/// Signals sent to guest processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_arg(self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-9",
        }
    }
}

/// Rewrite `pattern` into its self-match-safe form.
///
/// Leading `^` anchors and backslash escapes are kept in place and the first
/// literal after them is bracketed. Patterns whose first literal is already a
/// bracket expression, or that start with another metacharacter, are returned
/// unchanged.
pub fn self_match_safe(pattern: &str) -> String {
    let mut prefix = 0;
    loop {
        let mut rest = pattern[prefix..].chars();
        match rest.next() {
            Some('^') => prefix += 1,
            Some('\\') => prefix += 1 + rest.next().map_or(0, char::len_utf8),
            Some(c) if c.is_alphanumeric() || "/_- ".contains(c) => {
                let (head, tail) = pattern.split_at(prefix);
                return format!("{}[{}]{}", head, c, &tail[c.len_utf8()..]);
            }
            _ => return pattern.to_string(),
        }
    }
}

/// Shell pipeline printing the pid of the first process matching `pattern`.
pub fn find_pid_command(pattern: &str) -> String {
    format!(
        "ps -ef | grep '{}' | awk '{{print $2}}' | head -1",
        self_match_safe(pattern)
    )
}

/// Extract a pid from the output of [`find_pid_command`].
pub fn parse_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse().ok())
}

/// Watchdog supervisor pattern for a service.
pub fn watchdog_pattern(service: &str) -> String {
    format!("[s]overeign_start.sh.*{}", service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_match_safe() {
        assert_eq!(self_match_safe("crosvm.*sql"), "[c]rosvm.*sql");
        assert_eq!(self_match_safe("[c]rosvm.*sql"), "[c]rosvm.*sql");
        assert_eq!(self_match_safe("x"), "[x]");
        assert_eq!(self_match_safe(""), "");
    }

    #[test]
    fn test_self_match_safe_skips_anchors_and_escapes() {
        assert_eq!(self_match_safe("^crosvm"), "^[c]rosvm");
        assert_eq!(self_match_safe(r"\.crosvm"), r"\.[c]rosvm");
        assert_eq!(self_match_safe(r"^\/data/vm"), r"^\/[d]ata/vm");
        assert_eq!(self_match_safe("^[c]rosvm"), "^[c]rosvm");
        assert_eq!(self_match_safe(".*sql"), ".*sql");
        assert_eq!(self_match_safe("^"), "^");
        assert_eq!(self_match_safe("\\"), "\\");
    }

    #[test]
    fn test_find_pid_command() {
        assert_eq!(
            find_pid_command("crosvm.*vm/vault/"),
            "ps -ef | grep '[c]rosvm.*vm/vault/' | awk '{print $2}' | head -1"
        );
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("12345\n"), Some(12345));
        assert_eq!(parse_pid("\n  812 \n"), Some(812));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("grep: bad"), None);
    }

    #[test]
    fn test_watchdog_pattern() {
        assert_eq!(watchdog_pattern("forge"), "[s]overeign_start.sh.*forge");
    }
}
