use crate::profile::{ConnectionProfile, DEFAULT_SSH_PORT};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBlock {
    pub patterns: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct ConfigParseError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedConfig {
    pub blocks: Vec<HostBlock>,
    pub diagnostics: Vec<ConfigParseError>,
}

#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub local_user: String,
    pub home_dir: Option<PathBuf>,
}

impl ResolveContext {
    pub fn from_env() -> Self {
        let local_user = ["USER", "USERNAME"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .unwrap_or_else(|| "root".to_string());
        Self {
            local_user,
            home_dir: dirs::home_dir(),
        }
    }

    pub fn expand_home(&self, path: &str) -> String {
        match (path.strip_prefix('~'), &self.home_dir) {
            (Some(rest), Some(home)) => format!("{}{}", home.display(), rest),
            _ => path.to_string(),
        }
    }
}

pub fn parse(content: &str) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    let mut current: Option<HostBlock> = None;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = split_key_value(line);
        match key.as_str() {
            "host" => {
                parsed.blocks.extend(current.take());
                let patterns: Vec<String> = value.split_whitespace().map(str::to_string).collect();
                if patterns.is_empty() {
                    parsed.diagnostics.push(ConfigParseError {
                        line: line_no,
                        reason: "Host line without patterns closes the current block".to_string(),
                    });
                } else {
                    current = Some(HostBlock {
                        patterns,
                        properties: BTreeMap::new(),
                    });
                }
            }
            _ => {
                let Some(block) = current.as_mut() else {
                    parsed.diagnostics.push(ConfigParseError {
                        line: line_no,
                        reason: format!("'{key}' outside of a Host block is ignored"),
                    });
                    continue;
                };
                if value.is_empty() {
                    parsed.diagnostics.push(ConfigParseError {
                        line: line_no,
                        reason: format!("'{key}' has no value"),
                    });
                    continue;
                }
                block
                    .properties
                    .entry(key)
                    .or_insert_with(|| value.to_string());
            }
        }
    }
    parsed.blocks.extend(current);
    parsed
}

/// Splits `Key value` or `Key=value`; the key is lower-cased.
fn split_key_value(line: &str) -> (String, &str) {
    let split_at = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let key = line[..split_at].to_lowercase();
    let mut rest = line[split_at..].trim_start();
    if let Some(stripped) = rest.strip_prefix('=') {
        rest = stripped.trim_start();
    }
    (key, rest.trim_end())
}

pub fn is_concrete(pattern: &str) -> bool {
    !pattern.contains(['*', '?'])
}

/// Case-sensitive glob: `*` matches any sequence, `?` any single character.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = backtrack {
            p = star_p + 1;
            n = star_n + 1;
            backtrack = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Collects the effective properties for `host`, earliest block first.
pub fn resolve_properties(blocks: &[HostBlock], host: &str) -> BTreeMap<String, String> {
    let mut resolved = BTreeMap::new();
    for block in blocks {
        if !block.patterns.iter().any(|p| glob_match(p, host)) {
            continue;
        }
        for (key, value) in &block.properties {
            resolved
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    resolved
}

pub fn concrete_hosts(blocks: &[HostBlock]) -> BTreeSet<String> {
    blocks
        .iter()
        .flat_map(|b| b.patterns.iter())
        .filter(|p| is_concrete(p))
        .cloned()
        .collect()
}

pub fn resolve(parsed: &ParsedConfig, ctx: &ResolveContext) -> Vec<ConnectionProfile> {
    concrete_hosts(&parsed.blocks)
        .into_iter()
        .map(|alias| {
            let props = resolve_properties(&parsed.blocks, &alias);
            let port = props
                .get("port")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .filter(|p| *p != 0)
                .unwrap_or(DEFAULT_SSH_PORT);
            let mut profile = ConnectionProfile::new(
                alias.clone(),
                props.get("hostname").cloned().unwrap_or_else(|| alias.clone()),
                props
                    .get("user")
                    .cloned()
                    .unwrap_or_else(|| ctx.local_user.clone()),
            );
            profile.port = port;
            profile.identity_file = props
                .get("identityfile")
                .map(|v| ctx.expand_home(&v.replace('"', "")));
            profile.proxy_jump = props.get("proxyjump").cloned();
            profile.proxy_command = props.get("proxycommand").cloned();
            profile
        })
        .collect()
}

pub fn resolve_text(
    content: &str,
    ctx: &ResolveContext,
) -> (Vec<ConnectionProfile>, Vec<ConfigParseError>) {
    let parsed = parse(content);
    let profiles = resolve(&parsed, ctx);
    (profiles, parsed.diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext {
            local_user: "operator".to_string(),
            home_dir: Some(PathBuf::from("/home/operator")),
        }
    }

    fn profile<'a>(profiles: &'a [ConnectionProfile], name: &str) -> &'a ConnectionProfile {
        profiles
            .iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("profile {name} not resolved"))
    }

    #[test]
    fn glob_question_mark_matches_exactly_one_char() {
        assert!(glob_match("db-??", "db-01"));
        assert!(!glob_match("db-??", "db-001"));
        assert!(!glob_match("db-??", "db-1"));
    }

    #[test]
    fn glob_star_and_case_sensitivity() {
        assert!(glob_match("web*", "web"));
        assert!(glob_match("web*", "web-eu-1"));
        assert!(glob_match("*.lan", "gpu.rack1.lan"));
        assert!(glob_match("a*b*c", "aXXbYYbZc"));
        assert!(!glob_match("web*", "Web1"));
        assert!(!glob_match("*.lan", "gpu.lan.local"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn first_block_wins_across_blocks() {
        let text = "\
Host web*
    Port 22
    User deploy

Host web1
    Port 2222
    HostName 10.0.0.11
";
        let (profiles, diagnostics) = resolve_text(text, &ctx());
        assert!(diagnostics.is_empty());

        let web1 = profile(&profiles, "web1");
        assert_eq!(web1.port, 22);
        assert_eq!(web1.host, "10.0.0.11");
        assert_eq!(web1.username, "deploy");

        let parsed = parse(text);
        let web2 = resolve_properties(&parsed.blocks, "web2");
        assert_eq!(web2.get("port").map(String::as_str), Some("22"));
    }

    #[test]
    fn first_occurrence_within_block_wins_and_equals_syntax() {
        let text = "host gpu-a\n  Port=2200\n  port 2201\n  USER=ml\n";
        let (profiles, _) = resolve_text(text, &ctx());
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].port, 2200);
        assert_eq!(profiles[0].username, "ml");
    }

    #[test]
    fn fallbacks_and_identity_cleanup() {
        let text = "\
# comment line
Host beta alpha
    IdentityFile \"~/.ssh/id_ed25519\"
    Port notanumber
    ProxyJump jump@bastion:2022
    ProxyCommand ssh -W %h:%p gateway
";
        let (profiles, _) = resolve_text(text, &ctx());
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);

        let alpha = &profiles[0];
        assert_eq!(alpha.host, "alpha");
        assert_eq!(alpha.username, "operator");
        assert_eq!(alpha.port, 22);
        assert_eq!(
            alpha.identity_file.as_deref(),
            Some("/home/operator/.ssh/id_ed25519")
        );
        assert_eq!(alpha.proxy_jump.as_deref(), Some("jump@bastion:2022"));
        assert_eq!(
            alpha.proxy_command.as_deref(),
            Some("ssh -W %h:%p gateway")
        );
    }

    #[test]
    fn malformed_host_line_closes_block() {
        let text = "\
Host gpu-a
    User ml
Host
    User leaked
    Port 2022
";
        let parsed = parse(text);
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(
            parsed.blocks[0].properties.get("user").map(String::as_str),
            Some("ml")
        );
        assert!(parsed.blocks[0].properties.get("port").is_none());
        assert_eq!(parsed.diagnostics.len(), 3);
        assert_eq!(parsed.diagnostics[0].line, 3);
    }

    #[test]
    fn wildcard_only_blocks_produce_no_profiles() {
        let text = "Host *\n    User root\nHost db-??\n    Port 5022\n";
        let (profiles, _) = resolve_text(text, &ctx());
        assert!(profiles.is_empty());
    }

    #[test]
    fn match_line_is_an_ordinary_property() {
        let text = "Host gpu-a\n  Port 2200\nMatch all\n  User x\n";
        let parsed = parse(text);
        assert!(parsed.diagnostics.is_empty());
        assert_eq!(parsed.blocks.len(), 1);
        let props = &parsed.blocks[0].properties;
        assert_eq!(props.get("match").map(String::as_str), Some("all"));
        assert_eq!(props.get("user").map(String::as_str), Some("x"));
        assert_eq!(props.get("port").map(String::as_str), Some("2200"));

        let (profiles, _) = resolve_text(text, &ctx());
        let gpu = profile(&profiles, "gpu-a");
        assert_eq!(gpu.username, "x");
        assert_eq!(gpu.port, 2200);
    }
}
