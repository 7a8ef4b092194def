//! The sectioned key=value parser for unit fragments, plus the typed value
//! parsers and specifier expansion.
//!
//! Comments start with `#` or `;`. A trailing `\` continues the line. Keys
//! are case-sensitive on disk but normalized to uppercase here so lookups
//! are uniform; values keep their case. Invalid values are never fatal —
//! the directive is skipped with a warning and loading continues.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;

use crate::unit_name;

/// section name → key → values in file order, with a file-wide sequence
/// number so later directives can override earlier ones where that matters.
pub type ParsedSection = HashMap<String, Vec<(u32, String)>>;
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug)]
pub enum ParseError {
    SectionRepeated(String),
    NoSections,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SectionRepeated(name) => write!(f, "section {name} occurs more than once"),
            Self::NoSections => write!(f, "no sections found"),
        }
    }
}

impl std::error::Error for ParseError {}

pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();

    // Join continuation lines first so section/key detection sees whole
    // logical lines.
    let mut logical_lines: Vec<String> = Vec::new();
    let mut pending = String::new();
    for raw in content.lines() {
        let line = raw.trim();
        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped.trim_end());
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        logical_lines.push(std::mem::take(&mut pending));
    }
    if !pending.is_empty() {
        logical_lines.push(pending);
    }

    let mut current_name: Option<String> = None;
    let mut current_lines: Vec<&str> = Vec::new();
    let mut entry_counter: u32 = 0;

    for line in &logical_lines {
        if line.starts_with('[') {
            if let Some(name) = current_name.take() {
                if sections.contains_key(&name) {
                    return Err(ParseError::SectionRepeated(name));
                }
                sections.insert(name, parse_section(&current_lines, &mut entry_counter));
                current_lines.clear();
            }
            current_name = Some(line.trim_matches(['[', ']']).to_owned());
        } else if current_name.is_some() {
            current_lines.push(line.as_str());
        }
        // lines before the first section are ignored
    }
    if let Some(name) = current_name {
        if sections.contains_key(&name) {
            return Err(ParseError::SectionRepeated(name));
        }
        sections.insert(name, parse_section(&current_lines, &mut entry_counter));
    }

    Ok(sections)
}

fn parse_section(lines: &[&str], entry_counter: &mut u32) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();

    for line in lines {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some(pos) = line.find('=') else {
            warn!("ignoring non-assignment line in unit fragment: {line}");
            continue;
        };
        let (key, value) = line.split_at(pos);
        let key = key.trim().to_uppercase();
        let value = value[1..].trim().to_owned();

        entries
            .entry(key)
            .or_default()
            .push((*entry_counter, value));
        *entry_counter += 1;
    }

    entries
}

/// `yes/no/true/false/on/off/1/0`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Duration literals: a bare integer is seconds; otherwise a sequence of
/// `<int><unit>` terms with units us, ms, s, min, h, d, w.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let rest_trimmed = rest.trim_start();
        let digits_end = rest_trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest_trimmed.len());
        if digits_end == 0 {
            return None;
        }
        let value: u64 = rest_trimmed[..digits_end].parse().ok()?;
        let after = &rest_trimmed[digits_end..];
        let (unit_len, unit_duration) = if after.starts_with("ms") {
            (2, Duration::from_millis(value))
        } else if after.starts_with("us") {
            (2, Duration::from_micros(value))
        } else if after.starts_with("min") {
            (3, Duration::from_secs(value * 60))
        } else if after.starts_with('s') {
            (1, Duration::from_secs(value))
        } else if after.starts_with('h') {
            (1, Duration::from_secs(value * 3600))
        } else if after.starts_with('d') {
            (1, Duration::from_secs(value * 24 * 3600))
        } else if after.starts_with('w') {
            (1, Duration::from_secs(value * 7 * 24 * 3600))
        } else {
            return None;
        };
        total += unit_duration;
        rest = &after[unit_len..];
    }
    Some(total)
}

/// Octal file mode, 0000–07777.
pub fn parse_mode(s: &str) -> Option<u32> {
    let mode = u32::from_str_radix(s, 8).ok()?;
    if mode > 0o7777 {
        return None;
    }
    Some(mode)
}

/// Scheduling niceness, -20..=19.
pub fn parse_nice(s: &str) -> Option<i8> {
    let nice: i8 = s.parse().ok()?;
    if !(-20..=19).contains(&nice) {
        return None;
    }
    Some(nice)
}

/// OOM score adjustment, -1000..=1000.
pub fn parse_oom_score_adjust(s: &str) -> Option<i32> {
    let adjust: i32 = s.parse().ok()?;
    if !(-1000..=1000).contains(&adjust) {
        return None;
    }
    Some(adjust)
}

/// Expand `%`-specifiers in a directive value:
///
/// - `%n` full unit name, `%N` the same unescaped
/// - `%p` prefix (name before any `@`), `%P` unescaped
/// - `%i` instance, `%I` unescaped
/// - `%%` literal `%`
pub fn expand_specifiers(value: &str, unit_name_str: &str) -> String {
    let (prefix, instance, _suffix) = match unit_name::template_parts(unit_name_str) {
        Some(parts) => parts,
        None => (unit_name_str, None, ""),
    };
    let instance = instance.unwrap_or("");

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push_str(unit_name_str),
            Some('N') => out.push_str(
                &unit_name::unescape_name(
                    unit_name::split_suffix(unit_name_str)
                        .map(|(stem, _)| stem)
                        .unwrap_or(unit_name_str),
                )
                .unwrap_or_else(|| unit_name_str.to_owned()),
            ),
            Some('p') => out.push_str(prefix),
            Some('P') => out.push_str(
                &unit_name::unescape_name(prefix).unwrap_or_else(|| prefix.to_owned()),
            ),
            Some('i') => out.push_str(instance),
            Some('I') => out.push_str(
                &unit_name::unescape_name(instance).unwrap_or_else(|| instance.to_owned()),
            ),
            Some('%') => out.push('%'),
            Some(other) => {
                warn!("unknown specifier %{other} in {unit_name_str}, keeping verbatim");
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_and_entries() {
        let parsed = parse_file(
            r#"
# header comment
[Unit]
Description=A unit
After=b.service
After=c.service

[Service]
; another comment
ExecStart=/bin/true --flag
"#,
        )
        .unwrap();

        let unit = &parsed["Unit"];
        assert_eq!(unit["DESCRIPTION"][0].1, "A unit");
        assert_eq!(unit["AFTER"].len(), 2);
        assert_eq!(parsed["Service"]["EXECSTART"][0].1, "/bin/true --flag");
    }

    #[test]
    fn repeated_section_rejected() {
        let err = parse_file("[Unit]\nA=1\n[Unit]\nB=2\n").unwrap_err();
        assert!(matches!(err, ParseError::SectionRepeated(_)));
    }

    #[test]
    fn line_continuation() {
        let parsed = parse_file("[Service]\nExecStart=/bin/echo \\\n  hello\n").unwrap();
        assert_eq!(parsed["Service"]["EXECSTART"][0].1, "/bin/echo hello");
    }

    #[test]
    fn bool_literals() {
        for t in ["yes", "true", "on", "1"] {
            assert_eq!(parse_bool(t), Some(true));
        }
        for f in ["no", "false", "off", "0"] {
            assert_eq!(parse_bool(f), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration("2min"), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_duration("1h30min"),
            Some(Duration::from_secs(3600 + 1800))
        );
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("1w"), Some(Duration::from_secs(604800)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn modes() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("7777"), Some(0o7777));
        assert_eq!(parse_mode("17777"), None);
        assert_eq!(parse_mode("abc"), None);
    }

    #[test]
    fn nice_and_oom_ranges() {
        assert_eq!(parse_nice("-20"), Some(-20));
        assert_eq!(parse_nice("19"), Some(19));
        assert_eq!(parse_nice("20"), None);
        assert_eq!(parse_oom_score_adjust("-1000"), Some(-1000));
        assert_eq!(parse_oom_score_adjust("1000"), Some(1000));
        assert_eq!(parse_oom_score_adjust("1001"), None);
    }

    #[test]
    fn specifier_expansion() {
        let name = "getty@tty1.service";
        assert_eq!(expand_specifiers("%n", name), "getty@tty1.service");
        assert_eq!(expand_specifiers("%p", name), "getty");
        assert_eq!(expand_specifiers("%i", name), "tty1");
        assert_eq!(expand_specifiers("run %i now", name), "run tty1 now");
        assert_eq!(expand_specifiers("100%%", name), "100%");
        assert_eq!(
            expand_specifiers("%I", r"mnt@foo\x2dbar.mount"),
            "foo-bar"
        );
    }
}
