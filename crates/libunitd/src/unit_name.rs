//! Unit name escaping, unescaping, and template handling.
//!
//! Unit names have the shape `prefix[@instance].suffix`. The suffix selects
//! the unit type. Names derived from filesystem paths (mounts, swaps,
//! devices, automounts) use a reversible escaping:
//!
//! - runs of `/` collapse to one, leading and trailing `/` are stripped
//! - `/` becomes `-`
//! - every byte outside `[A-Za-z0-9:_.]` becomes `\xHH`
//! - a leading `.` is escaped as `\x2e`
//! - the root path `/` becomes `-`

use crate::units::UnitIdKind;

/// Characters that survive escaping unchanged: ASCII letters, digits,
/// `:`, `_`, `.`
fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '.'
}

/// Escape an arbitrary string for use inside a unit name.
///
/// # Examples
///
/// ```
/// use libunitd::unit_name::escape_name;
/// assert_eq!(escape_name("foo bar"), r"foo\x20bar");
/// assert_eq!(escape_name("foo/bar"), "foo-bar");
/// assert_eq!(escape_name(".hidden"), r"\x2ehidden");
/// ```
pub fn escape_name(s: &str) -> String {
    if s.is_empty() {
        return "-".to_string();
    }

    let mut out = String::with_capacity(s.len() * 2);
    for (i, c) in s.chars().enumerate() {
        if c == '/' {
            out.push('-');
        } else if i == 0 && c == '.' {
            out.push_str("\\x2e");
        } else if is_plain_char(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("\\x{b:02x}"));
            }
        }
    }
    out
}

/// Reverse [`escape_name`]. Returns `None` on a malformed escape sequence.
pub fn unescape_name(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' => {
                out.push(b'/');
                i += 1;
            }
            b'\\' if i + 3 < bytes.len() && bytes[i + 1] == b'x' => {
                let hi = hex_digit(bytes[i + 2])?;
                let lo = hex_digit(bytes[i + 3])?;
                out.push(hi << 4 | lo);
                i += 4;
            }
            b'\\' => return None,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

/// Build a unit name from an absolute filesystem path and a type suffix.
///
/// The path is canonicalized lexically first: runs of `/` collapse, the
/// trailing `/` is trimmed. `name_from_path("/", ".mount")` is `-.mount`.
///
/// # Examples
///
/// ```
/// use libunitd::unit_name::name_from_path;
/// assert_eq!(name_from_path("/home", ".mount"), "home.mount");
/// assert_eq!(name_from_path("/dev/sda1", ".device"), "dev-sda1.device");
/// assert_eq!(name_from_path("/foo//bar/", ".mount"), "foo-bar.mount");
/// assert_eq!(name_from_path("/", ".mount"), "-.mount");
/// ```
pub fn name_from_path(path: &str, suffix: &str) -> String {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        return format!("-{suffix}");
    }
    format!("{}{}", escape_name(&normalized), suffix)
}

/// Recover the filesystem path a unit name was derived from. The suffix is
/// stripped if present. The result always begins with `/`.
///
/// Round-trip: `path_from_name(&name_from_path(p, sfx))` equals the
/// lexically canonicalized `p`.
pub fn path_from_name(name: &str) -> Option<String> {
    let stem = match split_suffix(name) {
        Some((stem, _)) => stem,
        None => name,
    };
    let unescaped = unescape_name(stem)?;
    if unescaped == "/" {
        return Some("/".to_string());
    }
    if unescaped.starts_with('/') {
        Some(unescaped)
    } else {
        Some(format!("/{unescaped}"))
    }
}

/// Split a unit name into `(stem, suffix)` where the suffix is one of the
/// recognized unit type suffixes.
pub fn split_suffix(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    let (stem, suffix) = name.split_at(dot);
    UnitIdKind::from_suffix(suffix)?;
    Some((stem, suffix))
}

/// Decompose a name into `(prefix, instance, suffix)`.
///
/// For `getty@tty1.service` this is `("getty", Some("tty1"), ".service")`;
/// for the template `getty@.service` the instance is `Some("")`; for a
/// plain `foo.service` it is `("foo", None, ".service")`.
pub fn template_parts(name: &str) -> Option<(&str, Option<&str>, &str)> {
    let (stem, suffix) = split_suffix(name)?;
    match stem.find('@') {
        Some(at) => Some((&stem[..at], Some(&stem[at + 1..]), suffix)),
        None => Some((stem, None, suffix)),
    }
}

/// `true` for `foo@.service` style names (empty instance).
pub fn is_template(name: &str) -> bool {
    matches!(template_parts(name), Some((_, Some(""), _)))
}

/// `true` for `foo@bar.service` style names (non-empty instance).
pub fn is_instance(name: &str) -> bool {
    matches!(template_parts(name), Some((_, Some(i), _)) if !i.is_empty())
}

/// Compose a template name and an instance string into an instance name.
/// Returns `None` if `template` is not a template.
///
/// ```
/// use libunitd::unit_name::instantiate;
/// assert_eq!(instantiate("getty@.service", "tty1").as_deref(), Some("getty@tty1.service"));
/// ```
pub fn instantiate(template: &str, instance: &str) -> Option<String> {
    let (prefix, inst, suffix) = template_parts(template)?;
    if inst != Some("") {
        return None;
    }
    Some(format!("{prefix}@{instance}{suffix}"))
}

/// For an instance name, the template it came from: `foo@bar.service`
/// gives `foo@.service`.
pub fn template_of(name: &str) -> Option<String> {
    let (prefix, inst, suffix) = template_parts(name)?;
    match inst {
        Some(i) if !i.is_empty() => Some(format!("{prefix}@{suffix}")),
        _ => None,
    }
}

/// Turn an arbitrary user-supplied string into a plausible unit name:
/// absolute paths under `/dev` become device units, other absolute paths
/// mount units, everything else gets escaped and `.service` appended
/// unless a recognized suffix is already present.
pub fn mangle_name(s: &str) -> String {
    if split_suffix(s).is_some() {
        return s.to_string();
    }
    if s.starts_with('/') {
        if s.starts_with("/dev/") || s.starts_with("/sys/") {
            return name_from_path(s, ".device");
        }
        return name_from_path(s, ".mount");
    }
    format!("{}.service", escape_name(s))
}

/// Lexical path normalization: strip leading/trailing `/`, collapse runs.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if !prev_slash {
                out.push('/');
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
