/// GPU-name matching helpers shared by offer ranking and configuration.
///
/// We keep this intentionally small: comma-separated pattern lists with `*`
/// wildcard support (case-insensitive), plus plain substring deny-lists.
// Mobile / laptop parts report desktop-class names in some listings but throttle
// hard under sustained load; they are never acceptable render nodes.
pub const DEFAULT_MOBILE_GPU_MARKERS: &str = "LAPTOP,MOBILE,MAX-Q,NOTEBOOK";

/// Uppercase, treat `_`/`-` as spaces and collapse whitespace so that
/// "rtx_4090", "RTX-4090" and "RTX  4090" compare equal.
pub fn normalize_gpu_name(name: &str) -> String {
    name.trim()
        .to_ascii_uppercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse comma-separated patterns.
///
/// - Trims whitespace
/// - Drops empty entries
/// - If input is empty/None, returns `default` split the same way
pub fn parse_patterns(raw: Option<&str>, default: &str) -> Vec<String> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    };
    let out = split(raw.unwrap_or(""));
    if out.is_empty() {
        split(default)
    } else {
        out
    }
}

/// Return true if `gpu_name` matches at least one pattern.
///
/// Pattern rules:
/// - Case-insensitive, names normalized with [`normalize_gpu_name`]
/// - `*` matches any substring (including empty)
/// - A pattern without `*` must match the whole name
pub fn gpu_matches_patterns(gpu_name: &str, patterns: &[String]) -> bool {
    let name = normalize_gpu_name(gpu_name);
    if name.is_empty() {
        return false;
    }

    patterns.iter().any(|pat| glob_match(&name, &normalize_pattern(pat)))
}

/// Case-insensitive substring test against a deny-list.
/// Returns the first marker found so callers can log why an offer was dropped.
pub fn gpu_name_contains_any<'a>(gpu_name: &str, markers: &'a [String]) -> Option<&'a str> {
    let name = normalize_gpu_name(gpu_name);
    markers
        .iter()
        .find(|m| {
            let m = normalize_gpu_name(m);
            !m.is_empty() && name.contains(&m)
        })
        .map(|m| m.as_str())
}

fn normalize_pattern(pattern: &str) -> String {
    // Keep '*' while normalizing the literal chunks around it.
    pattern
        .split('*')
        .map(normalize_gpu_name)
        .collect::<Vec<_>>()
        .join("*")
}

fn glob_match(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return name == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut idx = 0usize;

    // If pattern doesn't start with '*', first part is a required prefix.
    if !pattern.starts_with('*') {
        let first = parts.first().copied().unwrap_or("");
        if !name.starts_with(first) {
            return false;
        }
        idx = first.len();
    }

    let last_index = parts.len().saturating_sub(1);
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 && !pattern.starts_with('*') {
            continue;
        }
        // Last part is checked as a suffix below.
        if i == last_index && !pattern.ends_with('*') {
            continue;
        }
        match name[idx..].find(part) {
            Some(pos) => idx += pos + part.len(),
            None => return false,
        }
    }

    if !pattern.ends_with('*') {
        let last = parts.last().copied().unwrap_or("");
        if !last.is_empty() && (!name.ends_with(last) || name.len() - last.len() < idx) {
            return false;
        }
    }

    true
}
