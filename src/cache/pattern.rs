//! Redis-compatible glob matching.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes, the subset
//! `SCAN ... MATCH` understands.

/// Returns true when `candidate` matches the glob `pattern`.
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut s) = (0usize, 0usize);
    // Resume point after the latest `*`: (pattern index past the star, candidate index).
    let mut backtrack: Option<(usize, usize)> = None;

    while s < candidate.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p + 1, s));
                p += 1;
                continue;
            }
            Some('?') => Some(p + 1),
            Some('[') => match match_class(&pattern, p, candidate[s]) {
                Some((true, next)) => Some(next),
                Some((false, _)) => None,
                // Unterminated class: treat the bracket literally.
                None => (candidate[s] == '[').then_some(p + 1),
            },
            Some('\\') if p + 1 < pattern.len() => {
                (pattern[p + 1] == candidate[s]).then_some(p + 2)
            }
            Some(c) => (*c == candidate[s]).then_some(p + 1),
            None => None,
        };

        match step {
            Some(next) => {
                p = next;
                s += 1;
            }
            None => match backtrack {
                Some((star_p, star_s)) => {
                    p = star_p;
                    s = star_s + 1;
                    backtrack = Some((star_p, star_s + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Evaluate the class starting at `pattern[start] == '['` against `ch`.
///
/// Returns whether it matched and the index just past the closing `]`, or
/// `None` when the class is never closed.
fn match_class(pattern: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    loop {
        let c = *pattern.get(i)?;
        match c {
            ']' => break,
            '\\' => {
                let escaped = *pattern.get(i + 1)?;
                matched |= escaped == ch;
                i += 2;
            }
            _ if pattern.get(i + 1) == Some(&'-')
                && pattern.get(i + 2).is_some_and(|end| *end != ']') =>
            {
                let end = pattern[i + 2];
                let (lo, hi) = if c <= end { (c, end) } else { (end, c) };
                matched |= (lo..=hi).contains(&ch);
                i += 3;
            }
            _ => {
                matched |= c == ch;
                i += 1;
            }
        }
    }

    Some((matched != negate, i + 1))
}

/// Escape glob metacharacters so `value` only matches itself.
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
