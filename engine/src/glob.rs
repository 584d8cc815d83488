//! Wildcard matching for exclude patterns.
//!
//! `*` matches any run of characters (including none), `?` matches exactly one
//! character. Matching is case-insensitive and anchored at both ends. There is
//! no special treatment of path separators: `*` crosses them.

/// Match `text` against `pattern`.
///
/// Two-pointer scan: on a `*` remember where it was and where the text was,
/// and on a later mismatch retry with the star consuming one more character.
pub fn matches(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();

    let (mut ti, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || eq_ignore_case(p[pi], t[ti])) {
            ti += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}
