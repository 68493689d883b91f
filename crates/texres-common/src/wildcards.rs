// wildcards.rs: glob-style matching for cvar names
//
// Supports: * (any run), ? (one char), [...] (set), [!...] (negated set), a-z ranges.

/// Test if `pattern` matches all of `name`.
pub fn wildcardfit(pattern: &str, name: &str) -> bool {
    let p = pattern.as_bytes();
    let t = name.as_bytes();

    let mut pi = 0;
    let mut ti = 0;
    // Position to resume from after the most recent '*': (pattern index, text index).
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                b'*' => {
                    backtrack = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                b'?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_set(p, pi + 1, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    }
                }
                ch => {
                    if ch == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        match backtrack {
            Some((star, consumed)) => {
                pi = star + 1;
                ti = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match `ch` against the set starting right after '['.
/// Returns (matched, index after the closing ']'), or None if the set is unterminated.
fn match_set(p: &[u8], start: usize, ch: u8) -> Option<(bool, usize)> {
    let mut i = start;
    let negate = i < p.len() && p[i] == b'!';
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < p.len() && (p[i] != b']' || first) {
        first = false;
        if i + 2 < p.len() && p[i + 1] == b'-' && p[i + 2] != b']' {
            if p[i] <= ch && ch <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == ch {
                matched = true;
            }
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(wildcardfit("tex_pool_slots", "tex_pool_slots"));
        assert!(!wildcardfit("tex_pool_slots", "tex_pool_slot"));
    }

    #[test]
    fn test_star() {
        assert!(wildcardfit("tex_*", "tex_thrash_window"));
        assert!(wildcardfit("tex_*", "tex_"));
        assert!(wildcardfit("*_kb", "tex_pool_budget_kb"));
        assert!(wildcardfit("tex_*_kb", "tex_pool_budget_kb"));
        assert!(!wildcardfit("tex_*", "vid_mode"));
    }

    #[test]
    fn test_question_mark() {
        assert!(wildcardfit("r_?", "r_a"));
        assert!(!wildcardfit("r_?", "r_ab"));
    }

    #[test]
    fn test_sets() {
        assert!(wildcardfit("adr[0-9]", "adr7"));
        assert!(!wildcardfit("adr[0-9]", "adrx"));
        assert!(wildcardfit("adr[!0-9]", "adrx"));
        assert!(wildcardfit("[ab]*", "budget"));
    }

    #[test]
    fn test_unterminated_set_never_matches() {
        assert!(!wildcardfit("tex_[a", "tex_a"));
    }
}
