//! Subject token matching and validation.
//!
//! Subjects are `.`-separated token lists. Patterns may use `*` to match
//! exactly one token and `>` to match one or more trailing tokens.

use crate::MGMT_PREFIX;

pub const TOKEN_WILDCARD: &str = "*";
pub const TOKEN_FULL_WILDCARD: &str = ">";

fn token_ok(tok: &str) -> bool {
    !tok.is_empty() && !tok.contains(' ') && !tok.contains('\t')
}

/// Valid publish or bind subject (wildcards allowed, `>` only final).
pub fn valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, tok) in tokens.iter().enumerate() {
        if !token_ok(tok) {
            return false;
        }
        if *tok == TOKEN_FULL_WILDCARD && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

/// Literal subject: valid and wildcard-free.
pub fn is_literal(subject: &str) -> bool {
    valid_subject(subject)
        && !subject
            .split('.')
            .any(|t| t == TOKEN_WILDCARD || t == TOKEN_FULL_WILDCARD)
}

/// Stream and consumer names are single tokens: no `.`, no wildcards.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('.')
        && !name.contains('*')
        && !name.contains('>')
        && !name.contains(' ')
        && !name.contains('\t')
}

/// Does `pattern` match the literal `subject`?
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(TOKEN_FULL_WILDCARD), Some(_)) => return true,
            (Some(TOKEN_WILDCARD), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// Do two patterns admit a common literal subject?
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    let mut ta = a.split('.');
    let mut tb = b.split('.');
    loop {
        match (ta.next(), tb.next()) {
            (None, None) => return true,
            (Some(TOKEN_FULL_WILDCARD), Some(_)) | (Some(_), Some(TOKEN_FULL_WILDCARD)) => {
                return true
            }
            (Some(TOKEN_WILDCARD), Some(_)) | (Some(_), Some(TOKEN_WILDCARD)) => continue,
            (Some(x), Some(y)) if x == y => continue,
            _ => return false,
        }
    }
}

/// True when `pattern` could deliver a subject inside the reserved
/// management namespace.
pub fn overlaps_reserved(pattern: &str) -> bool {
    let mgmt_all = format!("{MGMT_PREFIX}>");
    subjects_overlap(pattern, &mgmt_all)
}

/// Is `sub` a subset of `parent` (everything `sub` matches, `parent`
/// matches too)? Used for consumer filters against stream subject sets.
pub fn subject_is_subset(sub: &str, parent: &str) -> bool {
    let pt: Vec<&str> = parent.split('.').collect();
    let st: Vec<&str> = sub.split('.').collect();
    let mut i = 0;
    loop {
        let p = pt.get(i);
        let s = st.get(i);
        match (p, s) {
            (None, None) => return true,
            (Some(&TOKEN_FULL_WILDCARD), Some(_)) => return true,
            (Some(&TOKEN_WILDCARD), Some(&TOKEN_FULL_WILDCARD)) => return false,
            (Some(&TOKEN_WILDCARD), Some(_)) => {}
            (Some(p), Some(s)) if *p == *s => {}
            _ => return false,
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(valid_subject("foo"));
        assert!(valid_subject("foo.bar.baz"));
        assert!(valid_subject("foo.*.baz"));
        assert!(valid_subject("foo.>"));
        assert!(!valid_subject(""));
        assert!(!valid_subject("foo..bar"));
        assert!(!valid_subject(".foo"));
        assert!(!valid_subject("foo."));
        assert!(!valid_subject("foo.>.bar"));
        assert!(!valid_subject("foo bar"));
    }

    #[test]
    fn literals_and_names() {
        assert!(is_literal("foo.bar"));
        assert!(!is_literal("foo.*"));
        assert!(!is_literal("foo.>"));
        assert!(valid_name("ORDERS"));
        assert!(!valid_name("ORDERS.EU"));
        assert!(!valid_name("ORD*"));
        assert!(!valid_name(""));
    }

    #[test]
    fn matching() {
        assert!(subject_matches("foo.*", "foo.bar"));
        assert!(!subject_matches("foo.*", "foo.bar.baz"));
        assert!(subject_matches("foo.>", "foo.bar.baz"));
        assert!(!subject_matches("foo.>", "foo"));
        assert!(subject_matches("foo.bar", "foo.bar"));
        assert!(!subject_matches("foo.bar", "foo.baz"));
        assert!(subject_matches("*.bar", "foo.bar"));
    }

    #[test]
    fn overlap() {
        assert!(subjects_overlap("foo.*", "foo.bar"));
        assert!(subjects_overlap("foo.>", "foo.bar.baz"));
        assert!(subjects_overlap("*.bar", "foo.*"));
        assert!(!subjects_overlap("foo.bar", "foo.baz"));
        assert!(!subjects_overlap("foo.bar", "foo.bar.baz"));
        assert!(overlaps_reserved("mgmt.>"));
        assert!(overlaps_reserved("*.STREAM.>"));
        assert!(!overlaps_reserved("orders.>"));
    }

    #[test]
    fn subset() {
        assert!(subject_is_subset("foo.bar", "foo.*"));
        assert!(subject_is_subset("foo.bar.baz", "foo.>"));
        assert!(subject_is_subset("foo.*", "foo.>"));
        assert!(!subject_is_subset("foo.>", "foo.*"));
        assert!(!subject_is_subset("foo.*", "foo.bar"));
        assert!(subject_is_subset("foo.bar", "foo.bar"));
        assert!(!subject_is_subset("bar.x", "foo.*"));
    }
}
