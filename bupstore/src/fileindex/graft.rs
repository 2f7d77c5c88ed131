//! Grafting: remapping real host paths to virtual archive paths (spec.md §4.5).

/// One `(real_prefix, archive_prefix)` rule. Longest `archive_prefix` match wins when
/// ungrafting; longest `real_prefix` match wins when grafting.
#[derive(Debug, Clone)]
pub struct GraftRule {
    pub real_prefix: String,
    pub archive_prefix: String,
}

/// Rewrites a real, canonicalized absolute path into its virtual archive path, using
/// whichever rule's `real_prefix` is the longest match.
pub fn graftpath(rules: &[GraftRule], real_path: &str) -> String {
    let best = rules
        .iter()
        .filter(|r| real_path == r.real_prefix || real_path.starts_with(&format!("{}/", r.real_prefix.trim_end_matches('/'))))
        .max_by_key(|r| r.real_prefix.len());

    match best {
        Some(rule) => {
            let stripped = &real_path[rule.real_prefix.trim_end_matches('/').len()..];
            format!("{}{}", rule.archive_prefix.trim_end_matches('/'), stripped)
        }
        None => real_path.to_string(),
    }
}

/// The inverse of [`graftpath`]: recovers a real path from a virtual archive path,
/// using whichever rule's `archive_prefix` is the longest match.
pub fn ungraftpath(rules: &[GraftRule], archive_path: &str) -> String {
    let best = rules
        .iter()
        .filter(|r| {
            archive_path == r.archive_prefix
                || archive_path.starts_with(&format!("{}/", r.archive_prefix.trim_end_matches('/')))
        })
        .max_by_key(|r| r.archive_prefix.len());

    match best {
        Some(rule) => {
            let stripped = &archive_path[rule.archive_prefix.trim_end_matches('/').len()..];
            format!("{}{}", rule.real_prefix.trim_end_matches('/'), stripped)
        }
        None => archive_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graft_and_ungraft_round_trip() {
        let rules = vec![GraftRule { real_prefix: "/home/alice".into(), archive_prefix: "/archive".into() }];
        let archived = graftpath(&rules, "/home/alice/docs/file.txt");
        assert_eq!(archived, "/archive/docs/file.txt");
        assert_eq!(ungraftpath(&rules, &archived), "/home/alice/docs/file.txt");
    }

    #[test]
    fn longest_prefix_wins() {
        let rules = vec![
            GraftRule { real_prefix: "/home".into(), archive_prefix: "/a".into() },
            GraftRule { real_prefix: "/home/alice".into(), archive_prefix: "/b".into() },
        ];
        assert_eq!(graftpath(&rules, "/home/alice/x"), "/b/x");
        assert_eq!(graftpath(&rules, "/home/bob/x"), "/a/bob/x");
    }

    #[test]
    fn no_matching_rule_passes_through() {
        let rules: Vec<GraftRule> = vec![];
        assert_eq!(graftpath(&rules, "/etc/passwd"), "/etc/passwd");
    }
}
