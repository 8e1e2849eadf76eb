// src/diff.rs

//! Sorted string-list difference formatting
//!
//! Compares two sorted string lists (either plain values or `key:value`
//! entries) and describes how they differ. Used by the upgrade-need
//! predicate to explain why a package is being reinstalled.

use std::collections::HashSet;
use std::fmt::Write;

/// Compare two sorted string lists and describe the difference.
///
/// Returns `None` when the lists are identical. Otherwise returns a string
/// in the format `"changed: k:a->b, ..., added: x, ..., removed: y, ..."`
/// with empty clauses omitted. Entries sharing a prefix up to the first `:`
/// but differing after it count as changed rather than added+removed.
/// Entries present in `ignore` are skipped on both sides.
pub fn stringlist_diff(
    left: &[String],
    right: &[String],
    ignore: Option<&HashSet<String>>,
) -> Option<String> {
    let ignored = |item: &str| ignore.is_some_and(|set| set.contains(item));

    let mut changed = String::new();
    let mut added = String::new();
    let mut removed = String::new();

    let mut li = 0;
    let mut ri = 0;
    while li < left.len() || ri < right.len() {
        // Less = only in left (removed), Greater = only in right (added)
        let ord = if li == left.len() {
            std::cmp::Ordering::Greater
        } else if ri == right.len() {
            std::cmp::Ordering::Less
        } else {
            let l = &left[li];
            let r = &right[ri];
            let mut ord = l.as_str().cmp(r.as_str());
            if ord != std::cmp::Ordering::Equal {
                if let Some(colon) = l.find(':') {
                    let prefix = &l[..colon + 1];
                    if r.starts_with(prefix) {
                        let _ = write!(
                            changed,
                            ", {}{}->{}",
                            prefix,
                            &l[colon + 1..],
                            &r[colon + 1..]
                        );
                        ord = std::cmp::Ordering::Equal;
                    }
                }
            }
            ord
        };

        match ord {
            std::cmp::Ordering::Less => {
                if !ignored(&left[li]) {
                    let _ = write!(removed, ", {}", left[li]);
                }
                li += 1;
            }
            std::cmp::Ordering::Greater => {
                if !ignored(&right[ri]) {
                    let _ = write!(added, ", {}", right[ri]);
                }
                ri += 1;
            }
            std::cmp::Ordering::Equal => {
                li += 1;
                ri += 1;
            }
        }
    }

    if changed.is_empty() && added.is_empty() && removed.is_empty() {
        return None;
    }

    let mut out = String::new();
    let mut comma = false;
    // The leading ", " of each accumulator is skipped
    if !changed.is_empty() {
        let _ = write!(out, "changed: {}", &changed[2..]);
        comma = true;
    }
    if !added.is_empty() {
        let _ = write!(out, "{}added: {}", if comma { ", " } else { "" }, &added[2..]);
        comma = true;
    }
    if !removed.is_empty() {
        let _ = write!(
            out,
            "{}removed: {}",
            if comma { ", " } else { "" },
            &removed[2..]
        );
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_lists_have_no_diff() {
        let a = list(&["bar", "baz", "foo"]);
        assert_eq!(stringlist_diff(&a, &a, None), None);
        assert_eq!(stringlist_diff(&[], &[], None), None);
    }

    #[test]
    fn test_disjoint_lists_are_pure_add_remove() {
        let a = list(&["aaa", "bbb"]);
        let b = list(&["ccc", "ddd"]);
        let diff = stringlist_diff(&a, &b, None).unwrap();
        assert_eq!(diff, "added: ccc, ddd, removed: aaa, bbb");
        assert!(!diff.contains("changed"));
    }

    #[test]
    fn test_changed_key_value() {
        let a = list(&["x:1"]);
        let b = list(&["x:2"]);
        let diff = stringlist_diff(&a, &b, None).unwrap();
        assert_eq!(diff, "changed: x:1->2");
    }

    #[test]
    fn test_mixed_clauses_in_order() {
        let a = list(&["gone", "opt:on"]);
        let b = list(&["new", "opt:off"]);
        let diff = stringlist_diff(&a, &b, None).unwrap();
        assert_eq!(diff, "changed: opt:on->off, added: new, removed: gone");
    }

    #[test]
    fn test_ignore_set_is_skipped() {
        let a = list(&["libc.so.7"]);
        let b = list(&[]);
        let mut ignore = HashSet::new();
        ignore.insert("libc.so.7".to_string());
        assert_eq!(stringlist_diff(&a, &b, Some(&ignore)), None);
        assert!(stringlist_diff(&a, &b, None).is_some());
    }
}
