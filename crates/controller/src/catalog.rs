//! Runtime version selection against a platform's resolved catalogs.

use std::cmp::Ordering;

use kiln_core::{Kit, Platform};

/// Version the kit asks for: its own trait setting, else the platform default.
pub fn requested_runtime_version(kit: &Kit, platform: &Platform) -> Option<String> {
    kit.spec
        .traits
        .camel
        .as_ref()
        .and_then(|c| c.runtime_version.clone())
        .filter(|v| !v.is_empty())
        .or_else(|| platform.spec.build.runtime_version.clone().filter(|v| !v.is_empty()))
}

/// Catalog entry satisfying `requested`. `3.8.1` needs an exact entry;
/// `3.x` (or `3.8.x`) picks the highest entry under that prefix.
pub fn match_catalog(requested: &str, catalogs: &[String]) -> Option<String> {
    match requested.strip_suffix(".x") {
        Some(stem) => {
            let prefix = format!("{}.", stem);
            catalogs
                .iter()
                .filter(|c| c.starts_with(&prefix))
                .max_by(|a, b| compare_versions(a, b))
                .cloned()
        }
        None => catalogs.iter().find(|c| c.as_str() == requested).cloned(),
    }
}

/// Dotted versions compared segment by segment, numerically where both
/// segments lead with digits.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut xs = a.split('.');
    let mut ys = b.split('.');
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (leading_number(x), leading_number(y)) {
                    (Some(nx), Some(ny)) => nx.cmp(&ny).then_with(|| x.cmp(y)),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn leading_number(s: &str) -> Option<u64> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{CamelTrait, KitSpec, KitTraits, PlatformSpec};

    fn cats(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_request_needs_exact_entry() {
        let c = cats(&["3.8.0", "3.8.1"]);
        assert_eq!(match_catalog("3.8.1", &c).as_deref(), Some("3.8.1"));
        assert_eq!(match_catalog("3.8", &c), None);
    }

    #[test]
    fn wildcard_picks_highest_numerically() {
        let c = cats(&["3.2.0", "3.10.1", "3.9.4", "2.16.0", "30.0.0"]);
        assert_eq!(match_catalog("3.x", &c).as_deref(), Some("3.10.1"));
        assert_eq!(match_catalog("3.9.x", &c).as_deref(), Some("3.9.4"));
        assert_eq!(match_catalog("4.x", &c), None);
    }

    #[test]
    fn kit_trait_wins_over_platform_default() {
        let mut p = Platform::new("p", PlatformSpec::default());
        p.spec.build.runtime_version = Some("3.x".into());
        let plain = Kit::new("a", KitSpec::default());
        assert_eq!(requested_runtime_version(&plain, &p).as_deref(), Some("3.x"));

        let pinned = Kit::new(
            "b",
            KitSpec {
                traits: KitTraits {
                    camel: Some(CamelTrait { runtime_version: Some("3.8.1".into()), ..Default::default() }),
                },
                ..Default::default()
            },
        );
        assert_eq!(requested_runtime_version(&pinned, &p).as_deref(), Some("3.8.1"));
    }
}
