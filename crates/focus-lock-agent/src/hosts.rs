//! Managed block of the system hosts file.
//!
//! The writer owns exactly the byte range between its two marker lines;
//! everything outside is preserved verbatim. Each blocked hostname gets an
//! IPv4 and an IPv6 sink line, and inputs are expanded with common
//! subdomain prefixes plus a curated map for popular sites whose mobile
//! and CDN hostnames do not follow the generic pattern.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use focus_lock_common::Result;
use focus_lock_platform::OsPlatform;

pub const START_MARKER: &str = "#### FOCUS LOCK START ####";
pub const END_MARKER: &str = "#### FOCUS LOCK END ####";

const SINK_V4: &str = "127.0.0.1";
const SINK_V6: &str = "::1";

/// Well-known subdomains that the generic expansion misses.
static POPULAR_SITES: &[(&str, &[&str])] = &[
    (
        "facebook.com",
        &[
            "www.facebook.com",
            "m.facebook.com",
            "touch.facebook.com",
            "l.facebook.com",
            "static.xx.fbcdn.net",
        ],
    ),
    (
        "instagram.com",
        &["www.instagram.com", "m.instagram.com", "l.instagram.com", "api.instagram.com"],
    ),
    (
        "twitter.com",
        &["www.twitter.com", "m.twitter.com", "mobile.twitter.com", "api.twitter.com"],
    ),
    ("x.com", &["www.x.com", "m.x.com", "mobile.x.com", "api.x.com"]),
    ("youtube.com", &["www.youtube.com", "m.youtube.com", "music.youtube.com"]),
    ("tiktok.com", &["www.tiktok.com", "m.tiktok.com", "v16-web.tiktok.com"]),
    ("reddit.com", &["www.reddit.com", "old.reddit.com", "new.reddit.com", "i.reddit.com"]),
    ("netflix.com", &["www.netflix.com", "api-global.netflix.com"]),
];

pub struct HostsWriter {
    platform: Arc<dyn OsPlatform>,
}

impl HostsWriter {
    pub fn new(platform: Arc<dyn OsPlatform>) -> Self {
        Self { platform }
    }

    /// Replace the managed region with sink entries for the given domains
    /// and flush the resolver cache. Idempotent: repeated calls with the
    /// same input produce byte-identical file content.
    pub fn block(&self, domains: &[String]) -> Result<()> {
        let path = self.platform.hosts_path();
        ensure_writable(&path)?;

        let content = fs::read_to_string(&path)?;
        let mut lines = strip_managed_region(&content);

        let expanded = expand_domains(domains);
        lines.push(START_MARKER.to_string());
        for host in &expanded {
            lines.push(format!("{SINK_V4} {host}"));
            lines.push(format!("{SINK_V6} {host}"));
        }
        lines.push(END_MARKER.to_string());

        fs::write(&path, lines.join("\n"))?;
        self.platform.flush_dns_cache();
        Ok(())
    }

    /// Remove the managed region entirely and flush the resolver cache.
    pub fn unblock(&self) -> Result<()> {
        let path = self.platform.hosts_path();
        ensure_writable(&path)?;

        let content = fs::read_to_string(&path)?;
        let lines = strip_managed_region(&content);
        fs::write(&path, lines.join("\n"))?;
        self.platform.flush_dns_cache();
        Ok(())
    }
}

fn strip_managed_region(content: &str) -> Vec<String> {
    let mut outside = Vec::new();
    let mut in_region = false;
    for line in content.split('\n') {
        let trimmed = line.trim();
        if trimmed == START_MARKER {
            in_region = true;
            continue;
        }
        if trimmed == END_MARKER {
            in_region = false;
            continue;
        }
        if !in_region {
            outside.push(line.to_string());
        }
    }
    outside
}

fn ensure_writable(path: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        debug!("hosts file is read-only, relaxing permissions");
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Normalize and expand the input domains into the full sink set, sorted
/// so that repeated generation is deterministic.
pub fn expand_domains(inputs: &[String]) -> Vec<String> {
    let mut unique = BTreeSet::new();

    for raw in inputs {
        let Some(domain) = clean_domain(raw) else {
            continue;
        };

        unique.insert(domain.clone());
        unique.insert(format!("www.{domain}"));
        unique.insert(format!("m.{domain}"));
        unique.insert(format!("mobile.{domain}"));

        for (root, subdomains) in POPULAR_SITES {
            if domain == *root || domain.ends_with(&format!(".{root}")) {
                unique.extend(subdomains.iter().map(|s| s.to_string()));
            }
        }
    }

    unique.into_iter().collect()
}

/// Extract a lowercase hostname from free-form user input (bare domain,
/// URL with scheme, path or port).
fn clean_domain(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate).ok()?;
    url.host_str().map(|host| host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_lock_platform::MockPlatform;

    fn writer_with_hosts(seed: &str) -> (tempfile::TempDir, MockPlatform, HostsWriter) {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        fs::write(platform.hosts_path(), seed).unwrap();
        let writer = HostsWriter::new(Arc::new(platform.clone()));
        (dir, platform, writer)
    }

    const SEED: &str = "127.0.0.1 localhost\n::1 localhost\n";

    #[test]
    fn test_block_is_idempotent() {
        let (_dir, platform, writer) = writer_with_hosts(SEED);
        let domains = vec!["example.com".to_string(), "reddit.com".to_string()];

        writer.block(&domains).unwrap();
        let first = fs::read_to_string(platform.hosts_path()).unwrap();
        writer.block(&domains).unwrap();
        let second = fs::read_to_string(platform.hosts_path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(platform.dns_flushes(), 2);
    }

    #[test]
    fn test_block_preserves_bytes_outside_markers() {
        let (_dir, platform, writer) = writer_with_hosts(SEED);
        writer.block(&["example.com".to_string()]).unwrap();

        let content = fs::read_to_string(platform.hosts_path()).unwrap();
        assert!(content.starts_with(SEED));

        writer.unblock().unwrap();
        let content = fs::read_to_string(platform.hosts_path()).unwrap();
        assert_eq!(content, SEED);
    }

    #[test]
    fn test_each_host_gets_one_v4_and_one_v6_line() {
        let (_dir, platform, writer) = writer_with_hosts(SEED);
        writer.block(&["example.com".to_string()]).unwrap();

        let content = fs::read_to_string(platform.hosts_path()).unwrap();
        let start = content.find(START_MARKER).unwrap();
        let end = content.find(END_MARKER).unwrap();
        let region = &content[start..end];

        for host in expand_domains(&["example.com".to_string()]) {
            assert_eq!(
                region.matches(&format!("{SINK_V4} {host}\n")).count(),
                1,
                "exactly one IPv4 line for {host}"
            );
            assert_eq!(
                region.matches(&format!("{SINK_V6} {host}\n")).count(),
                1,
                "exactly one IPv6 line for {host}"
            );
        }
    }

    #[test]
    fn test_block_replaces_previous_region() {
        let (_dir, platform, writer) = writer_with_hosts(SEED);
        writer.block(&["example.com".to_string()]).unwrap();
        writer.block(&["other.net".to_string()]).unwrap();

        let content = fs::read_to_string(platform.hosts_path()).unwrap();
        assert!(!content.contains("example.com"));
        assert!(content.contains("other.net"));
        assert_eq!(content.matches(START_MARKER).count(), 1);
    }

    #[test]
    fn test_unblock_without_region_is_harmless() {
        let (_dir, platform, writer) = writer_with_hosts(SEED);
        writer.unblock().unwrap();
        assert_eq!(fs::read_to_string(platform.hosts_path()).unwrap(), SEED);
    }

    #[test]
    fn test_generic_expansion() {
        let expanded = expand_domains(&["Example.com".to_string()]);
        assert!(expanded.contains(&"example.com".to_string()));
        assert!(expanded.contains(&"www.example.com".to_string()));
        assert!(expanded.contains(&"m.example.com".to_string()));
        assert!(expanded.contains(&"mobile.example.com".to_string()));
    }

    #[test]
    fn test_popular_site_expansion() {
        let expanded = expand_domains(&["facebook.com".to_string()]);
        assert!(expanded.contains(&"static.xx.fbcdn.net".to_string()));
        assert!(expanded.contains(&"touch.facebook.com".to_string()));
    }

    #[test]
    fn test_expansion_is_sorted_and_unique() {
        let expanded =
            expand_domains(&["b.com".to_string(), "a.com".to_string(), "b.com".to_string()]);
        let mut sorted = expanded.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(expanded, sorted);
    }

    #[test]
    fn test_clean_domain_handles_urls_and_noise() {
        assert_eq!(clean_domain("https://www.Example.com/path?q=1"), Some("www.example.com".into()));
        assert_eq!(clean_domain("  reddit.com  "), Some("reddit.com".into()));
        assert_eq!(clean_domain("reddit.com:8080"), Some("reddit.com".into()));
        assert_eq!(clean_domain(""), None);
    }
}
