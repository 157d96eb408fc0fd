//! Group discovery
//!
//! Expands configured group patterns into the concrete list of groups the
//! ingest loop polls. Literal names pass through; wildcard patterns are
//! listed on the server (through the resilience wrapper), filtered against
//! the ignore set and truncated at the enumeration cap.

use crate::config::GroupConfig;
use crate::error::IngestError;
use crate::protocol::ProtocolClient;
use crate::resilience::{NNTP, Resilience};
use crate::Result;

/// Outcome of expanding every configured pattern
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredGroups {
    /// Groups to ingest, deduplicated, in discovery order
    pub groups: Vec<String>,
    /// Patterns whose listing call failed this round
    pub failed_patterns: Vec<String>,
}

/// Whether `pattern` needs a listing call
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Match `name` against a wildmat pattern supporting `*` and `?`
///
/// ```
/// use usenet_idx::discovery::wildmat_matches;
///
/// assert!(wildmat_matches("alt.binaries.*", "alt.binaries.tv"));
/// assert!(!wildmat_matches("alt.binaries.?v", "alt.binaries.tv.hd"));
/// ```
pub fn wildmat_matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ni));
                pi += 1;
            }
            Some(&c) if c == '?' || c == n[ni] => {
                pi += 1;
                ni += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pi = star + 1;
                    ni = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Whether `group` matches any entry of the ignore set
pub fn is_ignored(group: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|pattern| wildmat_matches(pattern, group))
}

/// Expand one pattern into concrete group names
///
/// # Errors
///
/// [`IngestError::GroupListUnavailable`] when the listing call fails after
/// retries (or the NNTP breaker is open).
pub async fn discover(
    client: &dyn ProtocolClient,
    resilience: &Resilience,
    pattern: &str,
    cap: usize,
    ignore: &[String],
) -> Result<Vec<String>> {
    if !is_wildcard(pattern) {
        if is_ignored(pattern, ignore) {
            tracing::debug!(group = pattern, "Configured group is in the ignore set");
            return Ok(Vec::new());
        }
        return Ok(vec![pattern.to_string()]);
    }

    let listed = resilience
        .call(NNTP, || client.list_groups(pattern))
        .await
        .map_err(|e| IngestError::GroupListUnavailable {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

    let total = listed.len();
    let groups: Vec<String> = listed
        .into_iter()
        .filter(|g| !is_ignored(g, ignore))
        .take(cap)
        .collect();

    tracing::debug!(pattern, listed = total, kept = groups.len(), cap, "Expanded group pattern");
    Ok(groups)
}

/// Expand every configured pattern; failed patterns are reported, not fatal
pub async fn resolve_all(
    client: &dyn ProtocolClient,
    resilience: &Resilience,
    config: &GroupConfig,
) -> DiscoveredGroups {
    let mut found = DiscoveredGroups::default();

    for pattern in config.patterns() {
        match discover(
            client,
            resilience,
            &pattern,
            config.enumeration_cap,
            &config.ignore,
        )
        .await
        {
            Ok(groups) => {
                for group in groups {
                    if !found.groups.contains(&group) {
                        found.groups.push(group);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Group listing failed, skipping pattern this cycle");
                found.failed_patterns.push(pattern);
            }
        }
    }

    found
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, RetryConfig};
    use crate::error::ProtocolError;
    use crate::types::{ArticleInfo, GroupWatermarks, OverviewEntry};
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ListingClient {
        groups: Vec<&'static str>,
        fail: bool,
        calls: AtomicU32,
    }

    impl ListingClient {
        fn new(groups: Vec<&'static str>) -> Self {
            Self {
                groups,
                fail: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProtocolClient for ListingClient {
        async fn list_groups(&self, pattern: &str) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Protocol(ProtocolError::Transient("LIST failed".into())));
            }
            Ok(self
                .groups
                .iter()
                .filter(|g| wildmat_matches(pattern, g))
                .map(|g| g.to_string())
                .collect())
        }

        async fn group_watermarks(&self, _group: &str) -> Result<GroupWatermarks> {
            unreachable!()
        }

        async fn fetch_headers(&self, _: &str, _: u64, _: u64) -> Result<Vec<OverviewEntry>> {
            unreachable!()
        }

        async fn fetch_by_message_id(&self, _: &str, _: &str) -> Result<ArticleInfo> {
            unreachable!()
        }
    }

    fn resilience() -> Resilience {
        Resilience::new(&ResilienceConfig {
            failure_threshold: 5,
            reset_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                jitter: Duration::ZERO,
            },
        })
    }

    #[test]
    fn wildmat() {
        assert!(wildmat_matches("*", "anything"));
        assert!(wildmat_matches("alt.binaries.*", "alt.binaries.tv"));
        assert!(wildmat_matches("alt.*.tv", "alt.binaries.tv"));
        assert!(wildmat_matches("a?c", "abc"));
        assert!(!wildmat_matches("a?c", "abbc"));
        assert!(!wildmat_matches("alt.binaries.*", "alt.misc"));
        assert!(wildmat_matches("alt.binaries.tv", "alt.binaries.tv"));
        assert!(wildmat_matches("*.*.mp3", "alt.binaries.sounds.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn literal_passes_through_without_listing() {
        let client = ListingClient::new(vec![]);
        let groups = discover(&client, &resilience(), "alt.binaries.tv", 10, &[])
            .await
            .unwrap();
        assert_eq!(groups, vec!["alt.binaries.tv"]);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_literal_is_dropped() {
        let client = ListingClient::new(vec![]);
        let ignore = vec!["alt.binaries.tv".to_string()];
        let groups = discover(&client, &resilience(), "alt.binaries.tv", 10, &ignore)
            .await
            .unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wildcard_is_filtered_then_capped() {
        let client = ListingClient::new(vec![
            "alt.binaries.a",
            "alt.binaries.spam",
            "alt.binaries.b",
            "alt.binaries.c",
            "alt.misc",
        ]);
        let ignore = vec!["*.spam".to_string()];
        let groups = discover(&client, &resilience(), "alt.binaries.*", 2, &ignore)
            .await
            .unwrap();
        assert_eq!(groups, vec!["alt.binaries.a", "alt.binaries.b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failure_is_an_ingest_error() {
        let mut client = ListingClient::new(vec![]);
        client.fail = true;
        let result = discover(&client, &resilience(), "alt.binaries.*", 10, &[]).await;
        assert!(matches!(
            result,
            Err(Error::Ingest(IngestError::GroupListUnavailable { ref pattern, .. }))
                if pattern == "alt.binaries.*"
        ));
        // One attempt plus two retries
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_all_dedupes_and_reports_failures() {
        let client = ListingClient::new(vec!["alt.binaries.a", "alt.binaries.b"]);
        let config = GroupConfig {
            groups: vec!["alt.binaries.*".to_string(), "alt.binaries.a".to_string()],
            ..GroupConfig::default()
        };
        let found = resolve_all(&client, &resilience(), &config).await;
        assert_eq!(found.groups, vec!["alt.binaries.a", "alt.binaries.b"]);
        assert!(found.failed_patterns.is_empty());

        let mut failing = ListingClient::new(vec![]);
        failing.fail = true;
        let found = resolve_all(&failing, &resilience(), &config).await;
        assert_eq!(found.groups, vec!["alt.binaries.a"]);
        assert_eq!(found.failed_patterns, vec!["alt.binaries.*"]);
    }
}
