//! Release identity derivation
//!
//! `release_id = canonical_title + ":" + posted_date`, where `posted_date` is
//! the UTC calendar date formatted `YYYY-MM-DD`. Articles for the same title
//! posted on either side of UTC midnight get two distinct ids.

use crate::normalize::{NormalizedSubject, normalize};
use crate::types::ReleaseId;
use chrono::{DateTime, NaiveDate, Utc};

/// UTC calendar date used in release ids
#[must_use]
pub fn posted_date(posted_at: DateTime<Utc>) -> NaiveDate {
    posted_at.date_naive()
}

/// Release id for an already-canonical title
#[must_use]
pub fn derive(canonical_title: &str, posted_at: DateTime<Utc>) -> ReleaseId {
    ReleaseId::new(canonical_title, posted_date(posted_at))
}

/// Normalize `subject` and derive its release id
///
/// Returns `None` when the subject normalizes to an empty title.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use usenet_idx::identity::identify;
///
/// let at = Utc.with_ymd_and_hms(2025, 8, 17, 14, 3, 0).unwrap();
/// let (id, _) = identify("[01/15] - Some.Release.part01.rar", at).unwrap();
/// assert_eq!(id.as_str(), "some.release:2025-08-17");
/// ```
#[must_use]
pub fn identify(subject: &str, posted_at: DateTime<Utc>) -> Option<(ReleaseId, NormalizedSubject)> {
    let normalized = normalize(subject);
    if normalized.title.is_empty() {
        return None;
    }
    let id = derive(&normalized.title, posted_at);
    Some((id, normalized))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn canonical_identity() {
        let at = Utc.with_ymd_and_hms(2025, 8, 17, 9, 0, 0).unwrap();
        let (id, n) = identify("[01/15] - Some.Release.part01.rar", at).unwrap();
        assert_eq!(id.as_str(), "some.release:2025-08-17");
        assert_eq!(n.part_total, 15);
    }

    #[test]
    fn segments_of_one_release_share_an_id() {
        let morning = Utc.with_ymd_and_hms(2025, 8, 17, 0, 0, 1).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 8, 17, 23, 59, 59).unwrap();

        let (a, _) = identify("[01/15] - \"Some.Release.part01.rar\" yEnc", morning).unwrap();
        let (b, _) = identify("[15/15] - \"Some.Release.part15.rar\" yEnc", night).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn release_straddling_utc_midnight_splits_in_two() {
        let before = Utc.with_ymd_and_hms(2025, 8, 17, 23, 59, 30).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 8, 18, 0, 0, 30).unwrap();

        let (a, _) = identify("[01/02] - Some.Release.part01.rar", before).unwrap();
        let (b, _) = identify("[02/02] - Some.Release.part02.rar", after).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "some.release:2025-08-17");
        assert_eq!(b.as_str(), "some.release:2025-08-18");
    }

    #[test]
    fn local_offsets_are_converted_to_utc() {
        let offset = FixedOffset::west_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2025, 8, 17, 23, 30, 0).unwrap();
        let id = derive("some.release", local.with_timezone(&Utc));
        assert_eq!(id.as_str(), "some.release:2025-08-18");
    }

    #[test]
    fn empty_titles_have_no_identity() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(identify("[1/2]", at).is_none());
        assert!(identify("   ", at).is_none());
    }

    #[test]
    fn identity_is_stable_across_runs() {
        let at = Utc.with_ymd_and_hms(2025, 8, 17, 12, 0, 0).unwrap();
        let first = identify("[01/15] - Some.Release.part01.rar", at).unwrap().0;
        for _ in 0..10 {
            assert_eq!(identify("[01/15] - Some.Release.part01.rar", at).unwrap().0, first);
        }
    }
}
