use crate::db::*;
use crate::types::ReleaseId;
use chrono::{TimeZone, Utc};

mod segments;

/// Release posted 2025-08-17 in `alt.binaries.test`
fn sample_release(title: &str) -> NewRelease {
    let posted_at = Utc.with_ymd_and_hms(2025, 8, 17, 12, 0, 0).unwrap();
    NewRelease {
        release_id: ReleaseId::new(title, posted_at.date_naive()),
        canonical_title: title.to_string(),
        category_id: 2040,
        source_group: "alt.binaries.test".to_string(),
        posted_at,
        expected_parts: 3,
        language: "und".to_string(),
        tags: vec!["hdr".to_string()],
        article_low: 100,
        article_high: 102,
    }
}

fn sample_segment(release: &NewRelease, segment_number: u32, size_bytes: u64) -> NewSegment {
    NewSegment {
        release_id: release.release_id.clone(),
        segment_number,
        message_id: format!("part{}.{}@test", segment_number, release.canonical_title),
        group_name: release.source_group.clone(),
        size_bytes,
    }
}
