use crate::{BuildStatus, FunctionStatus, PrState};

/// Precedence of a status in the lifecycle, highest wins. Committed and
/// committed-needs-fix share a tier: the fix flag is a health marker, not a
/// demotion.
pub fn rank(status: FunctionStatus) -> u8 {
    match status {
        FunctionStatus::Merged => 6,
        FunctionStatus::InReview => 5,
        FunctionStatus::Committed | FunctionStatus::CommittedNeedsFix => 4,
        FunctionStatus::Matched => 3,
        FunctionStatus::InProgress => 2,
        FunctionStatus::Claimed => 1,
        FunctionStatus::Unclaimed => 0,
    }
}

/// Status a fresh match report implies, or `None` when the current status is
/// protected and automatic sync must leave it alone.
///
/// At a full match the outcome refines by what else is known: a merged PR
/// wins, then committed-ness, then plain `matched`.
pub fn derive_status(
    current: FunctionStatus,
    match_percent: f64,
    is_committed: bool,
    pr_state: Option<PrState>,
) -> Option<FunctionStatus> {
    if current.is_protected() {
        return None;
    }
    let derived = if match_percent >= 100.0 {
        if pr_state == Some(PrState::Merged) {
            FunctionStatus::Merged
        } else if is_committed {
            FunctionStatus::Committed
        } else {
            FunctionStatus::Matched
        }
    } else {
        match_tier(match_percent)
    };
    Some(derived)
}

/// Status the full fact set implies, protected or not. Used by consistency
/// checks that compare stored status against the evidence.
///
/// PR state dominates: merged and open PRs pin the status outright, a closed
/// PR voids the commit evidence and falls back to the match tier.
pub fn expected_status(
    match_percent: f64,
    is_committed: bool,
    build_status: Option<BuildStatus>,
    pr_state: Option<PrState>,
) -> FunctionStatus {
    match pr_state {
        Some(PrState::Merged) => return FunctionStatus::Merged,
        Some(PrState::Open) => return FunctionStatus::InReview,
        Some(PrState::Closed) => return match_tier(match_percent),
        None => {}
    }
    if is_committed {
        return if build_status == Some(BuildStatus::Broken) {
            FunctionStatus::CommittedNeedsFix
        } else {
            FunctionStatus::Committed
        };
    }
    match_tier(match_percent)
}

fn match_tier(match_percent: f64) -> FunctionStatus {
    if match_percent >= 95.0 {
        FunctionStatus::Matched
    } else if match_percent > 0.0 {
        FunctionStatus::InProgress
    } else {
        FunctionStatus::Unclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_statuses_are_never_rederived() {
        for current in [
            FunctionStatus::Merged,
            FunctionStatus::InReview,
            FunctionStatus::Committed,
            FunctionStatus::CommittedNeedsFix,
        ] {
            assert_eq!(derive_status(current, 100.0, false, None), None);
        }
    }

    #[test]
    fn full_match_refines_by_evidence() {
        assert_eq!(
            derive_status(FunctionStatus::Matched, 100.0, false, Some(PrState::Merged)),
            Some(FunctionStatus::Merged)
        );
        assert_eq!(
            derive_status(FunctionStatus::Matched, 100.0, true, None),
            Some(FunctionStatus::Committed)
        );
        assert_eq!(
            derive_status(FunctionStatus::InProgress, 100.0, false, None),
            Some(FunctionStatus::Matched)
        );
    }

    #[test]
    fn partial_matches_tier_by_percent() {
        assert_eq!(
            derive_status(FunctionStatus::Unclaimed, 96.2, false, None),
            Some(FunctionStatus::Matched)
        );
        assert_eq!(
            derive_status(FunctionStatus::Claimed, 42.0, false, None),
            Some(FunctionStatus::InProgress)
        );
        assert_eq!(
            derive_status(FunctionStatus::Claimed, 0.0, false, None),
            Some(FunctionStatus::Unclaimed)
        );
    }

    #[test]
    fn expected_status_follows_pr_state_first() {
        assert_eq!(
            expected_status(50.0, true, None, Some(PrState::Merged)),
            FunctionStatus::Merged
        );
        assert_eq!(
            expected_status(100.0, true, None, Some(PrState::Open)),
            FunctionStatus::InReview
        );
        assert_eq!(
            expected_status(97.0, true, None, Some(PrState::Closed)),
            FunctionStatus::Matched
        );
    }

    #[test]
    fn committed_evidence_beats_match_tier() {
        assert_eq!(
            expected_status(80.0, true, None, None),
            FunctionStatus::Committed
        );
        assert_eq!(
            expected_status(80.0, true, Some(BuildStatus::Broken), None),
            FunctionStatus::CommittedNeedsFix
        );
        assert_eq!(
            expected_status(80.0, true, Some(BuildStatus::Passing), None),
            FunctionStatus::Committed
        );
    }

    #[test]
    fn ranks_order_the_lifecycle() {
        assert!(rank(FunctionStatus::Merged) > rank(FunctionStatus::InReview));
        assert!(rank(FunctionStatus::InReview) > rank(FunctionStatus::Committed));
        assert_eq!(
            rank(FunctionStatus::Committed),
            rank(FunctionStatus::CommittedNeedsFix)
        );
        assert!(rank(FunctionStatus::Matched) > rank(FunctionStatus::InProgress));
        assert!(rank(FunctionStatus::Claimed) > rank(FunctionStatus::Unclaimed));
    }
}
