use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    RankEntry, ScarcityView, Scope, ScopeKey, StudentScoreRecord, SCARCITY_POINTER_KEY,
};
use crate::scarcity::project;
use crate::store::SnapshotStore;

pub const MAX_LEADERBOARD_PAGE: usize = 500;

pub async fn get_rank<S: SnapshotStore>(
    store: &S,
    scope: Scope,
    scope_id: &str,
    student_id: Uuid,
) -> Result<Option<RankEntry>> {
    let key = ScopeKey::new(scope, scope_id).pointer_key();
    match store.pointer(&key).await? {
        Some(pointer) => store.rank_of(pointer.current_cycle, student_id).await,
        None => Ok(None),
    }
}

pub async fn get_leaderboard<S: SnapshotStore>(
    store: &S,
    scope: Scope,
    scope_id: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<RankEntry>> {
    let key = ScopeKey::new(scope, scope_id).pointer_key();
    let limit = limit.clamp(1, MAX_LEADERBOARD_PAGE);
    match store.pointer(&key).await? {
        Some(pointer) => store.ranks(pointer.current_cycle, limit, offset).await,
        None => Ok(Vec::new()),
    }
}

/// The score record behind a student's published national rank.
pub async fn get_score<S: SnapshotStore>(
    store: &S,
    student_id: Uuid,
) -> Result<Option<StudentScoreRecord>> {
    match store.pointer(&ScopeKey::national().pointer_key()).await? {
        Some(pointer) => store.score_of(pointer.current_cycle, student_id).await,
        None => Ok(None),
    }
}

pub async fn get_scarcity<S: SnapshotStore>(
    store: &S,
    opportunity_id: Uuid,
    viewer_college_id: Option<&str>,
) -> Result<Option<ScarcityView>> {
    let Some(pointer) = store.pointer(SCARCITY_POINTER_KEY).await? else {
        return Ok(None);
    };
    let snapshot = store
        .scarcity_of(pointer.current_cycle, opportunity_id)
        .await?;
    Ok(snapshot.map(|snapshot| project(snapshot, viewer_college_id)))
}

/// When readers of `key` last saw new data.
pub async fn last_updated<S: SnapshotStore>(store: &S, key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(store.pointer(key).await?.map(|pointer| pointer.published_at))
}
