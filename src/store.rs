//! Store-facing types and the collaborator traits the pipeline drives.
//!
//! The import pipeline treats the data store and the blob backend as black
//! boxes. [`Store`] covers row-level operations (per-entity find/create/
//! update, bulk name lookups, bulk post persistence) and [`FileStore`] covers
//! named blob content. The crate ships an in-memory implementation of both in
//! [`crate::memory`]; production backends implement these traits elsewhere.

use std::io::Read;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by store and blob-backend implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A failed bulk save or overwrite. When the store can pinpoint the failing
/// row it reports its index into the submitted slice, which the batch
/// importer maps back to a source line number.
#[derive(Debug, Error)]
#[error("bulk save failed: {source}")]
pub struct BulkSaveError {
    pub row: Option<usize>,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Default)]
pub struct RoleRecord {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemeRecord {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub scope: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct TeamRecord {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub team_type: String,
    pub description: String,
    pub scheme_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelRecord {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub display_name: String,
    pub channel_type: String,
    pub header: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub nickname: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    pub roles: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BotRecord {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub description: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PostRecord {
    /// Empty until the store has persisted the row.
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    /// Parent post id for replies, empty for root posts.
    pub root_id: String,
    pub message: String,
    pub create_at: i64,
    pub edit_at: i64,
    pub post_type: String,
    pub is_pinned: bool,
    pub props: Option<serde_json::Value>,
    pub file_ids: Vec<String>,
}

impl PostRecord {
    pub fn is_saved(&self) -> bool {
        !self.id.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: i64,
    /// Blob path in the [`FileStore`].
    pub path: String,
    pub post_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub team_id: String,
    pub create_at: i64,
}

#[derive(Debug, Clone)]
pub struct ReactionRecord {
    pub user_id: String,
    pub post_id: String,
    pub emoji_name: String,
    pub create_at: i64,
}

#[derive(Debug, Clone)]
pub struct PreferenceRecord {
    pub user_id: String,
    pub category: String,
    pub name: String,
    pub value: String,
}

/// Preference category used for "flagged by" markers on imported posts.
pub const PREFERENCE_FLAGGED_POST: &str = "flagged_post";

#[derive(Debug, Clone)]
pub struct ThreadMembershipRecord {
    pub post_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EmojiRecord {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub image_path: String,
}

/// Row-level operations the pipeline needs from the data store.
///
/// Implementations are expected to make each bulk call atomic on their side;
/// the pipeline provides no cross-call transaction.
pub trait Store: Send + Sync {
    /// Route subsequent reads to the primary replica. Held for the whole run
    /// so find-or-create logic never sees stale replica state.
    fn lock_to_primary(&self);
    fn unlock_from_primary(&self);

    fn role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StoreError>;
    fn save_role(&self, role: RoleRecord) -> Result<RoleRecord, StoreError>;

    fn scheme_by_name(&self, name: &str) -> Result<Option<SchemeRecord>, StoreError>;
    fn save_scheme(&self, scheme: SchemeRecord) -> Result<SchemeRecord, StoreError>;

    fn team_by_name(&self, name: &str) -> Result<Option<TeamRecord>, StoreError>;
    fn teams_by_names(&self, names: &[String]) -> Result<Vec<TeamRecord>, StoreError>;
    fn save_team(&self, team: TeamRecord) -> Result<TeamRecord, StoreError>;

    fn channel_by_name(&self, team_id: &str, name: &str)
    -> Result<Option<ChannelRecord>, StoreError>;
    fn save_channel(&self, channel: ChannelRecord) -> Result<ChannelRecord, StoreError>;

    fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    fn users_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserRecord>, StoreError>;
    fn save_user(&self, user: UserRecord) -> Result<UserRecord, StoreError>;
    fn save_bot(&self, bot: BotRecord) -> Result<BotRecord, StoreError>;
    fn save_team_member(&self, team_id: &str, user_id: &str, roles: &str)
    -> Result<(), StoreError>;
    fn save_channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
        roles: &str,
    ) -> Result<(), StoreError>;

    /// Find the direct or group channel for exactly this member set.
    fn direct_channel(&self, member_ids: &[String]) -> Result<Option<ChannelRecord>, StoreError>;
    fn create_direct_channel(
        &self,
        member_ids: &[String],
        header: &str,
    ) -> Result<ChannelRecord, StoreError>;

    fn posts_created_at(&self, channel_id: &str, create_at: i64)
    -> Result<Vec<PostRecord>, StoreError>;
    /// Persist new rows in input order, assigning ids. Atomic per call.
    fn save_posts(&self, posts: &[PostRecord]) -> Result<Vec<PostRecord>, BulkSaveError>;
    /// Replace existing rows (matched by id) in input order. Atomic per call.
    fn overwrite_posts(&self, posts: &[PostRecord]) -> Result<Vec<PostRecord>, BulkSaveError>;

    fn save_reaction(&self, reaction: ReactionRecord) -> Result<(), StoreError>;
    fn save_preferences(&self, preferences: &[PreferenceRecord]) -> Result<(), StoreError>;
    fn save_thread_memberships(
        &self,
        memberships: &[ThreadMembershipRecord],
    ) -> Result<(), StoreError>;

    fn files_for_post(&self, post_id: &str) -> Result<Vec<FileRecord>, StoreError>;
    fn save_file(&self, file: FileRecord) -> Result<FileRecord, StoreError>;
    fn delete_file(&self, file_id: &str) -> Result<(), StoreError>;
    fn attach_file_to_post(&self, file_id: &str, post_id: &str) -> Result<(), StoreError>;

    fn emoji_by_name(&self, name: &str) -> Result<Option<EmojiRecord>, StoreError>;
    fn save_emoji(&self, emoji: EmojiRecord) -> Result<EmojiRecord, StoreError>;
}

/// Named blob content behind the store's file rows.
pub trait FileStore: Send + Sync {
    /// Open a stored blob for reading.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StoreError>;
    /// Write a blob, replacing any previous content at the path. Returns the
    /// number of bytes written.
    fn store(&self, path: &str, data: &mut dyn Read) -> Result<u64, StoreError>;
}

/// RAII guard for primary-replica routing. Acquired once per import run and
/// released on every exit path, including early aborts.
pub struct PrimaryRouteGuard {
    store: Arc<dyn Store>,
}

impl PrimaryRouteGuard {
    pub fn acquire(store: Arc<dyn Store>) -> Self {
        store.lock_to_primary();
        Self { store }
    }
}

impl Drop for PrimaryRouteGuard {
    fn drop(&mut self) {
        self.store.unlock_from_primary();
    }
}
