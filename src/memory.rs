//! In-memory [`Store`] and [`FileStore`] implementations.
//!
//! This backend is the reference implementation the unit and integration
//! tests run against. It keeps every table in a single `RwLock`-guarded
//! state struct and assigns UUID row ids, mirroring what a SQL-backed
//! implementation would return.

use crate::store::{
    BotRecord, BulkSaveError, ChannelRecord, EmojiRecord, FileRecord, FileStore, PostRecord,
    PreferenceRecord, ReactionRecord, RoleRecord, SchemeRecord, Store, StoreError, TeamRecord,
    ThreadMembershipRecord, UserRecord,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
struct State {
    roles: HashMap<String, RoleRecord>,
    schemes: HashMap<String, SchemeRecord>,
    teams: HashMap<String, TeamRecord>,
    channels: HashMap<String, ChannelRecord>,
    users: HashMap<String, UserRecord>,
    bots: HashMap<String, BotRecord>,
    /// Sorted member-id set -> channel id.
    direct_channels: HashMap<Vec<String>, String>,
    posts: HashMap<String, PostRecord>,
    files: HashMap<String, FileRecord>,
    reactions: Vec<ReactionRecord>,
    preferences: BTreeMap<(String, String, String), PreferenceRecord>,
    thread_memberships: BTreeMap<(String, String), ThreadMembershipRecord>,
    team_members: BTreeMap<(String, String), String>,
    channel_members: BTreeMap<(String, String), String>,
    emoji: HashMap<String, EmojiRecord>,
}

/// In-memory data store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    primary_locks: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while at least one import run holds the primary-routing lock.
    pub fn routed_to_primary(&self) -> bool {
        self.primary_locks.load(Ordering::SeqCst) > 0
    }

    pub fn team_count(&self) -> usize {
        self.state.read().teams.len()
    }

    pub fn channel_count(&self) -> usize {
        self.state.read().channels.len()
    }

    pub fn user_count(&self) -> usize {
        self.state.read().users.len()
    }

    pub fn post_count(&self) -> usize {
        self.state.read().posts.len()
    }

    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn reaction_count(&self) -> usize {
        self.state.read().reactions.len()
    }

    pub fn all_posts(&self) -> Vec<PostRecord> {
        let mut posts: Vec<_> = self.state.read().posts.values().cloned().collect();
        posts.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        posts
    }

    /// Normalized dump of every table, usable for idempotence assertions.
    pub fn snapshot(&self) -> String {
        let state = self.state.read();
        let mut out = String::new();
        let mut lines: Vec<String> = Vec::new();
        for team in state.teams.values() {
            lines.push(format!("team {} {} {}", team.id, team.name, team.display_name));
        }
        for channel in state.channels.values() {
            lines.push(format!(
                "channel {} {} {} {}",
                channel.id, channel.team_id, channel.name, channel.channel_type
            ));
        }
        for user in state.users.values() {
            lines.push(format!("user {} {} {}", user.id, user.username, user.email));
        }
        for post in state.posts.values() {
            lines.push(format!(
                "post {} {} {} {} {:?} root={}",
                post.id, post.channel_id, post.create_at, post.message, post.file_ids, post.root_id
            ));
        }
        for file in state.files.values() {
            lines.push(format!(
                "file {} {} {} post={}",
                file.id, file.name, file.size, file.post_id
            ));
        }
        for reaction in &state.reactions {
            lines.push(format!(
                "reaction {} {} {}",
                reaction.post_id, reaction.user_id, reaction.emoji_name
            ));
        }
        for key in state.preferences.keys() {
            lines.push(format!("preference {:?}", key));
        }
        for key in state.thread_memberships.keys() {
            lines.push(format!("thread_member {:?}", key));
        }
        lines.sort();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

impl Store for MemoryStore {
    fn lock_to_primary(&self) {
        self.primary_locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock_from_primary(&self) {
        self.primary_locks.fetch_sub(1, Ordering::SeqCst);
    }

    fn role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    fn save_role(&self, mut role: RoleRecord) -> Result<RoleRecord, StoreError> {
        if role.id.is_empty() {
            role.id = new_id();
        }
        self.state.write().roles.insert(role.id.clone(), role.clone());
        Ok(role)
    }

    fn scheme_by_name(&self, name: &str) -> Result<Option<SchemeRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .schemes
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    fn save_scheme(&self, mut scheme: SchemeRecord) -> Result<SchemeRecord, StoreError> {
        if scheme.id.is_empty() {
            scheme.id = new_id();
        }
        self.state
            .write()
            .schemes
            .insert(scheme.id.clone(), scheme.clone());
        Ok(scheme)
    }

    fn team_by_name(&self, name: &str) -> Result<Option<TeamRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .teams
            .values()
            .find(|t| t.name == name)
            .cloned())
    }

    fn teams_by_names(&self, names: &[String]) -> Result<Vec<TeamRecord>, StoreError> {
        let state = self.state.read();
        Ok(state
            .teams
            .values()
            .filter(|t| names.contains(&t.name))
            .cloned()
            .collect())
    }

    fn save_team(&self, mut team: TeamRecord) -> Result<TeamRecord, StoreError> {
        if team.id.is_empty() {
            team.id = new_id();
        }
        self.state.write().teams.insert(team.id.clone(), team.clone());
        Ok(team)
    }

    fn channel_by_name(
        &self,
        team_id: &str,
        name: &str,
    ) -> Result<Option<ChannelRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .channels
            .values()
            .find(|c| c.team_id == team_id && c.name == name)
            .cloned())
    }

    fn save_channel(&self, mut channel: ChannelRecord) -> Result<ChannelRecord, StoreError> {
        if channel.id.is_empty() {
            channel.id = new_id();
        }
        self.state
            .write()
            .channels
            .insert(channel.id.clone(), channel.clone());
        Ok(channel)
    }

    fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    fn users_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserRecord>, StoreError> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter(|u| usernames.contains(&u.username))
            .cloned()
            .collect())
    }

    fn save_user(&self, mut user: UserRecord) -> Result<UserRecord, StoreError> {
        if user.id.is_empty() {
            user.id = new_id();
        }
        self.state.write().users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn save_bot(&self, bot: BotRecord) -> Result<BotRecord, StoreError> {
        if bot.user_id.is_empty() {
            return Err(StoreError::Backend("bot has no backing user row".into()));
        }
        self.state
            .write()
            .bots
            .insert(bot.user_id.clone(), bot.clone());
        Ok(bot)
    }

    fn save_team_member(
        &self,
        team_id: &str,
        user_id: &str,
        roles: &str,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .team_members
            .insert((team_id.to_string(), user_id.to_string()), roles.to_string());
        Ok(())
    }

    fn save_channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
        roles: &str,
    ) -> Result<(), StoreError> {
        self.state.write().channel_members.insert(
            (channel_id.to_string(), user_id.to_string()),
            roles.to_string(),
        );
        Ok(())
    }

    fn direct_channel(&self, member_ids: &[String]) -> Result<Option<ChannelRecord>, StoreError> {
        let mut key: Vec<String> = member_ids.to_vec();
        key.sort();
        let state = self.state.read();
        Ok(state
            .direct_channels
            .get(&key)
            .and_then(|id| state.channels.get(id))
            .cloned())
    }

    fn create_direct_channel(
        &self,
        member_ids: &[String],
        header: &str,
    ) -> Result<ChannelRecord, StoreError> {
        let mut key: Vec<String> = member_ids.to_vec();
        key.sort();
        let mut state = self.state.write();
        if let Some(existing) = state.direct_channels.get(&key) {
            let existing = existing.clone();
            return state
                .channels
                .get(&existing)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("direct channel {existing}")));
        }
        let channel = ChannelRecord {
            id: new_id(),
            team_id: String::new(),
            name: key.join("__"),
            display_name: String::new(),
            channel_type: if key.len() == 2 { "D".into() } else { "G".into() },
            header: header.to_string(),
            purpose: String::new(),
        };
        state.direct_channels.insert(key, channel.id.clone());
        for user_id in member_ids {
            state
                .channel_members
                .insert((channel.id.clone(), user_id.clone()), String::new());
        }
        state.channels.insert(channel.id.clone(), channel.clone());
        Ok(channel)
    }

    fn posts_created_at(
        &self,
        channel_id: &str,
        create_at: i64,
    ) -> Result<Vec<PostRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .posts
            .values()
            .filter(|p| p.channel_id == channel_id && p.create_at == create_at)
            .cloned()
            .collect())
    }

    fn save_posts(&self, posts: &[PostRecord]) -> Result<Vec<PostRecord>, BulkSaveError> {
        let mut state = self.state.write();
        // Validate every row before touching the table so the call stays
        // atomic: either all rows land or none do.
        for (row, post) in posts.iter().enumerate() {
            if post.is_saved() {
                return Err(BulkSaveError {
                    row: Some(row),
                    source: StoreError::Conflict("post already has an id".into()),
                });
            }
            if post.channel_id.is_empty() || post.user_id.is_empty() {
                return Err(BulkSaveError {
                    row: Some(row),
                    source: StoreError::Backend("post is missing channel or user".into()),
                });
            }
        }
        let mut saved = Vec::with_capacity(posts.len());
        for post in posts {
            let mut post = post.clone();
            post.id = new_id();
            state.posts.insert(post.id.clone(), post.clone());
            saved.push(post);
        }
        Ok(saved)
    }

    fn overwrite_posts(&self, posts: &[PostRecord]) -> Result<Vec<PostRecord>, BulkSaveError> {
        let mut state = self.state.write();
        for (row, post) in posts.iter().enumerate() {
            if !state.posts.contains_key(&post.id) {
                return Err(BulkSaveError {
                    row: Some(row),
                    source: StoreError::NotFound(format!("post {}", post.id)),
                });
            }
        }
        for post in posts {
            state.posts.insert(post.id.clone(), post.clone());
        }
        Ok(posts.to_vec())
    }

    fn save_reaction(&self, reaction: ReactionRecord) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.reactions.retain(|r| {
            !(r.post_id == reaction.post_id
                && r.user_id == reaction.user_id
                && r.emoji_name == reaction.emoji_name)
        });
        state.reactions.push(reaction);
        Ok(())
    }

    fn save_preferences(&self, preferences: &[PreferenceRecord]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for preference in preferences {
            state.preferences.insert(
                (
                    preference.user_id.clone(),
                    preference.category.clone(),
                    preference.name.clone(),
                ),
                preference.clone(),
            );
        }
        Ok(())
    }

    fn save_thread_memberships(
        &self,
        memberships: &[ThreadMembershipRecord],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for membership in memberships {
            state.thread_memberships.insert(
                (membership.post_id.clone(), membership.user_id.clone()),
                membership.clone(),
            );
        }
        Ok(())
    }

    fn files_for_post(&self, post_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .files
            .values()
            .filter(|f| f.post_id == post_id)
            .cloned()
            .collect())
    }

    fn save_file(&self, mut file: FileRecord) -> Result<FileRecord, StoreError> {
        if file.id.is_empty() {
            file.id = new_id();
        }
        self.state.write().files.insert(file.id.clone(), file.clone());
        Ok(file)
    }

    fn delete_file(&self, file_id: &str) -> Result<(), StoreError> {
        self.state.write().files.remove(file_id);
        Ok(())
    }

    fn attach_file_to_post(&self, file_id: &str, post_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let file = state
            .files
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(format!("file {file_id}")))?;
        file.post_id = post_id.to_string();
        Ok(())
    }

    fn emoji_by_name(&self, name: &str) -> Result<Option<EmojiRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .emoji
            .values()
            .find(|e| e.name == name)
            .cloned())
    }

    fn save_emoji(&self, mut emoji: EmojiRecord) -> Result<EmojiRecord, StoreError> {
        if emoji.id.is_empty() {
            emoji.id = new_id();
        }
        self.state.write().emoji.insert(emoji.id.clone(), emoji.clone());
        Ok(emoji)
    }
}

/// In-memory blob backend.
#[derive(Default)]
pub struct MemoryFileStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(path).cloned()
    }
}

impl FileStore for MemoryFileStore {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        let blobs = self.blobs.read();
        let data = blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {path}")))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn store(&self, path: &str, data: &mut dyn Read) -> Result<u64, StoreError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let len = buf.len() as u64;
        self.blobs.write().insert(path.to_string(), buf);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_posts_assigns_ids_and_is_atomic() {
        let store = MemoryStore::new();
        let good = PostRecord {
            channel_id: "c1".into(),
            user_id: "u1".into(),
            message: "hi".into(),
            create_at: 1,
            ..Default::default()
        };
        let bad = PostRecord {
            message: "no channel".into(),
            ..Default::default()
        };

        let err = store.save_posts(&[good.clone(), bad]).unwrap_err();
        assert_eq!(err.row, Some(1));
        assert_eq!(store.post_count(), 0);

        let saved = store.save_posts(&[good]).unwrap();
        assert!(saved[0].is_saved());
        assert_eq!(store.post_count(), 1);
    }

    #[test]
    fn direct_channel_is_keyed_by_member_set() {
        let store = MemoryStore::new();
        let members = vec!["u2".to_string(), "u1".to_string()];
        let created = store.create_direct_channel(&members, "").unwrap();
        assert_eq!(created.channel_type, "D");

        let reversed = vec!["u1".to_string(), "u2".to_string()];
        let found = store.direct_channel(&reversed).unwrap().unwrap();
        assert_eq!(found.id, created.id);

        // Creating again returns the same channel.
        let again = store.create_direct_channel(&members, "").unwrap();
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn primary_routing_lock_is_counted() {
        let store = MemoryStore::new();
        assert!(!store.routed_to_primary());
        store.lock_to_primary();
        assert!(store.routed_to_primary());
        store.unlock_from_primary();
        assert!(!store.routed_to_primary());
    }

    #[test]
    fn file_store_round_trips_blobs() {
        let files = MemoryFileStore::new();
        let mut data = std::io::Cursor::new(b"content".to_vec());
        assert_eq!(files.store("a/b.txt", &mut data).unwrap(), 7);
        let mut out = Vec::new();
        files.open("a/b.txt").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"content");
    }
}
