//! Batched post and direct-post import.
//!
//! Workers buffer post and direct-post lines and flush them here in batches.
//! A batch is imported in phases: bulk-resolve every referenced name, decide
//! create-vs-overwrite per item against existing rows, import attachments,
//! persist the create and overwrite lists in one bulk call each, then run the
//! per-item follow-ups (flags, reactions, replies, thread followers).
//!
//! Reference resolution failures condemn the whole batch and usually cannot
//! be pinned to a line, so they report line 0. A bulk-save failure is mapped
//! back to a line through the (create_at, channel, message) dedup key when
//! the store identifies the offending row; key collisions make this
//! best-effort diagnostics, not a guarantee.

use crate::archive::ImportArchive;
use crate::attachments::import_attachment;
use crate::error::{ImportError, LineError};
use crate::model::{DirectPostData, PostData, ReactionData, RecordKind, ReplyData};
use crate::store::{
    BulkSaveError, ChannelRecord, FileStore, PostRecord, PreferenceRecord, ReactionRecord, Store,
    StoreError, ThreadMembershipRecord, UserRecord, PREFERENCE_FLAGGED_POST,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Blob path segment used for files attached to direct and group messages,
/// which belong to no team.
const DIRECT_TEAM_SEGMENT: &str = "noteam";

/// Shared state handed to every worker for the duration of one run.
pub(crate) struct ImportContext {
    pub store: Arc<dyn Store>,
    pub files: Arc<dyn FileStore>,
    pub archive: Option<Arc<ImportArchive>>,
    pub dry_run: bool,
    pub max_profile_image_bytes: u64,
}

/// A batch item with its references resolved to row ids. Both post and
/// direct-post lines normalize to this before the shared persistence path.
struct ResolvedPost {
    line: u64,
    /// Team segment for attachment blob paths.
    blob_team: String,
    channel_id: String,
    user_id: String,
    message: String,
    create_at: i64,
    edit_at: i64,
    post_type: String,
    is_pinned: bool,
    props: Option<serde_json::Value>,
    attachments: Vec<crate::model::AttachmentData>,
    flagged_by: Vec<String>,
    reactions: Vec<ReactionData>,
    replies: Vec<ReplyData>,
    thread_followers: Vec<String>,
}

type PostKey = (i64, String, String);

fn post_key(record: &PostRecord) -> PostKey {
    (
        record.create_at,
        record.channel_id.clone(),
        record.message.clone(),
    )
}

fn store_err(line: u64, err: StoreError) -> LineError {
    LineError::new(line, err.into())
}

pub(crate) fn import_post_batch(
    ctx: &ImportContext,
    items: &[(u64, PostData)],
) -> Result<(), LineError> {
    for (line, post) in items {
        if post.create_at <= 0 {
            return Err(LineError::new(
                *line,
                ImportError::validation(RecordKind::Post, "create_at must be a positive timestamp"),
            ));
        }
    }
    if ctx.dry_run {
        return Ok(());
    }

    // Bulk name resolution. Authors, reply authors and flagging users must
    // all resolve or the batch fails; reaction users and thread followers
    // are checked at their own step.
    let mut team_names = BTreeSet::new();
    let mut usernames = BTreeSet::new();
    let mut required_users = BTreeSet::new();
    for (_, post) in items {
        team_names.insert(post.team.clone());
        collect_usernames(
            &post.user,
            &post.flagged_by,
            &post.reactions,
            &post.replies,
            &mut usernames,
            &mut required_users,
        );
        for follower in &post.thread_followers {
            usernames.insert(follower.clone());
        }
    }

    let teams = resolve_teams(ctx.store.as_ref(), &team_names)?;
    let users = resolve_users(ctx.store.as_ref(), &usernames, &required_users)?;

    // Channels are looked up per (team, name) pair and cached for the batch.
    let mut channels: HashMap<(String, String), ChannelRecord> = HashMap::new();
    let mut resolved = Vec::with_capacity(items.len());
    for (line, post) in items {
        let team = &teams[&post.team];
        let channel_key = (team.id.clone(), post.channel.clone());
        if !channels.contains_key(&channel_key) {
            let channel = ctx
                .store
                .channel_by_name(&team.id, &post.channel)
                .map_err(|e| LineError::unattributed(e.into()))?
                .ok_or_else(|| {
                    LineError::unattributed(ImportError::ChannelNotFound(post.channel.clone()))
                })?;
            channels.insert(channel_key.clone(), channel);
        }
        let channel = &channels[&channel_key];
        resolved.push(ResolvedPost {
            line: *line,
            blob_team: team.id.clone(),
            channel_id: channel.id.clone(),
            user_id: users[&post.user].id.clone(),
            message: post.message.clone(),
            create_at: post.create_at,
            edit_at: post.edit_at.unwrap_or(0),
            post_type: post.post_type.clone().unwrap_or_default(),
            is_pinned: post.is_pinned.unwrap_or(false),
            props: post.props.clone(),
            attachments: post.attachments.clone(),
            flagged_by: post.flagged_by.clone(),
            reactions: post.reactions.clone(),
            replies: post.replies.clone(),
            thread_followers: post.thread_followers.clone(),
        });
    }

    persist_batch(ctx, &users, resolved)
}

pub(crate) fn import_direct_post_batch(
    ctx: &ImportContext,
    items: &[(u64, DirectPostData)],
) -> Result<(), LineError> {
    for (line, post) in items {
        if post.create_at <= 0 {
            return Err(LineError::new(
                *line,
                ImportError::validation(
                    RecordKind::DirectPost,
                    "create_at must be a positive timestamp",
                ),
            ));
        }
        if post.channel_members.len() < 2 || post.channel_members.len() > 8 {
            return Err(LineError::new(
                *line,
                ImportError::validation(
                    RecordKind::DirectPost,
                    "channel_members must name between 2 and 8 users",
                ),
            ));
        }
    }
    if ctx.dry_run {
        return Ok(());
    }

    let mut usernames = BTreeSet::new();
    let mut required_users = BTreeSet::new();
    for (_, post) in items {
        collect_usernames(
            &post.user,
            &post.flagged_by,
            &post.reactions,
            &post.replies,
            &mut usernames,
            &mut required_users,
        );
        for member in &post.channel_members {
            usernames.insert(member.clone());
            required_users.insert(member.clone());
        }
    }
    let users = resolve_users(ctx.store.as_ref(), &usernames, &required_users)?;

    // One direct or group channel per distinct member set, created on first
    // reference.
    let mut channels: HashMap<Vec<String>, ChannelRecord> = HashMap::new();
    let mut resolved = Vec::with_capacity(items.len());
    for (line, post) in items {
        let mut member_set: Vec<String> = post.channel_members.clone();
        member_set.sort();
        member_set.dedup();
        if !channels.contains_key(&member_set) {
            let member_ids: Vec<String> = member_set
                .iter()
                .map(|name| users[name].id.clone())
                .collect();
            let channel = match ctx
                .store
                .direct_channel(&member_ids)
                .map_err(|e| LineError::unattributed(e.into()))?
            {
                Some(channel) => channel,
                None => ctx
                    .store
                    .create_direct_channel(&member_ids, "")
                    .map_err(|e| LineError::unattributed(e.into()))?,
            };
            channels.insert(member_set.clone(), channel);
        }
        let channel = &channels[&member_set];
        resolved.push(ResolvedPost {
            line: *line,
            blob_team: DIRECT_TEAM_SEGMENT.to_string(),
            channel_id: channel.id.clone(),
            user_id: users[&post.user].id.clone(),
            message: post.message.clone(),
            create_at: post.create_at,
            edit_at: post.edit_at.unwrap_or(0),
            post_type: String::new(),
            is_pinned: post.is_pinned.unwrap_or(false),
            props: post.props.clone(),
            attachments: post.attachments.clone(),
            flagged_by: post.flagged_by.clone(),
            reactions: post.reactions.clone(),
            replies: post.replies.clone(),
            thread_followers: Vec::new(),
        });
    }

    persist_batch(ctx, &users, resolved)
}

fn collect_usernames(
    author: &str,
    flagged_by: &[String],
    reactions: &[ReactionData],
    replies: &[ReplyData],
    usernames: &mut BTreeSet<String>,
    required: &mut BTreeSet<String>,
) {
    usernames.insert(author.to_string());
    required.insert(author.to_string());
    for username in flagged_by {
        usernames.insert(username.clone());
        required.insert(username.clone());
    }
    for reaction in reactions {
        usernames.insert(reaction.user.clone());
    }
    for reply in replies {
        usernames.insert(reply.user.clone());
        required.insert(reply.user.clone());
        for username in &reply.flagged_by {
            usernames.insert(username.clone());
            required.insert(username.clone());
        }
        for reaction in &reply.reactions {
            usernames.insert(reaction.user.clone());
        }
    }
}

fn resolve_teams(
    store: &dyn Store,
    names: &BTreeSet<String>,
) -> Result<HashMap<String, crate::store::TeamRecord>, LineError> {
    let name_list: Vec<String> = names.iter().cloned().collect();
    let rows = store
        .teams_by_names(&name_list)
        .map_err(|e| LineError::unattributed(e.into()))?;
    let map: HashMap<String, _> = rows.into_iter().map(|t| (t.name.clone(), t)).collect();
    for name in names {
        if !map.contains_key(name) {
            return Err(LineError::unattributed(ImportError::TeamNotFound(
                name.clone(),
            )));
        }
    }
    Ok(map)
}

fn resolve_users(
    store: &dyn Store,
    usernames: &BTreeSet<String>,
    required: &BTreeSet<String>,
) -> Result<HashMap<String, UserRecord>, LineError> {
    let name_list: Vec<String> = usernames.iter().cloned().collect();
    let rows = store
        .users_by_usernames(&name_list)
        .map_err(|e| LineError::unattributed(e.into()))?;
    let map: HashMap<String, _> = rows.into_iter().map(|u| (u.username.clone(), u)).collect();
    for name in required {
        if !map.contains_key(name) {
            return Err(LineError::unattributed(ImportError::UserNotFound(
                name.clone(),
            )));
        }
    }
    Ok(map)
}

/// Find-or-create, attachments, bulk persistence and per-item follow-ups for
/// a batch of resolved posts, in file order.
fn persist_batch(
    ctx: &ImportContext,
    users: &HashMap<String, UserRecord>,
    posts: Vec<ResolvedPost>,
) -> Result<(), LineError> {
    struct Pending {
        resolved: ResolvedPost,
        record: PostRecord,
        /// File ids uploaded for this import pass; reused ids stay attached.
        new_file_ids: Vec<String>,
    }

    let mut pending = Vec::with_capacity(posts.len());
    let mut key_lines: HashMap<PostKey, u64> = HashMap::new();

    for resolved in posts {
        let line = resolved.line;
        let existing = find_existing(
            ctx.store.as_ref(),
            &resolved.channel_id,
            resolved.create_at,
            &resolved.message,
        )
        .map_err(|e| store_err(line, e))?;

        let mut record = match existing {
            Some(mut record) => {
                // Only the row id is kept; everything else comes from the
                // import data, so a re-import can re-attribute the author.
                record.user_id = resolved.user_id.clone();
                record.edit_at = resolved.edit_at;
                record.post_type = resolved.post_type.clone();
                record.is_pinned = resolved.is_pinned;
                record.props = resolved.props.clone();
                record
            }
            None => PostRecord {
                channel_id: resolved.channel_id.clone(),
                user_id: resolved.user_id.clone(),
                message: resolved.message.clone(),
                create_at: resolved.create_at,
                edit_at: resolved.edit_at,
                post_type: resolved.post_type.clone(),
                is_pinned: resolved.is_pinned,
                props: resolved.props.clone(),
                ..Default::default()
            },
        };

        let (file_ids, new_file_ids) =
            import_post_attachments(ctx, &resolved.attachments, &record, &resolved.blob_team)
                .map_err(|e| store_err(line, e))?;
        record.file_ids = file_ids;
        key_lines.entry(post_key(&record)).or_insert(line);
        pending.push(Pending {
            resolved,
            record,
            new_file_ids,
        });
    }

    // Persist creates and overwrites, each atomically, then hand the
    // assigned ids back to the pending items in order.
    let creates: Vec<PostRecord> = pending
        .iter()
        .filter(|p| !p.record.is_saved())
        .map(|p| p.record.clone())
        .collect();
    let overwrites: Vec<PostRecord> = pending
        .iter()
        .filter(|p| p.record.is_saved())
        .map(|p| p.record.clone())
        .collect();
    let saved_creates = if creates.is_empty() {
        Vec::new()
    } else {
        ctx.store
            .save_posts(&creates)
            .map_err(|e| map_bulk_error(e, &creates, &key_lines))?
    };
    if !overwrites.is_empty() {
        ctx.store
            .overwrite_posts(&overwrites)
            .map_err(|e| map_bulk_error(e, &overwrites, &key_lines))?;
    }
    let mut assigned = saved_creates.into_iter();
    for item in &mut pending {
        if !item.record.is_saved() {
            // save_posts returns rows in input order.
            if let Some(saved) = assigned.next() {
                item.record = saved;
            }
        }
    }

    for item in &pending {
        let line = item.resolved.line;
        let record = &item.record;
        for file_id in &item.new_file_ids {
            ctx.store
                .attach_file_to_post(file_id, &record.id)
                .map_err(|e| store_err(line, e))?;
        }
        save_flags(ctx, users, &item.resolved.flagged_by, &record.id, line)?;
        import_reactions(ctx, users, &record.id, &item.resolved.reactions, line)?;
        import_replies(
            ctx,
            users,
            record,
            &item.resolved.replies,
            &item.resolved.blob_team,
            line,
        )?;
        import_thread_followers(ctx, users, record, &item.resolved.thread_followers, line)?;
    }

    Ok(())
}

fn find_existing(
    store: &dyn Store,
    channel_id: &str,
    create_at: i64,
    message: &str,
) -> Result<Option<PostRecord>, StoreError> {
    let candidates = store.posts_created_at(channel_id, create_at)?;
    Ok(candidates.into_iter().find(|p| p.message == message))
}

/// Import every attachment of one post, warn-and-skip on per-attachment
/// failures, and permanently delete previously attached files the post no
/// longer references. Returns (final file-id set, newly uploaded ids).
fn import_post_attachments(
    ctx: &ImportContext,
    attachments: &[crate::model::AttachmentData],
    record: &PostRecord,
    blob_team: &str,
) -> Result<(Vec<String>, Vec<String>), StoreError> {
    let mut file_ids = Vec::new();
    let mut new_file_ids = Vec::new();
    for attachment in attachments {
        match import_attachment(
            ctx.store.as_ref(),
            ctx.files.as_ref(),
            ctx.archive.as_deref(),
            attachment,
            record,
            blob_team,
        ) {
            Ok(file) => {
                if file.post_id.is_empty() || !record.is_saved() {
                    new_file_ids.push(file.id.clone());
                }
                file_ids.push(file.id);
            }
            Err(err) => {
                log::warn!("skipping attachment {}: {}", attachment.path, err);
            }
        }
    }
    if record.is_saved() {
        for old in ctx.store.files_for_post(&record.id)? {
            if !file_ids.contains(&old.id) {
                log::info!("permanently deleting de-referenced file {}", old.name);
                ctx.store.delete_file(&old.id)?;
            }
        }
    }
    Ok((file_ids, new_file_ids))
}

fn save_flags(
    ctx: &ImportContext,
    users: &HashMap<String, UserRecord>,
    flagged_by: &[String],
    post_id: &str,
    line: u64,
) -> Result<(), LineError> {
    if flagged_by.is_empty() {
        return Ok(());
    }
    let preferences: Vec<PreferenceRecord> = flagged_by
        .iter()
        .map(|username| PreferenceRecord {
            user_id: users[username].id.clone(),
            category: PREFERENCE_FLAGGED_POST.to_string(),
            name: post_id.to_string(),
            value: "true".to_string(),
        })
        .collect();
    ctx.store
        .save_preferences(&preferences)
        .map_err(|e| store_err(line, e))
}

/// A reaction from a user the import has never seen fails just that
/// reaction, not the post.
fn import_reactions(
    ctx: &ImportContext,
    users: &HashMap<String, UserRecord>,
    post_id: &str,
    reactions: &[ReactionData],
    line: u64,
) -> Result<(), LineError> {
    for reaction in reactions {
        let Some(user) = users.get(&reaction.user) else {
            log::warn!(
                "skipping reaction {} on line {}: unknown user {}",
                reaction.emoji_name,
                line,
                reaction.user
            );
            continue;
        };
        ctx.store
            .save_reaction(ReactionRecord {
                user_id: user.id.clone(),
                post_id: post_id.to_string(),
                emoji_name: reaction.emoji_name.clone(),
                create_at: reaction.create_at,
            })
            .map_err(|e| store_err(line, e))?;
    }
    Ok(())
}

fn import_replies(
    ctx: &ImportContext,
    users: &HashMap<String, UserRecord>,
    parent: &PostRecord,
    replies: &[ReplyData],
    blob_team: &str,
    line: u64,
) -> Result<(), LineError> {
    if replies.is_empty() {
        return Ok(());
    }

    struct PendingReply<'a> {
        reply: &'a ReplyData,
        record: PostRecord,
        new_file_ids: Vec<String>,
    }

    let mut pending = Vec::with_capacity(replies.len());
    for reply in replies {
        let mut create_at = reply.create_at;
        if create_at < parent.create_at {
            log::warn!(
                "reply create_at {} precedes parent create_at {}, clamping to parent",
                create_at,
                parent.create_at
            );
            create_at = parent.create_at;
        }
        let existing = find_existing(
            ctx.store.as_ref(),
            &parent.channel_id,
            create_at,
            &reply.message,
        )
        .map_err(|e| store_err(line, e))?;
        let mut record = match existing {
            Some(mut record) => {
                record.user_id = users[&reply.user].id.clone();
                record.root_id = parent.id.clone();
                record.edit_at = reply.edit_at.unwrap_or(0);
                record.is_pinned = reply.is_pinned.unwrap_or(false);
                record
            }
            None => PostRecord {
                channel_id: parent.channel_id.clone(),
                user_id: users[&reply.user].id.clone(),
                root_id: parent.id.clone(),
                message: reply.message.clone(),
                create_at,
                edit_at: reply.edit_at.unwrap_or(0),
                is_pinned: reply.is_pinned.unwrap_or(false),
                ..Default::default()
            },
        };
        let (file_ids, new_file_ids) =
            import_post_attachments(ctx, &reply.attachments, &record, blob_team)
                .map_err(|e| store_err(line, e))?;
        record.file_ids = file_ids;
        pending.push(PendingReply {
            reply,
            record,
            new_file_ids,
        });
    }

    let creates: Vec<PostRecord> = pending
        .iter()
        .filter(|p| !p.record.is_saved())
        .map(|p| p.record.clone())
        .collect();
    let overwrites: Vec<PostRecord> = pending
        .iter()
        .filter(|p| p.record.is_saved())
        .map(|p| p.record.clone())
        .collect();
    let saved_creates = if creates.is_empty() {
        Vec::new()
    } else {
        ctx.store
            .save_posts(&creates)
            .map_err(|e| store_err(line, e.source))?
    };
    if !overwrites.is_empty() {
        ctx.store
            .overwrite_posts(&overwrites)
            .map_err(|e| store_err(line, e.source))?;
    }
    let mut assigned = saved_creates.into_iter();
    for item in &mut pending {
        if !item.record.is_saved() {
            if let Some(saved) = assigned.next() {
                item.record = saved;
            }
        }
    }

    for item in &pending {
        for file_id in &item.new_file_ids {
            ctx.store
                .attach_file_to_post(file_id, &item.record.id)
                .map_err(|e| store_err(line, e))?;
        }
        save_flags(ctx, users, &item.reply.flagged_by, &item.record.id, line)?;
        import_reactions(ctx, users, &item.record.id, &item.reply.reactions, line)?;
    }
    Ok(())
}

/// An unknown follower username fails the whole item.
fn import_thread_followers(
    ctx: &ImportContext,
    users: &HashMap<String, UserRecord>,
    record: &PostRecord,
    followers: &[String],
    line: u64,
) -> Result<(), LineError> {
    if followers.is_empty() {
        return Ok(());
    }
    let mut memberships = Vec::with_capacity(followers.len());
    for username in followers {
        let user = users.get(username).ok_or_else(|| {
            LineError::new(line, ImportError::UserNotFound(username.clone()))
        })?;
        memberships.push(ThreadMembershipRecord {
            post_id: record.id.clone(),
            user_id: user.id.clone(),
        });
    }
    ctx.store
        .save_thread_memberships(&memberships)
        .map_err(|e| store_err(line, e))
}

fn map_bulk_error(
    err: BulkSaveError,
    submitted: &[PostRecord],
    key_lines: &HashMap<PostKey, u64>,
) -> LineError {
    let line = err
        .row
        .and_then(|row| submitted.get(row))
        .and_then(|record| key_lines.get(&post_key(record)))
        .copied()
        .unwrap_or(0);
    LineError::new(line, ImportError::Store(err.source))
}
