//! Segment workers.
//!
//! Each worker pulls items off its segment's shared bounded queue until the
//! driver closes it. Role, scheme, team, channel, user, bot, direct-channel
//! and emoji lines are imported one at a time with find-or-create semantics;
//! post and direct-post lines are buffered and flushed through the batch
//! importer once the buffer fills or the queue closes. A worker never
//! escalates a failure: it pushes one error on the shared channel and keeps
//! draining, leaving abort decisions to the driver.

use crate::attachments::{source_size, store_source};
use crate::bulk_import::{import_direct_post_batch, import_post_batch, ImportContext};
use crate::error::{ImportError, LineError};
use crate::model::{
    AttachmentData, BotData, ChannelData, DirectChannelData, DirectPostData, EmojiData, ImportLine,
    PostData, RecordKind, RoleData, SchemeData, TeamData, UserData, WorkItem,
};
use crate::store::{
    BotRecord, ChannelRecord, EmojiRecord, RoleRecord, SchemeRecord, TeamRecord, UserRecord,
};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;

/// Buffered post/direct-post lines are flushed once this many accumulate.
pub(crate) const BATCH_SIZE: usize = 1000;

/// Each worker logs its throughput after this many processed lines.
const PROGRESS_EVERY: u64 = 500;

/// Worker loop for one segment. Returns once the queue closes and all
/// buffered work has been flushed.
pub(crate) async fn run_worker(
    ctx: Arc<ImportContext>,
    queue: Arc<Mutex<Receiver<WorkItem>>>,
    errors: Sender<LineError>,
) {
    let mut posts: Vec<(u64, PostData)> = Vec::new();
    let mut direct_posts: Vec<(u64, DirectPostData)> = Vec::new();
    let mut processed: u64 = 0;

    loop {
        let item = { queue.lock().await.recv().await };
        let Some(item) = item else { break };
        let line = item.line_number;
        if let Err(err) = handle_item(&ctx, item, &mut posts, &mut direct_posts) {
            report(&errors, LineError::new(line, err));
        }
        processed += 1;
        if processed % PROGRESS_EVERY == 0 {
            log::info!("worker processed {processed} lines");
        }
        if posts.len() >= BATCH_SIZE {
            let batch = std::mem::take(&mut posts);
            if let Err(err) = import_post_batch(&ctx, &batch) {
                report(&errors, err);
            }
        }
        if direct_posts.len() >= BATCH_SIZE {
            let batch = std::mem::take(&mut direct_posts);
            if let Err(err) = import_direct_post_batch(&ctx, &batch) {
                report(&errors, err);
            }
        }
    }

    if !posts.is_empty() {
        if let Err(err) = import_post_batch(&ctx, &posts) {
            report(&errors, err);
        }
    }
    if !direct_posts.is_empty() {
        if let Err(err) = import_direct_post_batch(&ctx, &direct_posts) {
            report(&errors, err);
        }
    }
    if processed > 0 {
        log::debug!("worker finished after {processed} lines");
    }
}

/// The error channel is bounded and lossy: if it is full the driver is
/// already aborting on an earlier error, so further ones may be dropped.
fn report(errors: &Sender<LineError>, err: LineError) {
    if let Err(dropped) = errors.try_send(err) {
        log::debug!("error channel full, dropping {}", dropped.into_inner());
    }
}

fn handle_item(
    ctx: &ImportContext,
    item: WorkItem,
    posts: &mut Vec<(u64, PostData)>,
    direct_posts: &mut Vec<(u64, DirectPostData)>,
) -> Result<(), ImportError> {
    match item.line {
        ImportLine::Version { .. } => Err(ImportError::UnexpectedVersion),
        ImportLine::Role { role } => {
            import_role(ctx, required(role, RecordKind::Role)?)
        }
        ImportLine::Scheme { scheme } => {
            import_scheme(ctx, required(scheme, RecordKind::Scheme)?)
        }
        ImportLine::Team { team } => import_team(ctx, required(team, RecordKind::Team)?),
        ImportLine::Channel { channel } => {
            import_channel(ctx, required(channel, RecordKind::Channel)?)
        }
        ImportLine::User { user } => import_user(ctx, required(user, RecordKind::User)?),
        ImportLine::Bot { bot } => import_bot(ctx, required(bot, RecordKind::Bot)?),
        ImportLine::DirectChannel { direct_channel } => {
            import_direct_channel(ctx, required(direct_channel, RecordKind::DirectChannel)?)
        }
        ImportLine::Emoji { emoji } => import_emoji(ctx, required(emoji, RecordKind::Emoji)?),
        ImportLine::Post { post } => {
            let post = required(post, RecordKind::Post)?;
            posts.push((item.line_number, post));
            Ok(())
        }
        ImportLine::DirectPost { direct_post } => {
            let post = required(direct_post, RecordKind::DirectPost)?;
            direct_posts.push((item.line_number, post));
            Ok(())
        }
    }
}

fn required<T>(payload: Option<T>, kind: RecordKind) -> Result<T, ImportError> {
    payload.ok_or(ImportError::MissingPayload { kind })
}

fn import_role(ctx: &ImportContext, data: RoleData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let existing = ctx.store.role_by_name(&data.name)?;
    let record = RoleRecord {
        id: existing.map(|r| r.id).unwrap_or_default(),
        name: data.name,
        display_name: data.display_name,
        description: data.description.unwrap_or_default(),
        permissions: data.permissions,
    };
    ctx.store.save_role(record)?;
    Ok(())
}

fn import_scheme(ctx: &ImportContext, data: SchemeData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let existing = ctx.store.scheme_by_name(&data.name)?;
    let record = SchemeRecord {
        id: existing.map(|s| s.id).unwrap_or_default(),
        name: data.name,
        display_name: data.display_name,
        scope: data.scope,
        description: data.description.unwrap_or_default(),
    };
    ctx.store.save_scheme(record)?;
    Ok(())
}

fn import_team(ctx: &ImportContext, data: TeamData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let scheme_id = match &data.scheme {
        Some(name) => Some(
            ctx.store
                .scheme_by_name(name)?
                .ok_or_else(|| ImportError::SchemeNotFound(name.clone()))?
                .id,
        ),
        None => None,
    };
    let existing = ctx.store.team_by_name(&data.name)?;
    let record = TeamRecord {
        id: existing.map(|t| t.id).unwrap_or_default(),
        name: data.name,
        display_name: data.display_name,
        team_type: data.team_type,
        description: data.description.unwrap_or_default(),
        scheme_id,
    };
    ctx.store.save_team(record)?;
    Ok(())
}

fn import_channel(ctx: &ImportContext, data: ChannelData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let team = ctx
        .store
        .team_by_name(&data.team)?
        .ok_or_else(|| ImportError::TeamNotFound(data.team.clone()))?;
    let existing = ctx.store.channel_by_name(&team.id, &data.name)?;
    let record = ChannelRecord {
        id: existing.map(|c| c.id).unwrap_or_default(),
        team_id: team.id,
        name: data.name,
        display_name: data.display_name,
        channel_type: data.channel_type,
        header: data.header.unwrap_or_default(),
        purpose: data.purpose.unwrap_or_default(),
    };
    ctx.store.save_channel(record)?;
    Ok(())
}

fn import_user(ctx: &ImportContext, data: UserData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let existing = ctx.store.user_by_username(&data.username)?;
    let record = UserRecord {
        id: existing.map(|u| u.id).unwrap_or_default(),
        username: data.username,
        email: data.email,
        nickname: data.nickname.unwrap_or_default(),
        first_name: data.first_name.unwrap_or_default(),
        last_name: data.last_name.unwrap_or_default(),
        position: data.position.unwrap_or_default(),
        roles: data.roles.unwrap_or_default(),
        is_bot: false,
    };
    let saved = ctx.store.save_user(record)?;

    for team in &data.teams {
        let team_row = ctx
            .store
            .team_by_name(&team.name)?
            .ok_or_else(|| ImportError::TeamNotFound(team.name.clone()))?;
        ctx.store.save_team_member(
            &team_row.id,
            &saved.id,
            team.roles.as_deref().unwrap_or_default(),
        )?;
        for channel in &team.channels {
            let channel_row = ctx
                .store
                .channel_by_name(&team_row.id, &channel.name)?
                .ok_or_else(|| ImportError::ChannelNotFound(channel.name.clone()))?;
            ctx.store.save_channel_member(
                &channel_row.id,
                &saved.id,
                channel.roles.as_deref().unwrap_or_default(),
            )?;
        }
    }

    if let Some(image) = &data.profile_image {
        import_profile_image(ctx, image, &saved.id)?;
    }
    Ok(())
}

fn import_bot(ctx: &ImportContext, data: BotData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    let owner = ctx
        .store
        .user_by_username(&data.owner)?
        .ok_or_else(|| ImportError::UserNotFound(data.owner.clone()))?;
    let user = match ctx.store.user_by_username(&data.username)? {
        Some(user) => user,
        None => ctx.store.save_user(UserRecord {
            username: data.username.clone(),
            is_bot: true,
            ..Default::default()
        })?,
    };
    ctx.store.save_bot(BotRecord {
        user_id: user.id.clone(),
        username: data.username,
        display_name: data.display_name.unwrap_or_default(),
        description: data.description.unwrap_or_default(),
        owner_id: owner.id,
    })?;

    if let Some(image) = &data.profile_image {
        import_profile_image(ctx, image, &user.id)?;
    }
    Ok(())
}

/// An image above the configured size cap is a recoverable error: the user
/// row stays, the run continues without the image. An unreadable source only
/// skips the image.
fn import_profile_image(
    ctx: &ImportContext,
    image: &AttachmentData,
    user_id: &str,
) -> Result<(), ImportError> {
    let size = match source_size(image) {
        Ok(size) => size,
        Err(err) => {
            log::warn!("skipping profile image {}: {}", image.path, err);
            return Ok(());
        }
    };
    if size > ctx.max_profile_image_bytes {
        return Err(ImportError::ProfileImageTooLarge {
            path: image.path.clone(),
            size,
            max: ctx.max_profile_image_bytes,
        });
    }
    match store_source(
        ctx.files.as_ref(),
        ctx.archive.as_deref(),
        image,
        &format!("users/{user_id}/profile.png"),
    ) {
        Ok(_) => Ok(()),
        Err(err) => {
            log::warn!("skipping profile image {}: {}", image.path, err);
            Ok(())
        }
    }
}

fn import_direct_channel(ctx: &ImportContext, data: DirectChannelData) -> Result<(), ImportError> {
    if data.members.len() < 2 || data.members.len() > 8 {
        return Err(ImportError::DirectChannelMemberCount(data.members.len()));
    }
    if ctx.dry_run {
        return Ok(());
    }
    let mut member_names = data.members.clone();
    member_names.sort();
    member_names.dedup();
    let users = ctx.store.users_by_usernames(&member_names)?;
    if users.len() != member_names.len() {
        let found: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        let missing = member_names
            .iter()
            .find(|name| !found.contains(&name.as_str()))
            .cloned()
            .unwrap_or_default();
        return Err(ImportError::UserNotFound(missing));
    }
    let member_ids: Vec<String> = users.iter().map(|u| u.id.clone()).collect();
    let header = data.header.unwrap_or_default();
    match ctx.store.direct_channel(&member_ids)? {
        Some(mut channel) => {
            if !header.is_empty() && channel.header != header {
                channel.header = header;
                ctx.store.save_channel(channel)?;
            }
        }
        None => {
            ctx.store.create_direct_channel(&member_ids, &header)?;
        }
    }
    Ok(())
}

fn import_emoji(ctx: &ImportContext, data: EmojiData) -> Result<(), ImportError> {
    if ctx.dry_run {
        return Ok(());
    }
    if let Some(existing) = ctx.store.emoji_by_name(&data.name)? {
        log::debug!("emoji {} already exists, skipping", existing.name);
        return Ok(());
    }
    let saved = ctx.store.save_emoji(EmojiRecord {
        name: data.name,
        ..Default::default()
    })?;
    let image_path = format!("emoji/{}/image", saved.id);
    store_source(
        ctx.files.as_ref(),
        ctx.archive.as_deref(),
        &data.image,
        &image_path,
    )?;
    ctx.store.save_emoji(EmojiRecord {
        image_path,
        ..saved
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFileStore, MemoryStore};
    use crate::store::Store;

    fn ctx() -> (Arc<MemoryStore>, Arc<MemoryFileStore>, ImportContext) {
        let store = Arc::new(MemoryStore::new());
        let files = Arc::new(MemoryFileStore::new());
        let ctx = ImportContext {
            store: store.clone(),
            files: files.clone(),
            archive: None,
            dry_run: false,
            max_profile_image_bytes: 64,
        };
        (store, files, ctx)
    }

    fn team_data(name: &str) -> TeamData {
        serde_json::from_value(serde_json::json!({
            "name": name, "display_name": name, "type": "O",
        }))
        .unwrap()
    }

    #[test]
    fn team_import_is_find_or_create() {
        let (store, _, ctx) = ctx();
        import_team(&ctx, team_data("eng")).unwrap();
        let first = store.team_by_name("eng").unwrap().unwrap();

        let mut updated = team_data("eng");
        updated.display_name = "Engineering".into();
        import_team(&ctx, updated).unwrap();

        assert_eq!(store.team_count(), 1);
        let second = store.team_by_name("eng").unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.display_name, "Engineering");
    }

    #[test]
    fn team_with_unknown_scheme_fails() {
        let (_, _, ctx) = ctx();
        let mut data = team_data("eng");
        data.scheme = Some("ghost".into());
        let err = import_team(&ctx, data).unwrap_err();
        assert!(matches!(err, ImportError::SchemeNotFound(_)));
    }

    #[test]
    fn channel_with_unknown_team_fails() {
        let (_, _, ctx) = ctx();
        let data: ChannelData = serde_json::from_value(serde_json::json!({
            "team": "ghost", "name": "general", "display_name": "General", "type": "O",
        }))
        .unwrap();
        let err = import_channel(&ctx, data).unwrap_err();
        assert!(matches!(err, ImportError::TeamNotFound(_)));
    }

    #[test]
    fn user_import_applies_team_and_channel_memberships() {
        let (store, _, ctx) = ctx();
        import_team(&ctx, team_data("eng")).unwrap();
        import_channel(
            &ctx,
            serde_json::from_value(serde_json::json!({
                "team": "eng", "name": "general", "display_name": "General", "type": "O",
            }))
            .unwrap(),
        )
        .unwrap();
        let data: UserData = serde_json::from_value(serde_json::json!({
            "username": "alice",
            "email": "alice@example.com",
            "teams": [{"name": "eng", "channels": [{"name": "general"}]}],
        }))
        .unwrap();
        import_user(&ctx, data).unwrap();
        assert_eq!(store.user_count(), 1);
        assert!(store.user_by_username("alice").unwrap().is_some());
    }

    #[test]
    fn oversized_profile_image_is_a_recoverable_error() {
        let (_, _, ctx) = ctx();
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("avatar.png");
        std::fs::write(&image_path, vec![0u8; 128]).unwrap();
        let image = AttachmentData {
            path: "avatar.png".into(),
            source: Some(crate::archive::AttachmentSource::File(image_path)),
        };
        let err = import_profile_image(&ctx, &image, "u1").unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ImportError::ProfileImageTooLarge { .. }));
    }

    #[test]
    fn direct_channel_member_count_is_bounded() {
        let (_, _, ctx) = ctx();
        let one: DirectChannelData =
            serde_json::from_value(serde_json::json!({"members": ["alice"]})).unwrap();
        let err = import_direct_channel(&ctx, one).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ImportError::DirectChannelMemberCount(1)));

        let nine: DirectChannelData = serde_json::from_value(serde_json::json!({
            "members": ["u1","u2","u3","u4","u5","u6","u7","u8","u9"],
        }))
        .unwrap();
        let err = import_direct_channel(&ctx, nine).unwrap_err();
        assert!(matches!(err, ImportError::DirectChannelMemberCount(9)));
    }

    #[test]
    fn bot_import_creates_a_backing_user_row() {
        let (store, _, ctx) = ctx();
        import_user(
            &ctx,
            serde_json::from_value(serde_json::json!({
                "username": "alice", "email": "alice@example.com",
            }))
            .unwrap(),
        )
        .unwrap();
        let data: BotData = serde_json::from_value(serde_json::json!({
            "username": "deploybot", "owner": "alice", "display_name": "Deploy Bot",
        }))
        .unwrap();
        import_bot(&ctx, data).unwrap();
        let bot_user = store.user_by_username("deploybot").unwrap().unwrap();
        assert!(bot_user.is_bot);
    }

    #[test]
    fn emoji_import_stores_the_image_blob() {
        let (store, files, ctx) = ctx();
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("party.png");
        std::fs::write(&image_path, b"png bytes").unwrap();
        let data = EmojiData {
            name: "party".into(),
            image: AttachmentData {
                path: "party.png".into(),
                source: Some(crate::archive::AttachmentSource::File(image_path)),
            },
        };
        import_emoji(&ctx, data).unwrap();
        let emoji = store.emoji_by_name("party").unwrap().unwrap();
        assert!(!emoji.image_path.is_empty());
        assert_eq!(files.blob(&emoji.image_path).unwrap(), b"png bytes");
    }

    #[test]
    fn dry_run_skips_store_work_for_single_line_types() {
        let (store, _, mut base) = ctx();
        base.dry_run = true;
        import_team(&base, team_data("eng")).unwrap();
        assert_eq!(store.team_count(), 0);
    }
}
