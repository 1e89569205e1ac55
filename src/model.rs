//! Wire format of a workspace export.
//!
//! An export is newline-delimited JSON. Every line is a self-describing
//! record: a `type` tag plus a payload stored under a field of the same name,
//! e.g. `{"type":"post","post":{...}}`. The first line must be the version
//! record `{"type":"version","version":1}`.
//!
//! Payload fields that reference binary content (post attachments, profile
//! images, emoji images) carry a path relative to the caller-supplied base
//! path; the attachment resolver rewrites them into an [`AttachmentSource`]
//! before the line is dispatched to a worker.

use crate::archive::AttachmentSource;
use serde::{Deserialize, Deserializer};
use std::fmt;

/// The record tag carried by every import line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Version,
    Role,
    Scheme,
    Team,
    Channel,
    User,
    Bot,
    DirectChannel,
    DirectPost,
    Post,
    Emoji,
}

impl RecordKind {
    /// Post and direct-post lines are buffered and imported in batches.
    pub fn is_batched(self) -> bool {
        matches!(self, RecordKind::Post | RecordKind::DirectPost)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Version => "version",
            RecordKind::Role => "role",
            RecordKind::Scheme => "scheme",
            RecordKind::Team => "team",
            RecordKind::Channel => "channel",
            RecordKind::User => "user",
            RecordKind::Bot => "bot",
            RecordKind::DirectChannel => "direct_channel",
            RecordKind::DirectPost => "direct_post",
            RecordKind::Post => "post",
            RecordKind::Emoji => "emoji",
        };
        f.write_str(name)
    }
}

/// One decoded import line. The payload is optional so that a line whose tag
/// is present but whose payload is missing can be reported as a record-shape
/// error rather than a decode error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportLine {
    Version {
        version: u64,
    },
    Role {
        role: Option<RoleData>,
    },
    Scheme {
        scheme: Option<SchemeData>,
    },
    Team {
        team: Option<TeamData>,
    },
    Channel {
        channel: Option<ChannelData>,
    },
    User {
        user: Option<UserData>,
    },
    Bot {
        bot: Option<BotData>,
    },
    DirectChannel {
        direct_channel: Option<DirectChannelData>,
    },
    DirectPost {
        direct_post: Option<DirectPostData>,
    },
    Post {
        post: Option<PostData>,
    },
    Emoji {
        emoji: Option<EmojiData>,
    },
}

impl ImportLine {
    pub fn kind(&self) -> RecordKind {
        match self {
            ImportLine::Version { .. } => RecordKind::Version,
            ImportLine::Role { .. } => RecordKind::Role,
            ImportLine::Scheme { .. } => RecordKind::Scheme,
            ImportLine::Team { .. } => RecordKind::Team,
            ImportLine::Channel { .. } => RecordKind::Channel,
            ImportLine::User { .. } => RecordKind::User,
            ImportLine::Bot { .. } => RecordKind::Bot,
            ImportLine::DirectChannel { .. } => RecordKind::DirectChannel,
            ImportLine::DirectPost { .. } => RecordKind::DirectPost,
            ImportLine::Post { .. } => RecordKind::Post,
            ImportLine::Emoji { .. } => RecordKind::Emoji,
        }
    }
}

/// An import line paired with its 1-based source line number.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub line_number: u64,
    pub line: ImportLine,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleData {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemeData {
    pub name: String,
    pub display_name: String,
    pub scope: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamData {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub team_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelData {
    pub team: String,
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserData {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub roles: Option<String>,
    #[serde(default, deserialize_with = "optional_image")]
    pub profile_image: Option<AttachmentData>,
    #[serde(default)]
    pub teams: Vec<UserTeamData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTeamData {
    pub name: String,
    #[serde(default)]
    pub roles: Option<String>,
    #[serde(default)]
    pub channels: Vec<UserChannelData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserChannelData {
    pub name: String,
    #[serde(default)]
    pub roles: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotData {
    pub username: String,
    pub owner: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "optional_image")]
    pub profile_image: Option<AttachmentData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectChannelData {
    pub members: Vec<String>,
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectPostData {
    pub channel_members: Vec<String>,
    pub user: String,
    pub message: String,
    pub create_at: i64,
    #[serde(default)]
    pub edit_at: Option<i64>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub props: Option<serde_json::Value>,
    #[serde(default)]
    pub flagged_by: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionData>,
    #[serde(default)]
    pub replies: Vec<ReplyData>,
    #[serde(default)]
    pub attachments: Vec<AttachmentData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostData {
    pub team: String,
    pub channel: String,
    pub user: String,
    pub message: String,
    pub create_at: i64,
    #[serde(default)]
    pub edit_at: Option<i64>,
    #[serde(default, rename = "type")]
    pub post_type: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub props: Option<serde_json::Value>,
    #[serde(default)]
    pub flagged_by: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionData>,
    #[serde(default)]
    pub replies: Vec<ReplyData>,
    #[serde(default)]
    pub attachments: Vec<AttachmentData>,
    #[serde(default)]
    pub thread_followers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyData {
    pub user: String,
    pub message: String,
    pub create_at: i64,
    #[serde(default)]
    pub edit_at: Option<i64>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub flagged_by: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionData>,
    #[serde(default)]
    pub attachments: Vec<AttachmentData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionData {
    pub user: String,
    pub emoji_name: String,
    pub create_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmojiData {
    pub name: String,
    #[serde(deserialize_with = "required_image")]
    pub image: AttachmentData,
}

/// A reference to attachment bytes: the relative path from the export plus
/// the source the resolver bound it to.
#[derive(Debug, Clone)]
pub struct AttachmentData {
    pub path: String,
    pub source: Option<AttachmentSource>,
}

impl AttachmentData {
    pub fn new(path: String) -> Self {
        Self { path, source: None }
    }
}

impl<'de> Deserialize<'de> for AttachmentData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            path: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(AttachmentData::new(raw.path))
    }
}

// Profile and emoji images are stored as bare path strings in the export.
fn optional_image<'de, D>(deserializer: D) -> Result<Option<AttachmentData>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(AttachmentData::new))
}

fn required_image<'de, D>(deserializer: D) -> Result<AttachmentData, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(AttachmentData::new(String::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_version_line() {
        let line: ImportLine = serde_json::from_str(r#"{"type":"version","version":1}"#).unwrap();
        assert!(matches!(line, ImportLine::Version { version: 1 }));
    }

    #[test]
    fn decodes_post_line_with_payload() {
        let json = r#"{"type":"post","post":{"team":"eng","channel":"general","user":"alice",
            "message":"hello","create_at":1000,
            "attachments":[{"path":"files/a.txt"}],
            "reactions":[{"user":"bob","emoji_name":"+1","create_at":1001}]}}"#;
        let line: ImportLine = serde_json::from_str(json).unwrap();
        let ImportLine::Post { post: Some(post) } = line else {
            panic!("expected a post line");
        };
        assert_eq!(post.team, "eng");
        assert_eq!(post.attachments[0].path, "files/a.txt");
        assert!(post.attachments[0].source.is_none());
        assert_eq!(post.reactions[0].emoji_name, "+1");
    }

    #[test]
    fn missing_payload_decodes_as_none() {
        let line: ImportLine = serde_json::from_str(r#"{"type":"team"}"#).unwrap();
        assert!(matches!(line, ImportLine::Team { team: None }));
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        assert!(serde_json::from_str::<ImportLine>(r#"{"type":"widget"}"#).is_err());
    }

    #[test]
    fn profile_image_decodes_from_bare_path() {
        let json = r#"{"type":"user","user":{"username":"alice","email":"a@example.com",
            "profile_image":"images/alice.png"}}"#;
        let line: ImportLine = serde_json::from_str(json).unwrap();
        let ImportLine::User { user: Some(user) } = line else {
            panic!("expected a user line");
        };
        assert_eq!(user.profile_image.unwrap().path, "images/alice.png");
    }
}
