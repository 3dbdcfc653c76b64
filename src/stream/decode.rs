//! Stream record decoding.
//!
//! A stream record carries one post plus an `includes` bundle with the users,
//! media and polls it references by key. Conversion resolves those keys into
//! a self-contained [`Event`]; references that cannot be resolved are left
//! out rather than treated as errors.

use crate::types::{Author, Event, PollOption, RuleId};
use serde::Deserialize;

/// One record of the filtered stream.
#[derive(Debug, Default, Deserialize)]
pub struct StreamRecord {
    /// Absent on server-side notices (e.g. operational disconnect messages).
    #[serde(default)]
    pub data: Option<WirePost>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub matching_rules: Vec<MatchedRule>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

impl StreamRecord {
    /// Convert into a domain event, or `None` if the record carries no post.
    pub fn into_event(self) -> Option<Event> {
        let StreamRecord {
            data,
            includes,
            matching_rules,
            ..
        } = self;
        data.map(|post| to_event(post, &includes, &matching_rules))
    }
}

/// A rule the server reports as matched; only the id is used.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchedRule {
    #[serde(default)]
    pub id: Option<RuleId>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// A post as the API describes it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WirePost {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub public_metrics: Metrics,
    #[serde(default)]
    pub attachments: Attachments,
    #[serde(default)]
    pub possibly_sensitive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

/// Keys into the `includes` bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
    #[serde(default)]
    pub poll_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub profile_image_url: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireMedia {
    #[serde(default)]
    pub media_key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub preview_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WirePoll {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub options: Vec<PollOption>,
}

/// Metadata delivered alongside a post.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub users: Vec<WireUser>,
    #[serde(default)]
    pub media: Vec<WireMedia>,
    #[serde(default)]
    pub polls: Vec<WirePoll>,
}

/// Merge a post with its includes metadata and matched rules.
pub fn to_event(post: WirePost, includes: &Includes, matches: &[MatchedRule]) -> Event {
    let author = includes
        .users
        .iter()
        .find(|u| !u.id.is_empty() && u.id == post.author_id)
        .map(|u| Author {
            name: u.name.clone(),
            handle: u.username.clone(),
            picture: u.profile_image_url.clone(),
            verified: u.verified,
            id: u.id.clone(),
        })
        .unwrap_or_default();

    let mut images = Vec::new();
    let mut has_video = false;
    let mut video_preview_url = None;
    for key in &post.attachments.media_keys {
        for media in includes.media.iter().filter(|m| &m.media_key == key) {
            match media.kind.as_str() {
                "photo" => images.extend(media.url.clone()),
                "video" => {
                    has_video = true;
                    video_preview_url = media.preview_image_url.clone();
                }
                _ => {}
            }
        }
    }

    // Last referenced poll wins; a post carries at most one in practice.
    let poll = post
        .attachments
        .poll_ids
        .iter()
        .filter_map(|id| includes.polls.iter().find(|p| &p.id == id))
        .last()
        .map(|p| p.options.clone())
        .unwrap_or_default();

    Event {
        id: post.id,
        text: post.text,
        author,
        created: post.created_at,
        images,
        retweets: post.public_metrics.retweet_count,
        replies: post.public_metrics.reply_count,
        likes: post.public_metrics.like_count,
        quotes: post.public_metrics.quote_count,
        rule_ids: matches.iter().filter_map(|m| m.id.clone()).collect(),
        has_video,
        video_preview_url,
        sensitive: post.possibly_sensitive,
        poll,
    }
}
