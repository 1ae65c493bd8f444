//! Blog posts (`blogs`) with their comment and video sub-records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::{decode_all, lenient_records, lenient_strings};
use crate::remote::{BackendValue, Direction, Fields, Patch, Query, RemoteCollection, Timestamp};
use crate::sync::{
    CollectionSpec, MutationError, MutationResult, Schema, SyncClient,
};

/// Backend collection name
pub const BLOGS: &str = "blogs";

/// Uploads at or above this size are long-form videos
pub const SHORT_VIDEO_LIMIT: u64 = 20 * 1024 * 1024;

pub fn spec() -> CollectionSpec {
    CollectionSpec::new(BLOGS)
        .with_schema(
            Schema::new()
                .timestamp("createdAt")
                .timestamp("updatedAt")
                .list("tags")
                .records("comments", Schema::new().timestamp("createdAt"))
                .records("videos", Schema::new().timestamp("uploadedAt")),
        )
        .with_query(Query::all().order_by("createdAt", Direction::Descending))
        .with_created_field("createdAt")
        .with_updated_field("updatedAt")
}

/// Publication state of a post
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Draft,
    Published,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Published => "published",
        }
    }
}

/// Anything other than `published` is treated as a draft
fn lenient_status<'de, D>(deserializer: D) -> Result<PostStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().eq_ignore_ascii_case("published") => PostStatus::Published,
        _ => PostStatus::Draft,
    })
}

/// Normalized timestamps are strings; anything else reads as absent
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn default_author() -> String {
    "Admin".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "createdAt", default, deserialize_with = "lenient_time")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    #[serde(default)]
    pub url: String,
    /// `short` or `long`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: String,
    #[serde(rename = "uploadedAt", default, deserialize_with = "lenient_time")]
    pub uploaded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(rename = "imageUrl", default)]
    pub image_url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: PostStatus,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(rename = "createdAt", default, deserialize_with = "lenient_time")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt", default, deserialize_with = "lenient_time")]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_records")]
    pub comments: Vec<Comment>,
    #[serde(default, deserialize_with = "lenient_records")]
    pub videos: Vec<Video>,
}

impl BlogPost {
    pub fn is_published(&self) -> bool {
        self.status == PostStatus::Published
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn matches_search(&self, needle: &str) -> bool {
        needle.is_empty()
            || self.title.to_lowercase().contains(needle)
            || self.content.to_lowercase().contains(needle)
    }
}

// ============================================================================
// Views
// ============================================================================

/// Every post in the latest snapshot, newest first
pub fn all(client: &SyncClient) -> Vec<BlogPost> {
    client.view(BLOGS, decode_all::<BlogPost>)
}

pub fn published(posts: &[BlogPost]) -> Vec<BlogPost> {
    posts.iter().filter(|p| p.is_published()).cloned().collect()
}

/// Sort order of the admin listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlogSort {
    #[default]
    Newest,
    Oldest,
    Title,
}

/// Search, status filter and sort of the admin listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminFilter {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub status: Option<PostStatus>,
    #[serde(default)]
    pub sort: BlogSort,
}

impl AdminFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn with_status(mut self, status: PostStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_sort(mut self, sort: BlogSort) -> Self {
        self.sort = sort;
        self
    }
}

pub fn filter(posts: &[BlogPost], filter: &AdminFilter) -> Vec<BlogPost> {
    let needle = filter.search.trim().to_lowercase();
    let mut out: Vec<BlogPost> = posts
        .iter()
        .filter(|p| filter.status.map_or(true, |s| p.status == s))
        .filter(|p| p.matches_search(&needle))
        .cloned()
        .collect();

    match filter.sort {
        BlogSort::Newest => out.sort_by(|a, b| compare_created(b, a)),
        BlogSort::Oldest => out.sort_by(compare_created),
        BlogSort::Title => out.sort_by_key(|p| p.title.to_lowercase()),
    }
    out
}

/// Posts without a readable creation time sort as oldest
fn compare_created(a: &BlogPost, b: &BlogPost) -> Ordering {
    a.created().cmp(&b.created())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub published: usize,
    pub draft: usize,
}

pub fn status_counts(posts: &[BlogPost]) -> StatusCounts {
    posts.iter().fold(StatusCounts::default(), |mut counts, p| {
        match p.status {
            PostStatus::Published => counts.published += 1,
            PostStatus::Draft => counts.draft += 1,
        }
        counts
    })
}

/// Videos of one post from the store; empty if the post is unknown
pub fn videos_of(client: &SyncClient, blog_id: &str) -> Vec<Video> {
    client
        .get_by_id(BLOGS, blog_id)
        .and_then(|entity| entity.decode::<BlogPost>().ok())
        .map(|post| post.videos)
        .unwrap_or_default()
}

// ============================================================================
// Sub-record writes
// ============================================================================

/// Comment submitted by a reader
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewComment {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub text: String,
}

/// Video attached by an admin after upload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewVideo {
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl NewVideo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// `short` below [`SHORT_VIDEO_LIMIT`] bytes, `long` otherwise
pub fn video_kind_for_size(bytes: u64) -> &'static str {
    if bytes < SHORT_VIDEO_LIMIT {
        "short"
    } else {
        "long"
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Append a comment stamped with the current time
pub async fn add_comment(client: &SyncClient, blog_id: &str, comment: NewComment) -> MutationResult<()> {
    if blog_id.trim().is_empty() || comment.text.trim().is_empty() {
        return Err(MutationError::Invalid(
            "blog id and comment are required".to_string(),
        ));
    }

    let mut record = Fields::new();
    record.insert("author".into(), comment.author.into());
    record.insert("text".into(), comment.text.into());
    record.insert("createdAt".into(), Timestamp::now().into());

    let patch = Patch::new().array_union("comments", vec![BackendValue::Map(record)]);
    client.apply(BLOGS, blog_id, patch).await
}

/// Append a video, filling type, title and duration defaults
pub async fn add_video(client: &SyncClient, blog_id: &str, video: NewVideo) -> MutationResult<()> {
    if blog_id.trim().is_empty() || video.url.trim().is_empty() {
        return Err(MutationError::Invalid(
            "blog id and video url are required".to_string(),
        ));
    }

    let now = Timestamp::now();
    let title = non_blank(video.title).unwrap_or_else(|| format!("Video {}", now.to_millis()));

    let mut record = Fields::new();
    record.insert("url".into(), video.url.into());
    record.insert(
        "type".into(),
        non_blank(video.kind).unwrap_or_else(|| "short".to_string()).into(),
    );
    record.insert("title".into(), title.into());
    record.insert(
        "duration".into(),
        non_blank(video.duration).unwrap_or_else(|| "0:00".to_string()).into(),
    );
    record.insert("uploadedAt".into(), now.into());

    let patch = Patch::new().array_union("videos", vec![BackendValue::Map(record)]);
    client.apply(BLOGS, blog_id, patch).await
}

/// Remove the first video with `url`, rewriting the list from a fresh read
pub async fn remove_video(client: &SyncClient, blog_id: &str, url: &str) -> MutationResult<()> {
    if blog_id.trim().is_empty() {
        return Err(MutationError::Invalid("blog id is required".to_string()));
    }

    let doc = client
        .remote()
        .get(BLOGS, blog_id)
        .await?
        .ok_or_else(|| MutationError::NotFound("blog not found".to_string()))?;

    let mut videos: Vec<BackendValue> = doc
        .get("videos")
        .and_then(BackendValue::as_array)
        .map(|items| items.to_vec())
        .unwrap_or_default();

    let position = videos
        .iter()
        .position(|v| {
            v.as_map()
                .and_then(|m| m.get("url"))
                .and_then(BackendValue::as_str)
                == Some(url)
        })
        .ok_or_else(|| MutationError::NotFound("video not found".to_string()))?;
    videos.remove(position);

    client
        .apply(BLOGS, blog_id, Patch::new().set("videos", BackendValue::Array(videos)))
        .await
}
