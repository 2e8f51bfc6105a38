//! # Feed Items
//!
//! A `FeedItem` is what the upstream collaborator produces for one post. It is
//! immutable, consumed once by the fan-out and then dropped.
//!
//! Subscribers never see `FeedItem` directly; they receive its `ItemView`
//! encoded as JSON. Live deliveries carry one object, fallback and initial-load
//! deliveries carry an array of the objects matching the subscriber's tag.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::tag::Tag;
use crate::error::PayloadError;

/// Provenance of a reshared item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reshare {
    /// Id of the original item.
    pub id: String,
    /// Author of the original item.
    pub author: String,
}

/// A normalized record from the live feed or a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    /// Stable id of this item, used for de-duplication.
    pub id: String,
    /// Body text. For a reshare, the text of the original.
    pub text: String,
    /// Tags attached to the item, in upstream casing.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time, epoch milliseconds.
    pub time: i64,
    /// Author handle.
    pub author: String,
    /// Author avatar URL, if the upstream provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_avatar: Option<String>,
    /// Set when this item reshares another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reshare_of: Option<Reshare>,
}

impl FeedItem {
    /// Whether any of the item's tags equals `tag`, ignoring case.
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.iter().any(|t| tag.matches(t))
    }

    /// The subscriber-facing view of this item.
    pub fn view(&self) -> ItemView<'_> {
        match &self.reshare_of {
            Some(original) => ItemView {
                text: format!("RT @{}: {}", original.author, self.text),
                time: self.time,
                username: &self.author,
                user_profile_picture: self.author_avatar.as_deref(),
                is_reshare: true,
                original_username: &original.author,
                id: &original.id,
                status_id: &self.id,
                tags: &self.tags,
            },
            None => ItemView {
                text: self.text.clone(),
                time: self.time,
                username: &self.author,
                user_profile_picture: self.author_avatar.as_deref(),
                is_reshare: false,
                original_username: &self.author,
                id: &self.id,
                status_id: &self.id,
                tags: &self.tags,
            },
        }
    }
}

/// Subscriber-facing JSON shape of a `FeedItem`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView<'a> {
    /// Display text, prefixed with `RT @author:` for reshares.
    pub text: String,
    /// Creation time, epoch milliseconds.
    pub time: i64,
    /// Author handle.
    pub username: &'a str,
    /// Author avatar URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_profile_picture: Option<&'a str>,
    /// Whether this is a reshare.
    pub is_reshare: bool,
    /// Author of the original content.
    pub original_username: &'a str,
    /// Id of the original content, used by clients to de-duplicate reshares.
    pub id: &'a str,
    /// Id of this particular item.
    pub status_id: &'a str,
    /// Tags carried by the item.
    pub tags: &'a [String],
}

/// Encodes one item for live delivery.
pub fn encode_item(item: &FeedItem) -> Result<Bytes, PayloadError> {
    Ok(Bytes::from(serde_json::to_vec(&item.view())?))
}

/// Encodes a batch of items (fallback and initial-load delivery).
pub fn encode_batch<'a, I>(items: I) -> Result<Bytes, PayloadError>
where
    I: IntoIterator<Item = &'a FeedItem>,
{
    let views: Vec<ItemView<'a>> = items.into_iter().map(FeedItem::view).collect();
    Ok(Bytes::from(serde_json::to_vec(&views)?))
}
