//! Entity Key Families
//!
//! Query keys and change routes for the application's entities.

use serde_json::Value;

use crate::invalidation::PriorityRule;
use crate::keys::{make_key, KeyRegistry, KeySegment, QueryKey, DETAIL, LIST};
use crate::repository::ChangeEvent;

pub const THOUGHTS: &str = "thoughts";
pub const TRENDING_TOPICS: &str = "trending_topics";
pub const CONTENT_SUGGESTIONS: &str = "content_suggestions";
pub const VOICE_CAPTURES: &str = "voice_captures";

/// Mention count at which a trending topic raises a notice.
pub const TRENDING_SPIKE_THRESHOLD: u64 = 10;

// == Entity Keys ==
/// Key constructors for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityKeys {
    entity: &'static str,
}

impl EntityKeys {
    pub const fn new(entity: &'static str) -> Self {
        Self { entity }
    }

    pub fn name(&self) -> &'static str {
        self.entity
    }

    /// Every key of the entity.
    pub fn all(&self) -> QueryKey {
        QueryKey::entity(self.entity)
    }

    pub fn list(&self) -> QueryKey {
        make_key(self.entity, LIST, None)
    }

    /// A list narrowed by filter parameters.
    pub fn filtered(&self, filters: KeySegment) -> QueryKey {
        make_key(self.entity, LIST, Some(filters))
    }

    pub fn detail(&self, id: impl Into<KeySegment>) -> QueryKey {
        make_key(self.entity, DETAIL, Some(id.into()))
    }
}

pub const THOUGHT_KEYS: EntityKeys = EntityKeys::new(THOUGHTS);
pub const TRENDING_KEYS: EntityKeys = EntityKeys::new(TRENDING_TOPICS);
pub const SUGGESTION_KEYS: EntityKeys = EntityKeys::new(CONTENT_SUGGESTIONS);
pub const CAPTURE_KEYS: EntityKeys = EntityKeys::new(VOICE_CAPTURES);

// == Routes ==
/// Registry with the derived-data routes: trending topics and content
/// suggestions are computed from thoughts.
pub fn default_registry() -> KeyRegistry {
    let mut registry = KeyRegistry::new();
    registry.route(THOUGHTS, vec![TRENDING_KEYS.all(), SUGGESTION_KEYS.all()]);
    registry
}

// == Priority Rules ==
fn mention_count(event: &ChangeEvent) -> Option<u64> {
    event.field("mention_count").and_then(Value::as_u64)
}

/// Raises a notice the first time a topic reaches `threshold` mentions.
pub fn trending_spike_rule(threshold: u64) -> PriorityRule {
    PriorityRule::new(
        "trending_spike",
        TRENDING_TOPICS,
        move |event| mention_count(event).is_some_and(|count| count >= threshold),
        |event| {
            let topic = event
                .field("topic")
                .and_then(Value::as_str)
                .or(event.id.as_deref())
                .unwrap_or("unknown");
            format!(
                "'{topic}' is trending with {} mentions",
                mention_count(event).unwrap_or_default()
            )
        },
    )
}
