//! Destination resolution
//!
//! Expands a tenant, a namespace list and a topic name into the ordered list
//! of broker addresses the workers publish to and subscribe from. The same
//! [`Destinations`] value is used on the consumer side to map a delivered
//! topic back to its tag, so the tag embedded by producers and the tag used
//! for stats bucketing always come from one place.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::FIELD_SEPARATOR;

/// Template used when the configuration does not provide one
pub const DEFAULT_TOPIC_TEMPLATE: &str = "persistent://{tenant}/{namespace}/{topic}";

/// Suffix brokers append to the topic of a partitioned destination
const PARTITION_MARKER: &str = "-partition-";

/// A resolved publish/subscribe destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Namespace label used as the stats bucketing key
    pub tag: String,
    /// Fully-qualified topic identifier
    pub address: String,
}

/// Destination resolution errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DestinationError {
    /// Tenant is empty
    #[error("tenant must not be empty")]
    EmptyTenant,

    /// Topic is empty
    #[error("topic must not be empty")]
    EmptyTopic,

    /// A namespace entry in the comma-separated list is empty
    #[error("namespace entry {position} is empty")]
    EmptyNamespace {
        /// Zero-based position in the list
        position: usize,
    },

    /// A namespace contains the envelope field separator
    #[error("namespace '{0}' contains '|', which would corrupt the message envelope")]
    SeparatorInNamespace(String),

    /// Template lacks a required placeholder
    #[error("topic template is missing the {{{0}}} placeholder")]
    MissingPlaceholder(&'static str),

    /// Template uses a placeholder we do not know
    #[error("topic template uses unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),

    /// Template has an unbalanced brace
    #[error("topic template has an unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Tenant,
    Namespace,
    Topic,
}

/// Parsed topic template with `{tenant}`, `{namespace}` and `{topic}` placeholders
///
/// `{namespace}` expands to `<tenant>_<namespace>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TopicTemplate {
    /// Parse a template string
    pub fn parse(template: &str) -> Result<Self, DestinationError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(DestinationError::UnbalancedBrace(pos)),
                            c => name.push(c),
                        }
                    }
                    if !closed {
                        return Err(DestinationError::UnbalancedBrace(pos));
                    }
                    let segment = match name.as_str() {
                        "tenant" => Segment::Tenant,
                        "namespace" => Segment::Namespace,
                        "topic" => Segment::Topic,
                        _ => return Err(DestinationError::UnknownPlaceholder(name)),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return Err(DestinationError::UnbalancedBrace(pos)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        // Without these two the addresses would collide or ignore the topic.
        if !segments.contains(&Segment::Namespace) {
            return Err(DestinationError::MissingPlaceholder("namespace"));
        }
        if !segments.contains(&Segment::Topic) {
            return Err(DestinationError::MissingPlaceholder("topic"));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Render the address for one namespace
    pub fn render(&self, tenant: &str, namespace: &str, topic: &str) -> String {
        let mut out = String::with_capacity(self.source.len() + tenant.len() * 2 + topic.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Tenant => out.push_str(tenant),
                Segment::Namespace => {
                    out.push_str(tenant);
                    out.push('_');
                    out.push_str(namespace);
                }
                Segment::Topic => out.push_str(topic),
            }
        }
        out
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for TopicTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TOPIC_TEMPLATE.to_string(),
            segments: vec![
                Segment::Literal("persistent://".to_string()),
                Segment::Tenant,
                Segment::Literal("/".to_string()),
                Segment::Namespace,
                Segment::Literal("/".to_string()),
                Segment::Topic,
            ],
        }
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Ordered, immutable set of resolved destinations
#[derive(Debug, Clone, Default)]
pub struct Destinations {
    list: Vec<Destination>,
    by_address: HashMap<String, usize>,
}

impl Destinations {
    /// Build from already-resolved destinations
    pub fn new(list: Vec<Destination>) -> Self {
        let by_address = list
            .iter()
            .enumerate()
            .map(|(idx, d)| (d.address.clone(), idx))
            .collect();
        Self { list, by_address }
    }

    /// All destinations in configuration order
    pub fn as_slice(&self) -> &[Destination] {
        &self.list
    }

    /// Iterate in configuration order
    pub fn iter(&self) -> std::slice::Iter<'_, Destination> {
        self.list.iter()
    }

    /// Destination at `idx`
    pub fn get(&self, idx: usize) -> Option<&Destination> {
        self.list.get(idx)
    }

    /// Number of destinations
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True if nothing was resolved
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Tags in configuration order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(|d| d.tag.as_str())
    }

    /// Addresses in configuration order
    pub fn addresses(&self) -> Vec<String> {
        self.list.iter().map(|d| d.address.clone()).collect()
    }

    /// Map a delivered topic back to the tag it was resolved with
    ///
    /// A trailing `-partition-<n>` is ignored. Returns `None` for topics
    /// that were not produced by this resolver.
    pub fn tag_for_topic(&self, topic: &str) -> Option<&str> {
        let idx = self
            .by_address
            .get(topic)
            .or_else(|| self.by_address.get(strip_partition_suffix(topic)?))?;
        self.list.get(*idx).map(|d| d.tag.as_str())
    }
}

impl<'a> IntoIterator for &'a Destinations {
    type Item = &'a Destination;
    type IntoIter = std::slice::Iter<'a, Destination>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

fn strip_partition_suffix(topic: &str) -> Option<&str> {
    let (base, partition) = topic.rsplit_once(PARTITION_MARKER)?;
    if !partition.is_empty() && partition.bytes().all(|b| b.is_ascii_digit()) {
        Some(base)
    } else {
        None
    }
}

/// Expand a namespace specification into destinations
///
/// `namespaces` is a single name or a comma-separated list, split on `,`
/// as written. Each entry becomes one destination whose tag is the entry
/// itself, so surrounding spaces are kept and a repeated entry yields a
/// repeated destination. Blank entries and entries containing `|` are
/// rejected.
pub fn resolve(
    tenant: &str,
    namespaces: &str,
    topic: &str,
    template: &TopicTemplate,
) -> Result<Destinations, DestinationError> {
    if tenant.trim().is_empty() {
        return Err(DestinationError::EmptyTenant);
    }
    if topic.trim().is_empty() {
        return Err(DestinationError::EmptyTopic);
    }

    let mut list: Vec<Destination> = Vec::new();
    for (position, namespace) in namespaces.split(',').enumerate() {
        if namespace.trim().is_empty() {
            return Err(DestinationError::EmptyNamespace { position });
        }
        if namespace.contains(FIELD_SEPARATOR) {
            return Err(DestinationError::SeparatorInNamespace(namespace.to_string()));
        }
        list.push(Destination {
            tag: namespace.to_string(),
            address: template.render(tenant, namespace, topic),
        });
    }

    Ok(Destinations::new(list))
}
