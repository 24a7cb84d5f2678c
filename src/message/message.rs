use std::collections::BTreeSet;
use std::fmt;

/// Target value meaning "every configured peer plus the sender". It is resolved to concrete
/// identities at send time, never at receive time.
pub const WILDCARD: &str = "*";

/// Topic of the periodic liveness announcement. Reserved.
pub const ALIVE_TOPIC: &str = "ALIVE";
/// Topic of the internal stop request. Reserved.
pub const STOP_TOPIC: &str = "STOP";
/// Topic of the internal cross-thread relay hop. Reserved.
pub const RELAY_TOPIC: &str = "RELAY";

const RESERVED_TOPICS: [&str; 3] = [ALIVE_TOPIC, STOP_TOPIC, RELAY_TOPIC];

/// Returns true for topics the service uses internally. Application code must not send these.
pub fn is_reserved_topic(topic: &str) -> bool {
    RESERVED_TOPICS.contains(&topic)
}

/// A one-way message routed by topic to a set of target nodes.
///
/// `frames` keep their order end to end. `targets` is never empty; the order of targets is not
/// meaningful.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    topic: String,
    sender: String,
    targets: BTreeSet<String>,
    frames: Vec<String>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum MessageError {
    #[error("The 'topic' cannot be empty")]
    EmptyTopic,
    #[error("The 'sender' cannot be empty")]
    EmptySender,
    #[error("The 'targets' cannot be empty")]
    EmptyTargets,
    #[error("Invalid target '{0}': must be non-blank and contain no ','")]
    InvalidTarget(String),
    #[error("Malformed message frames: {0}")]
    MalformedFrames(&'static str),
}

impl Message {
    pub fn new<T, F>(
        topic: impl Into<String>,
        sender: impl Into<String>,
        targets: T,
        frames: F,
    ) -> Result<Self, MessageError>
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut message = Self::without_targets(topic.into(), sender.into())?;
        message.targets = collect_targets(targets)?;
        if message.targets.is_empty() {
            return Err(MessageError::EmptyTargets);
        }
        message.frames.extend(frames.into_iter().map(Into::into));

        Ok(message)
    }

    /// Same as `new()`, but `targets` is a comma separated list with no spaces, as it appears on
    /// the wire.
    pub fn with_target_list<F>(
        topic: impl Into<String>,
        sender: impl Into<String>,
        targets: &str,
        frames: F,
    ) -> Result<Self, MessageError>
    where
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let targets = split_target_list(targets);
        if targets.is_empty() {
            return Err(MessageError::EmptyTargets);
        }

        Self::new(topic, sender, targets, frames)
    }

    /// Message addressed to the wildcard target.
    pub fn broadcast<F>(topic: impl Into<String>, sender: impl Into<String>, frames: F) -> Result<Self, MessageError>
    where
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self::new(topic, sender, std::iter::once(WILDCARD), frames)
    }

    fn without_targets(topic: String, sender: String) -> Result<Self, MessageError> {
        if topic.trim().is_empty() {
            return Err(MessageError::EmptyTopic);
        }
        if sender.trim().is_empty() {
            return Err(MessageError::EmptySender);
        }

        Ok(Message {
            topic,
            sender,
            targets: BTreeSet::new(),
            frames: Vec::new(),
        })
    }

    /// Rebuild a message from its wire layout: `[topic, sender, targets, frame0, frame1, ...]`.
    pub(crate) fn from_wire_frames(wire_frames: Vec<String>) -> Result<Self, MessageError> {
        let mut parts = wire_frames.into_iter();
        let topic = parts.next().ok_or(MessageError::MalformedFrames("missing topic"))?;
        let sender = parts.next().ok_or(MessageError::MalformedFrames("missing sender"))?;
        let targets = parts.next().ok_or(MessageError::MalformedFrames("missing targets"))?;

        Self::with_target_list(topic, sender, &targets, parts)
    }

    /// The wire layout of this message: `[topic, sender, targets, frame0, frame1, ...]`.
    pub(crate) fn to_wire_frames(&self) -> Vec<String> {
        let mut wire_frames = Vec::with_capacity(self.frames.len() + 3);
        wire_frames.push(self.topic.clone());
        wire_frames.push(self.sender.clone());
        wire_frames.push(self.targets_as_string());
        wire_frames.extend(self.frames.iter().cloned());

        wire_frames
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn targets_contains(&self, node: &str) -> bool {
        self.targets.contains(node)
    }

    pub fn is_wildcard(&self) -> bool {
        self.targets_contains(WILDCARD)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(String::as_str)
    }

    /// Comma separated targets. A single target is returned as-is.
    pub fn targets_as_string(&self) -> String {
        let mut targets = self.targets.iter();
        match (targets.next(), targets.next()) {
            (Some(only), None) => only.clone(),
            _ => self.targets.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }

    /// Replace every target. The replacement must not be empty.
    pub fn replace_targets<T>(&mut self, new_targets: T) -> Result<(), MessageError>
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let new_targets = collect_targets(new_targets)?;
        if new_targets.is_empty() {
            return Err(MessageError::EmptyTargets);
        }
        self.targets = new_targets;

        Ok(())
    }

    pub fn add_targets<T>(&mut self, new_targets: T) -> Result<(), MessageError>
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let new_targets = collect_targets(new_targets)?;
        self.targets.extend(new_targets);

        Ok(())
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn frames_iter(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(String::as_str)
    }

    pub fn add_frames<F>(&mut self, new_frames: F)
    where
        F: IntoIterator,
        F::Item: Into<String>,
    {
        self.frames.extend(new_frames.into_iter().map(Into::into));
    }

    pub fn into_frames(self) -> Vec<String> {
        self.frames
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Topic='{}'; Sender='{}'; Targets='{}', Frames='{}'",
            self.topic,
            self.sender,
            self.targets_as_string(),
            self.frames.join("|")
        )
    }
}

/// All or nothing: one bad target rejects the whole set.
fn collect_targets<T>(targets: T) -> Result<BTreeSet<String>, MessageError>
where
    T: IntoIterator,
    T::Item: Into<String>,
{
    targets
        .into_iter()
        .map(Into::into)
        .map(|target: String| {
            if target.trim().is_empty() || target.contains(',') {
                Err(MessageError::InvalidTarget(target))
            } else {
                Ok(target)
            }
        })
        .collect()
}

fn split_target_list(targets: &str) -> Vec<&str> {
    targets.split(',').filter(|t| !t.is_empty()).collect()
}
