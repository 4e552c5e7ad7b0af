// Topic naming for parameter subscriptions and control publishes.
//
// These strings are shared with other broker clients, so the layout must not
// change: parameters subscribe to `<root>/<lowercased entity id>`, control
// values are published to `<control_root><key>` with no separator inserted.

/// Errors that can occur while building a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Topic is empty
    Empty,
    /// Entity id is empty
    EmptyEntityId,
    /// Topic contains a subscription wildcard
    Wildcard(String),
    /// Topic contains a NUL character
    NulCharacter(String),
    /// Topic has an empty level (leading, trailing or doubled `/`)
    EmptyLevel(String),
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Topic is empty"),
            Self::EmptyEntityId => write!(f, "Entity id is empty"),
            Self::Wildcard(s) => write!(f, "Topic contains a wildcard: {}", s),
            Self::NulCharacter(s) => write!(f, "Topic contains a NUL character: {:?}", s),
            Self::EmptyLevel(s) => write!(f, "Topic has an empty level: {}", s),
        }
    }
}

impl std::error::Error for TopicError {}

/// Characters with wildcard or reserved meaning to MQTT or zenoh
const WILDCARD_CHARS: [char; 5] = ['+', '#', '*', '?', '$'];

/// Validate a concrete (non-wildcard) topic
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains(WILDCARD_CHARS) {
        return Err(TopicError::Wildcard(topic.to_string()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter(topic.to_string()));
    }
    if topic.split('/').any(str::is_empty) {
        return Err(TopicError::EmptyLevel(topic.to_string()));
    }
    Ok(())
}

/// Build the subscription topic of a parameter
///
/// # Examples
/// ```
/// use zparam::topic::parameter_topic;
///
/// assert_eq!(parameter_topic("battery", "MaxSOC").unwrap(), "battery/maxsoc");
/// ```
pub fn parameter_topic(root_topic: &str, entity_id: &str) -> Result<String, TopicError> {
    if entity_id.is_empty() {
        return Err(TopicError::EmptyEntityId);
    }
    let topic = format!("{}/{}", root_topic, entity_id.to_lowercase());
    validate_topic(&topic)?;
    Ok(topic)
}

/// Build a control publish topic. The caller supplies any separator in `key`.
pub fn publish_topic(control_root: &str, key: &str) -> Result<String, TopicError> {
    let topic = format!("{}{}", control_root, key);
    validate_topic(&topic)?;
    Ok(topic)
}

/// Format a published value as fixed-point with three fraction digits
pub fn format_value(value: f64) -> String {
    format!("{:.3}", value)
}
