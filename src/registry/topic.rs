//! Status topic parsing
//!
//! Inbound topics look like `stat/{type}/{name}` with an optional sub-topic
//! below the device. The type segment is case-normalized so `stat/S20/x` and
//! `stat/s20/x` address the same device.

/// Subscription filter covering every status topic
pub const STATUS_FILTER: &str = "stat/#";

const STATUS_PREFIX: &str = "stat/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub type_name: String,
    pub name: String,
    pub sub_topic: Option<String>,
}

impl DeviceTopic {
    pub fn parse(topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(STATUS_PREFIX)?;
        let mut segments = rest.splitn(3, '/');

        let type_name = segments.next().filter(|s| !s.is_empty())?;
        let name = segments.next().filter(|s| !s.is_empty())?;
        let sub_topic = segments
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Some(Self {
            type_name: type_name.to_ascii_lowercase(),
            name: name.to_string(),
            sub_topic,
        })
    }

    pub fn device_id(&self) -> String {
        format!("{}/{}", self.type_name, self.name)
    }
}

/// Device id addressed by a status topic
pub fn identify(topic: &str) -> Option<String> {
    DeviceTopic::parse(topic).map(|t| t.device_id())
}
