//! MQTT Topic 约定：`/{productKey}/{deviceKey}/{kind}/...`
//!
//! 段顺序参与路由，不可调整。

/// Topic 消息类别（第三段）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Property,
    Event,
    Response,
    Command,
    Gateway,
    Topo,
    Other(String),
}

impl TopicKind {
    fn parse(segment: &str) -> Self {
        match segment {
            "property" => Self::Property,
            "event" => Self::Event,
            "response" => Self::Response,
            "command" => Self::Command,
            "gateway" => Self::Gateway,
            "topo" => Self::Topo,
            other => Self::Other(other.to_string()),
        }
    }
}

/// 解析后的设备 Topic。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub product_key: String,
    pub device_key: String,
    pub kind: TopicKind,
    /// kind 之后的剩余段（如 `post`、`down`）
    pub rest: Vec<String>,
}

impl DeviceTopic {
    /// 解析 `/{productKey}/{deviceKey}/{kind}/...`；段数不足返回 None。
    pub fn parse(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        // 以 `/` 开头，parts[0] 为空串
        if parts.len() < 4 || !parts[0].is_empty() {
            return None;
        }
        if parts[1].is_empty() || parts[2].is_empty() || parts[3].is_empty() {
            return None;
        }
        Some(Self {
            product_key: parts[1].to_string(),
            device_key: parts[2].to_string(),
            kind: TopicKind::parse(parts[3]),
            rest: parts[4..].iter().map(|part| part.to_string()).collect(),
        })
    }
}

/// 属性上报 Topic。
pub fn property_post_topic(product_key: &str, device_key: &str) -> String {
    format!("/{}/{}/property/post", product_key, device_key)
}

/// 指令下行 Topic。
pub fn command_down_topic(product_key: &str, device_key: &str) -> String {
    format!("/{}/{}/command/down", product_key, device_key)
}

/// 拓扑操作应答 Topic。
pub fn topo_response_topic(gateway_key: &str) -> String {
    format!("/{}/topo/response", gateway_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_property_topic() {
        let topic = DeviceTopic::parse("/prod-1/dev-1/property/post").expect("topic");
        assert_eq!(topic.product_key, "prod-1");
        assert_eq!(topic.device_key, "dev-1");
        assert_eq!(topic.kind, TopicKind::Property);
        assert_eq!(topic.rest, vec!["post".to_string()]);
    }

    #[test]
    fn rejects_short_or_relative_topics() {
        assert!(DeviceTopic::parse("/prod-1/dev-1").is_none());
        assert!(DeviceTopic::parse("prod-1/dev-1/property/post").is_none());
        assert!(DeviceTopic::parse("//dev-1/property").is_none());
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let topic = DeviceTopic::parse("/p/d/ota/progress").expect("topic");
        assert_eq!(topic.kind, TopicKind::Other("ota".to_string()));
    }

    #[test]
    fn builds_topics() {
        assert_eq!(property_post_topic("p", "d"), "/p/d/property/post");
        assert_eq!(command_down_topic("p", "d"), "/p/d/command/down");
        assert_eq!(topo_response_topic("gw"), "/gw/topo/response");
    }
}
