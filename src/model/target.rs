use serde::{Deserialize, Serialize};

use super::{KeyValue, Labels};

/// Two-tier annotations: environment-native metadata (`platform`) and
/// engine-assigned metadata (`cryostat`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub platform: Labels,
    pub cryostat: Labels,
}

/// One discoverable, individually connectable JVM.
///
/// Identity is the connect URL. Two targets with the same URL are the same
/// target regardless of any other field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub connect_url: String,
    pub alias: String,
    pub jvm_id: Option<String>,
    pub labels: Labels,
    pub annotations: Annotations,
}

impl Target {
    pub fn new(connect_url: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            connect_url: connect_url.into(),
            alias: alias.into(),
            jvm_id: None,
            labels: Labels::new(),
            annotations: Annotations::default(),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_platform_annotations(mut self, annotations: Labels) -> Self {
        self.annotations.platform = annotations;
        self
    }

    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations
            .cryostat
            .insert(key.to_string(), value.into());
        self
    }

    /// True when everything but the JVM id matches. The JVM id is derived
    /// after connection and is never part of an observation.
    pub fn same_observation(&self, other: &Target) -> bool {
        self.connect_url == other.connect_url
            && self.alias == other.alias
            && self.labels == other.labels
            && self.annotations == other.annotations
    }

    /// `host:port` authority of the connect URL, if one can be found.
    ///
    /// Handles both plain URLs (`http://h:8080/`) and JMX service URLs
    /// (`service:jmx:rmi:///jndi/rmi://h:9091/jmxrmi`), where the authority
    /// is the innermost `//` segment.
    pub fn authority(&self) -> Option<&str> {
        let start = self.connect_url.rfind("://")? + 3;
        let rest = &self.connect_url[start..];
        let end = rest.find('/').unwrap_or(rest.len());
        let authority = &rest[..end];
        (!authority.is_empty()).then_some(authority)
    }
}

/// Standard JMX-over-RMI connect URL for a host and port.
pub fn jmx_service_url(host: &str, port: u16) -> String {
    format!("service:jmx:rmi:///jndi/rmi://{}:{}/jmxrmi", host, port)
}

/// Wire form of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDto {
    pub connect_url: String,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<KeyValue>,
    #[serde(default)]
    pub annotations: AnnotationsDto,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationsDto {
    #[serde(default)]
    pub platform: Vec<KeyValue>,
    #[serde(default)]
    pub cryostat: Vec<KeyValue>,
}

impl From<&Target> for TargetDto {
    fn from(t: &Target) -> Self {
        Self {
            connect_url: t.connect_url.clone(),
            alias: t.alias.clone(),
            jvm_id: t.jvm_id.clone(),
            labels: KeyValue::from_map(&t.labels),
            annotations: AnnotationsDto {
                platform: KeyValue::from_map(&t.annotations.platform),
                cryostat: KeyValue::from_map(&t.annotations.cryostat),
            },
        }
    }
}

impl TryFrom<&TargetDto> for Target {
    type Error = super::DuplicateKey;

    fn try_from(dto: &TargetDto) -> Result<Self, Self::Error> {
        Ok(Target {
            connect_url: dto.connect_url.clone(),
            alias: dto.alias.clone(),
            jvm_id: dto.jvm_id.clone(),
            labels: KeyValue::to_map(&dto.labels)?,
            annotations: Annotations {
                platform: KeyValue::to_map(&dto.annotations.platform)?,
                cryostat: KeyValue::to_map(&dto.annotations.cryostat)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jmx_service_url() {
        assert_eq!(
            jmx_service_url("h1", 9091),
            "service:jmx:rmi:///jndi/rmi://h1:9091/jmxrmi"
        );
    }

    #[test]
    fn test_authority_of_jmx_url() {
        let t = Target::new(jmx_service_url("10.0.0.5", 9091), "a");
        assert_eq!(t.authority(), Some("10.0.0.5:9091"));
    }

    #[test]
    fn test_authority_of_http_url() {
        let t = Target::new("http://agent.local:9977/", "a");
        assert_eq!(t.authority(), Some("agent.local:9977"));
    }

    #[test]
    fn test_same_observation_ignores_jvm_id() {
        let a = Target::new("u", "a");
        let mut b = a.clone();
        b.jvm_id = Some("abc".to_string());
        assert!(a.same_observation(&b));
        b.alias = "other".to_string();
        assert!(!a.same_observation(&b));
    }

    #[test]
    fn test_dto_rejects_duplicate_labels() {
        let dto = TargetDto {
            connect_url: "u".to_string(),
            alias: "a".to_string(),
            labels: vec![KeyValue::new("k", "1"), KeyValue::new("k", "2")],
            ..Default::default()
        };
        assert!(Target::try_from(&dto).is_err());
    }
}
