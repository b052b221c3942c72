//! Metric labels attached to every metric an entity emits.

/// Labels identifying the node an entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    node: String,
    node_type: String,
    groups: Vec<String>,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            node_type: node_type.into(),
            groups: Vec::new(),
        }
    }

    /// Attach custom grouping tags.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Labels in the form accepted by the `metrics` macros.
    ///
    /// Groups are joined with commas under a single `groups` label.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("node", self.node.clone()), ("node_type", self.node_type.clone())];
        if !self.groups.is_empty() {
            labels.push(("groups", self.groups.join(",")));
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_labels() {
        let labels = MetricLabels::new("ap0", "ap");
        assert_eq!(
            labels.to_labels(),
            vec![("node", "ap0".to_string()), ("node_type", "ap".to_string())]
        );
        let grouped = labels.with_groups(vec!["bss1".into(), "floor2".into()]);
        assert_eq!(grouped.to_labels()[2], ("groups", "bss1,floor2".to_string()));
    }
}
