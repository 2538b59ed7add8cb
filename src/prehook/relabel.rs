use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use super::Filter;
use crate::scrape::{RelabelAction, RelabelConfig};
use crate::target::TargetItem;

/// One compiled keep/drop rule.
struct Rule {
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    action: RelabelAction,
}

impl Rule {
    fn compile(config: &RelabelConfig) -> Option<Rule> {
        match config.action {
            RelabelAction::Keep | RelabelAction::Drop => {}
            // only keep/drop can remove a target before allocation
            _ => return None,
        }

        // Anchored, like Prometheus relabeling.
        let regex = match Regex::new(&format!("^(?:{})$", config.regex)) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(
                    message = "ignoring relabel rule with invalid regex",
                    regex = config.regex,
                    %err
                );
                return None;
            }
        };

        Some(Rule {
            source_labels: config.source_labels.clone(),
            separator: config.separator.clone(),
            regex,
            action: config.action,
        })
    }

    fn keeps(&self, target: &TargetItem) -> bool {
        let value = self
            .source_labels
            .iter()
            .map(|name| target.labels.get(name).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.separator);

        match self.action {
            RelabelAction::Keep => self.regex.is_match(&value),
            RelabelAction::Drop => !self.regex.is_match(&value),
            RelabelAction::Replace => true,
        }
    }
}

/// Drops targets that their job's `keep`/`drop` relabel rules would discard,
/// so collectors never receive work that relabeling throws away anyway.
pub struct RelabelConfigFilter {
    rules: RwLock<HashMap<String, Vec<Rule>>>,
}

impl RelabelConfigFilter {
    pub fn new() -> Self {
        RelabelConfigFilter {
            rules: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for RelabelConfigFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for RelabelConfigFilter {
    fn apply(
        &self,
        targets: HashMap<String, Arc<TargetItem>>,
    ) -> HashMap<String, Arc<TargetItem>> {
        let rules = self.rules.read();
        let total = targets.len();

        let kept = targets
            .into_iter()
            .filter(|(_, target)| match rules.get(&target.job_name) {
                Some(rules) => rules.iter().all(|rule| rule.keeps(target)),
                None => true,
            })
            .collect::<HashMap<_, _>>();

        if kept.len() != total {
            debug!(
                message = "relabel filter dropped targets",
                dropped = total - kept.len(),
                kept = kept.len(),
            );
        }

        kept
    }

    fn update_relabel_configs(&self, configs: HashMap<String, Vec<RelabelConfig>>) {
        let compiled = configs
            .into_iter()
            .map(|(job, configs)| {
                let rules = configs.iter().filter_map(Rule::compile).collect::<Vec<_>>();
                (job, rules)
            })
            .collect();

        *self.rules.write() = compiled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::Labels;

    fn target(job: &str, pairs: &[(&str, &str)]) -> (String, Arc<TargetItem>) {
        let labels: Labels = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let item = Arc::new(TargetItem::new(job, "10.0.0.1:9100", labels));
        (item.key().to_string(), item)
    }

    fn relabel(action: RelabelAction, source: &str, regex: &str) -> RelabelConfig {
        RelabelConfig {
            source_labels: vec![source.to_string()],
            separator: ";".into(),
            regex: regex.into(),
            action,
            target_label: None,
            replacement: None,
        }
    }

    #[test]
    fn keep_rule_filters_non_matching() {
        let filter = RelabelConfigFilter::new();
        filter.update_relabel_configs(HashMap::from([(
            "node".to_string(),
            vec![relabel(RelabelAction::Keep, "env", "prod")],
        )]));

        let targets = HashMap::from([
            target("node", &[("env", "prod")]),
            target("node", &[("env", "dev")]),
        ]);

        let kept = filter.apply(targets);
        assert_eq!(kept.len(), 1);
        assert!(kept.values().all(|t| t.labels["env"] == "prod"));
    }

    #[test]
    fn drop_rule_filters_matching() {
        let filter = RelabelConfigFilter::new();
        filter.update_relabel_configs(HashMap::from([(
            "node".to_string(),
            vec![relabel(RelabelAction::Drop, "env", "dev|staging")],
        )]));

        let targets = HashMap::from([
            target("node", &[("env", "prod")]),
            target("node", &[("env", "dev")]),
            target("node", &[("env", "staging")]),
        ]);

        assert_eq!(filter.apply(targets).len(), 1);
    }

    #[test]
    fn jobs_without_rules_pass_through() {
        let filter = RelabelConfigFilter::new();
        filter.update_relabel_configs(HashMap::from([(
            "node".to_string(),
            vec![relabel(RelabelAction::Keep, "env", "prod")],
        )]));

        let targets = HashMap::from([target("kubelet", &[("env", "dev")])]);
        assert_eq!(filter.apply(targets).len(), 1);
    }

    #[test]
    fn replace_rules_are_ignored() {
        let filter = RelabelConfigFilter::new();
        filter.update_relabel_configs(HashMap::from([(
            "node".to_string(),
            vec![relabel(RelabelAction::Replace, "env", "prod")],
        )]));

        let targets = HashMap::from([target("node", &[("env", "dev")])]);
        assert_eq!(filter.apply(targets).len(), 1);
    }

    #[test]
    fn missing_source_label_joins_as_empty() {
        let filter = RelabelConfigFilter::new();
        filter.update_relabel_configs(HashMap::from([(
            "node".to_string(),
            vec![relabel(RelabelAction::Keep, "missing", "")],
        )]));

        let targets = HashMap::from([target("node", &[("env", "prod")])]);
        assert_eq!(filter.apply(targets).len(), 1);
    }
}
