//! Terraform plan output parsing.
//!
//! Only the human readable plan is parsed. Each resource block is preceded by
//! a `# <address> will be ...` header; the line after it starts with the
//! action symbol followed by `resource "<type>" "<name>"`.

use serde::Serialize;

/// Resource types touched by a plan, grouped by action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resource types to be created.
    pub add: Vec<String>,
    /// Resource types to be updated in place.
    pub change: Vec<String>,
    /// Resource types to be destroyed.
    pub destroy: Vec<String>,
}

impl PlanSummary {
    /// Returns true if the plan touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.change.is_empty() && self.destroy.is_empty()
    }

    /// Returns the destroyed resource types that are in the critical set.
    #[must_use]
    pub fn critical_deletions(&self, critical: &[String]) -> Vec<String> {
        self.destroy
            .iter()
            .filter(|t| critical.contains(t))
            .cloned()
            .collect()
    }
}

/// Parses the output of `terraform plan -no-color`.
///
/// Types appear in order of first appearance, without duplicates. A replace
/// (`-/+` or `+/-`) counts as both a destroy and an add. Lines that do not
/// follow a resource header are ignored.
#[must_use]
pub fn parse_plan(text: &str) -> PlanSummary {
    let mut summary = PlanSummary::default();
    let mut after_header = false;

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('#') {
            after_header = true;
            continue;
        }
        if !after_header {
            continue;
        }
        after_header = false;

        let mut tokens = trimmed.split_whitespace();
        let (Some(symbol), Some("resource"), Some(raw_type)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };
        let resource_type = raw_type.trim_matches('"').to_string();

        match symbol {
            "+" => push_unique(&mut summary.add, resource_type),
            "~" => push_unique(&mut summary.change, resource_type),
            "-" => push_unique(&mut summary.destroy, resource_type),
            "-/+" | "+/-" => {
                push_unique(&mut summary.destroy, resource_type.clone());
                push_unique(&mut summary.add, resource_type);
            }
            _ => {}
        }
    }

    summary
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}
